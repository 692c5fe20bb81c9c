/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! STOMP 1.2 frame codec.
//!
//! Frames travel as WebSocket text messages:
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! \n
//! body\0
//! ```
//!
//! A message consisting only of end-of-line characters is a heart-beat.

use std::fmt;
use thiserror::Error;

const NULL: char = '\0';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StompCommand {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl StompCommand {
    fn as_str(&self) -> &'static str {
        match self {
            StompCommand::Connect => "CONNECT",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
            StompCommand::Send => "SEND",
            StompCommand::Message => "MESSAGE",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Error => "ERROR",
            StompCommand::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" | "STOMP" => StompCommand::Connect,
            "CONNECTED" => StompCommand::Connected,
            "SUBSCRIBE" => StompCommand::Subscribe,
            "UNSUBSCRIBE" => StompCommand::Unsubscribe,
            "SEND" => StompCommand::Send,
            "MESSAGE" => StompCommand::Message,
            "RECEIPT" => StompCommand::Receipt,
            "ERROR" => StompCommand::Error,
            "DISCONNECT" => StompCommand::Disconnect,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED frames carry headers verbatim; all others are escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, StompCommand::Connect | StompCommand::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StompError {
    #[error("empty frame")]
    Empty,
    #[error("unknown STOMP command '{0}'")]
    UnknownCommand(String),
    #[error("malformed header line '{0}'")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header '{0}'")]
    InvalidEscape(String),
    #[error("frame is missing the terminating NULL octet")]
    Unterminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn connect(host: &str) -> Self {
        Self::new(StompCommand::Connect)
            .header("accept-version", "1.2,1.1")
            .header("host", host)
            .header("heart-beat", "0,0")
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(StompCommand::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(StompCommand::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Self::new(StompCommand::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    pub fn disconnect() -> Self {
        Self::new(StompCommand::Disconnect)
    }

    /// First value of the named header. Repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NULL);
        out
    }

    /// Decodes one frame.  Returns `Ok(None)` for a heart-beat.
    pub fn decode(text: &str) -> Result<Option<Self>, StompError> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(None);
        }

        let (head, rest) = split_head(text).ok_or(StompError::Unterminated)?;
        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

        let command_line = lines.next().ok_or(StompError::Empty)?;
        let command = StompCommand::parse(command_line)
            .ok_or_else(|| StompError::UnknownCommand(command_line.to_string()))?;
        let unescape = command.escapes_headers();

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
            if unescape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let frame = StompFrame {
            command,
            headers,
            body: String::new(),
        };

        let body = match frame
            .get("content-length")
            .and_then(|len| len.trim().parse::<usize>().ok())
        {
            Some(len) if rest.len() > len && rest.is_char_boundary(len) => {
                if !rest[len..].starts_with(NULL) {
                    return Err(StompError::Unterminated);
                }
                &rest[..len]
            }
            _ => match rest.find(NULL) {
                Some(end) => &rest[..end],
                None => return Err(StompError::Unterminated),
            },
        };

        Ok(Some(StompFrame {
            body: body.to_string(),
            ..frame
        }))
    }
}

fn split_head(text: &str) -> Option<(&str, &str)> {
    if let Some(i) = text.find("\r\n\r\n") {
        // A CRLF-only head is fine, but a LF LF earlier wins.
        if let Some(j) = text.find("\n\n") {
            if j < i {
                return Some((&text[..j], &text[j + 2..]));
            }
        }
        return Some((&text[..i], &text[i + 4..]));
    }
    text.find("\n\n").map(|i| (&text[..i], &text[i + 2..]))
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_send_frame() {
        let frame = StompFrame::send("/app/signal", "{\"type\":\"JOIN_ROOM\"}");
        assert_eq!(
            frame.encode(),
            "SEND\ndestination:/app/signal\ncontent-type:application/json\ncontent-length:20\n\n{\"type\":\"JOIN_ROOM\"}\0"
        );
    }

    #[test]
    fn decodes_message_frame() {
        let text = "MESSAGE\ndestination:/topic/room/r1\nsubscription:sub-0\nmessage-id:7\ncontent-length:2\n\n{}\0";
        let frame = StompFrame::decode(text).unwrap().unwrap();
        assert_eq!(frame.command, StompCommand::Message);
        assert_eq!(frame.get("subscription"), Some("sub-0"));
        assert_eq!(frame.get("destination"), Some("/topic/room/r1"));
        assert_eq!(frame.body, "{}");
    }

    #[test]
    fn decodes_without_content_length() {
        let frame = StompFrame::decode("CONNECTED\nversion:1.2\n\n\0").unwrap().unwrap();
        assert_eq!(frame.command, StompCommand::Connected);
        assert_eq!(frame.get("version"), Some("1.2"));
        assert!(frame.body.is_empty());
    }

    #[test]
    fn body_may_contain_null_when_length_is_given() {
        let text = "MESSAGE\nsubscription:s\ncontent-length:3\n\na\0b\0";
        let frame = StompFrame::decode(text).unwrap().unwrap();
        assert_eq!(frame.body, "a\0b");
    }

    #[test]
    fn heart_beat_is_not_a_frame() {
        assert_eq!(StompFrame::decode("\n").unwrap(), None);
        assert_eq!(StompFrame::decode("\r\n").unwrap(), None);
    }

    #[test]
    fn header_escaping_round_trips_for_non_connect_frames() {
        let frame = StompFrame::new(StompCommand::Message).header("note", "a:b\nc\\d");
        let encoded = frame.encode();
        assert!(encoded.contains("note:a\\cb\\nc\\\\d\n"));
        let decoded = StompFrame::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded.get("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn connect_headers_are_verbatim() {
        let encoded = StompFrame::connect("localhost:8080").encode();
        assert!(encoded.starts_with("CONNECT\naccept-version:1.2,1.1\nhost:localhost:8080\n"));
    }

    #[test]
    fn repeated_headers_keep_first_value() {
        let frame = StompFrame::decode("MESSAGE\nfoo:1\nfoo:2\n\n\0").unwrap().unwrap();
        assert_eq!(frame.get("foo"), Some("1"));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            StompFrame::decode("HELLO\n\n\0"),
            Err(StompError::UnknownCommand("HELLO".into()))
        );
        assert_eq!(
            StompFrame::decode("MESSAGE\nno-colon\n\n\0"),
            Err(StompError::MalformedHeader("no-colon".into()))
        );
        assert_eq!(
            StompFrame::decode("MESSAGE\nsubscription:s\n\nbody"),
            Err(StompError::Unterminated)
        );
        assert!(matches!(
            StompFrame::decode("MESSAGE\nbad:\\x\n\n\0"),
            Err(StompError::InvalidEscape(_))
        ));
    }

    #[test]
    fn error_frame_carries_message_header() {
        let frame = StompFrame::decode("ERROR\nmessage:Access denied\n\ndetails\0")
            .unwrap()
            .unwrap();
        assert_eq!(frame.command, StompCommand::Error);
        assert_eq!(frame.get("message"), Some("Access denied"));
        assert_eq!(frame.body, "details");
    }
}

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

//! Slash commands typed at the prompt.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    ToggleAudio,
    ToggleVideo,
    Share,
    Unshare,
    Mute(String),
    Kick(String),
    Peers,
    Help,
    Leave,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseCommandError {
    #[error("nothing to send")]
    Empty,
    #[error("unknown command: /{0} (try /help)")]
    Unknown(String),
    #[error("/{0} needs a participant id")]
    MissingTarget(String),
}

pub const HELP: &str = "\
/audio          toggle the microphone
/video          toggle the camera
/share          share the screen
/unshare        stop sharing the screen
/mute <id>      ask a participant to mute
/kick <id>      remove a participant
/peers          list participants
/leave          leave the room
anything else is sent as chat";

impl std::str::FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseCommandError::Empty);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Command::Chat(line.to_string()));
        };
        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or_default();
        let mut target = |name: &str| {
            words
                .next()
                .map(str::to_string)
                .ok_or_else(|| ParseCommandError::MissingTarget(name.to_string()))
        };
        match name {
            "audio" => Ok(Command::ToggleAudio),
            "video" => Ok(Command::ToggleVideo),
            "share" => Ok(Command::Share),
            "unshare" => Ok(Command::Unshare),
            "mute" => target(name).map(Command::Mute),
            "kick" => target(name).map(Command::Kick),
            "peers" => Ok(Command::Peers),
            "help" => Ok(Command::Help),
            "leave" | "quit" => Ok(Command::Leave),
            other => Err(ParseCommandError::Unknown(other.to_string())),
        }
    }
}

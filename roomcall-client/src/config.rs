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

//! Client configuration.

use crate::constants::*;
use roomcall_types::RoomId;
use serde::{Deserialize, Serialize};

/// A STUN or TURN server handed to the peer connection backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Settings shared by the signaling channel, the peer backend and the session.
///
/// Missing fields fall back to [`CallConfig::default`] when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket endpoint of the STOMP relay.
    pub signaling_url: String,
    /// Destination every outbound signal is published to.
    pub publish_destination: String,
    /// Prefix of the per-room broadcast topic; the room id is appended.
    pub room_topic_prefix: String,
    pub ice_servers: Vec<IceServer>,
    pub event_bus_capacity: usize,
    /// Capacity of the inbound signal queue between transport and dispatcher.
    pub inbound_buffer: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            publish_destination: DEFAULT_PUBLISH_DESTINATION.to_string(),
            room_topic_prefix: DEFAULT_ROOM_TOPIC_PREFIX.to_string(),
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVER)],
            event_bus_capacity: EVENT_BUS_CAPACITY,
            inbound_buffer: INBOUND_BUFFER,
        }
    }
}

impl CallConfig {
    /// Reads `ROOMCALL_SIGNALING_URL` and `ROOMCALL_ICE_SERVERS` (comma
    /// separated) on top of the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup(SIGNALING_URL_ENV).filter(|v| !v.trim().is_empty()) {
            config.signaling_url = url.trim().to_string();
        }
        if let Some(servers) = lookup(ICE_SERVERS_ENV) {
            let parsed: Vec<IceServer> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(IceServer::new)
                .collect();
            if !parsed.is_empty() {
                config.ice_servers = parsed;
            }
        }
        config
    }

    pub fn room_topic(&self, room: &RoomId) -> String {
        format!("{}{}", self.room_topic_prefix, room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_relay_layout() {
        let config = CallConfig::default();
        assert_eq!(config.signaling_url, "ws://localhost:8080/ws");
        assert_eq!(config.publish_destination, "/app/signal");
        assert_eq!(config.room_topic(&RoomId::from("abc")), "/topic/room/abc");
        assert_eq!(
            config.ice_servers,
            vec![IceServer::new("stun:stun.l.google.com:19302")]
        );
        assert_eq!(config.event_bus_capacity, 256);
    }

    #[test]
    fn env_overrides_url_and_ice_servers() {
        let config = CallConfig::from_lookup(lookup(&[
            ("ROOMCALL_SIGNALING_URL", "wss://relay.example.com/ws"),
            ("ROOMCALL_ICE_SERVERS", "stun:a:3478, turn:b:3478 ,"),
        ]));
        assert_eq!(config.signaling_url, "wss://relay.example.com/ws");
        assert_eq!(
            config.ice_servers,
            vec![IceServer::new("stun:a:3478"), IceServer::new("turn:b:3478")]
        );
    }

    #[test]
    fn blank_env_values_keep_defaults() {
        let config = CallConfig::from_lookup(lookup(&[
            ("ROOMCALL_SIGNALING_URL", "  "),
            ("ROOMCALL_ICE_SERVERS", ""),
        ]));
        assert_eq!(config, CallConfig::default());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: CallConfig =
            serde_json::from_str(r#"{"signaling_url":"ws://10.0.0.2:8080/ws"}"#).unwrap();
        assert_eq!(config.signaling_url, "ws://10.0.0.2:8080/ws");
        assert_eq!(config.inbound_buffer, INBOUND_BUFFER);
    }
}

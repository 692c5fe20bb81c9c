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

//! Typed views of the `data` field of a [`SignalMessage`](crate::SignalMessage).
//!
//! Field names follow the JSON the browser peers produce (`RTCSessionDescription.toJSON()`,
//! `RTCIceCandidate.toJSON()`), so a native participant interoperates with web ones.

use crate::ParticipantId;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description exchanged in OFFER and ANSWER messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate exchanged in ICE_CANDIDATE messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Payload of a CHAT_MESSAGE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub content: String,
    pub sender_name: String,
    /// ISO-8601 capture time, e.g. `2025-01-31T09:30:00.000Z`.
    pub timestamp: String,
}

impl ChatPayload {
    /// Builds a payload stamped with the current time.
    pub fn now(content: impl Into<String>, sender_name: impl Into<String>) -> Self {
        Self::at(content, sender_name, Utc::now())
    }

    pub fn at(
        content: impl Into<String>,
        sender_name: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            content: content.into(),
            sender_name: sender_name.into(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// The capture time, if the sender stamped a valid RFC 3339 timestamp.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Moderation actions a host can address to a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostAction {
    Mute,
    Kick,
    #[serde(other)]
    Unknown,
}

/// Payload of a HOST_ACTION.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostActionPayload {
    pub action: HostAction,
    #[serde(default)]
    pub target_user_id: Option<ParticipantId>,
}

/// Payload the relay attaches to USER_JOINED and USER_LEFT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    #[serde(default)]
    pub user_id: Option<ParticipantId>,
    #[serde(default)]
    pub is_host: Option<bool>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Payload of the JOIN_ROOM announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

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

//! The signaling envelope.

use crate::{ParticipantId, RoomId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Discriminator of a [`SignalMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    JoinRoom,
    LeaveRoom,
    UserJoined,
    UserLeft,
    Offer,
    Answer,
    IceCandidate,
    ChatMessage,
    HostAction,
    /// Any type this client does not understand (the relay knows a few more).
    #[serde(other)]
    Unknown,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SignalType::JoinRoom => "JOIN_ROOM",
            SignalType::LeaveRoom => "LEAVE_ROOM",
            SignalType::UserJoined => "USER_JOINED",
            SignalType::UserLeft => "USER_LEFT",
            SignalType::Offer => "OFFER",
            SignalType::Answer => "ANSWER",
            SignalType::IceCandidate => "ICE_CANDIDATE",
            SignalType::ChatMessage => "CHAT_MESSAGE",
            SignalType::HostAction => "HOST_ACTION",
            SignalType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// The wire-serializable unit of the protocol.
///
/// Immutable once constructed: fields are only reachable through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    kind: SignalType,
    #[serde(default)]
    data: Value,
    room_id: RoomId,
    user_id: ParticipantId,
    #[serde(default)]
    target_user_id: Option<ParticipantId>,
}

impl SignalMessage {
    pub fn new(kind: SignalType, room_id: RoomId, sender: ParticipantId, data: Value) -> Self {
        Self {
            kind,
            data,
            room_id,
            user_id: sender,
            target_user_id: None,
        }
    }

    /// Builds a message whose `data` is the JSON form of `payload`.
    pub fn with_payload<T: Serialize>(
        kind: SignalType,
        room_id: RoomId,
        sender: ParticipantId,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, room_id, sender, serde_json::to_value(payload)?))
    }

    /// Addresses the message to a single participant.
    pub fn to_target(mut self, target: ParticipantId) -> Self {
        self.target_user_id = Some(target);
        self
    }

    pub fn kind(&self) -> SignalType {
        self.kind
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn sender(&self) -> &ParticipantId {
        &self.user_id
    }

    pub fn target(&self) -> Option<&ParticipantId> {
        self.target_user_id.as_ref()
    }

    /// Decodes `data` as the typed payload for this message's type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

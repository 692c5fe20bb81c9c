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

//! The reliable ordered pub/sub channel carrying room signaling.

mod stomp;

pub use stomp::StompSignalChannel;

use crate::error::{CallError, SignalChannelError};
use async_trait::async_trait;
use log::debug;
use roomcall_types::{ParticipantId, RoomId, SignalMessage, SignalType};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connect, subscribe and publish over a room topic.
///
/// The inbound receiver yields messages in relay order and ends when the
/// connection drops. There is no replay; a dropped channel requires a fresh
/// join.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    async fn connect(&self) -> Result<(), SignalChannelError>;

    async fn subscribe(
        &self,
        room: &RoomId,
    ) -> Result<mpsc::Receiver<SignalMessage>, SignalChannelError>;

    async fn publish(&self, message: &SignalMessage) -> Result<(), SignalChannelError>;

    async fn disconnect(&self);
}

/// Outbound half bound to one room and one local participant.
#[derive(Clone)]
pub struct SignalSender {
    channel: Arc<dyn SignalChannel>,
    room_id: RoomId,
    local_id: ParticipantId,
}

impl SignalSender {
    pub fn new(channel: Arc<dyn SignalChannel>, room_id: RoomId, local_id: ParticipantId) -> Self {
        Self {
            channel,
            room_id,
            local_id,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub async fn send<T: Serialize + Sync>(
        &self,
        kind: SignalType,
        payload: &T,
        target: Option<&ParticipantId>,
    ) -> Result<(), CallError> {
        let mut message = SignalMessage::with_payload(
            kind,
            self.room_id.clone(),
            self.local_id.clone(),
            payload,
        )?;
        if let Some(target) = target {
            message = message.to_target(target.clone());
        }
        debug!("-> {kind} to {:?} in {}", target.map(|t| t.as_str()), self.room_id);
        self.channel.publish(&message).await?;
        Ok(())
    }
}

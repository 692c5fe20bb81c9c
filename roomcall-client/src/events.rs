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

//! Framework-agnostic event types for the call client.
//!
//! Events are broadcast on the controller's [`EventBus`](crate::EventBus);
//! any UI layer can subscribe.

use crate::media::MediaState;
use crate::peer::{PeerState, RemoteTrack};
use roomcall_types::{ParticipantId, RoomId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScreenShareEvent {
    Started,
    /// The share ended and the camera track is outbound again.
    Stopped,
    /// Display capture could not be acquired; the call is unaffected.
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaveReason {
    Requested,
    Kicked,
    ConnectionLost,
}

/// Events emitted by the [`CallSessionController`](crate::CallSessionController).
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    // === Session Events ===
    Joined {
        room_id: RoomId,
        local_id: ParticipantId,
    },

    /// The session ended and all of its resources were released.
    Left { reason: LeaveReason },

    /// The signaling channel dropped. A `Left` event follows.
    ConnectionLost(String),

    // === Peer Events ===
    PeerAdded(ParticipantId),

    PeerRemoved(ParticipantId),

    PeerStateChanged {
        peer_id: ParticipantId,
        state: PeerState,
    },

    RemoteTrackAdded {
        peer_id: ParticipantId,
        track: RemoteTrack,
    },

    // === Local Media Events ===
    LocalMediaChanged(MediaState),

    ScreenShareStateChange(ScreenShareEvent),

    /// A host muted the local microphone.
    ForcedMute { by: ParticipantId },
}

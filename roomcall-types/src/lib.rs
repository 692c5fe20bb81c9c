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

//! Wire types for the roomcall signaling protocol.
//!
//! Every message exchanged over the room relay is a [`SignalMessage`]: a JSON object with a
//! `type`, a type-dependent `data` payload, the `roomId`, the sender's `userId` and an optional
//! `targetUserId`.  The typed payloads in [`payload`] describe what `data` holds for each
//! [`SignalType`].

pub mod callback;
pub mod participant;
pub mod payload;
pub mod signal;

pub use callback::Callback;
pub use participant::{ParticipantId, RoomId};
pub use payload::{
    ChatPayload, HostAction, HostActionPayload, IceCandidate, JoinPayload, PresencePayload,
    SdpType, SessionDescription,
};
pub use signal::{SignalMessage, SignalType};

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

//! Peer-to-peer WebRTC room calls over a STOMP signaling relay.
//!
//! A [`CallSessionController`] joins a room, acquires local media through a
//! [`MediaDevices`] implementation and keeps one [`PeerConnection`] per remote
//! participant. Signals from the room flow through the
//! [`SignalingDispatcher`]; negotiation state lives in the
//! [`PeerConnectionManager`]. UI layers observe the call through
//! [`ClientEvent`]s and the chat, host-action and presence observers.
//!
//! The `webrtc` feature provides [`RtcPeerConnectionFactory`]; the `testing`
//! feature provides in-process doubles in [`testing`].

mod client;
mod config;
mod constants;
mod credentials;
mod dispatcher;
mod error;
mod event_bus;
mod events;
pub mod media;
pub mod peer;
pub mod signal_channel;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{CallSessionController, CallSessionOptions};
pub use config::{CallConfig, IceServer};
pub use constants::*;
pub use credentials::{
    AuthRecord, CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore,
};
pub use dispatcher::{
    ChatMessage, DispatchOutcome, ExitReason, HostActionEvent, PresenceEvent, SignalObservers,
    SignalingDispatcher,
};
pub use error::{CallError, MediaAcquisitionError, NegotiationError, SignalChannelError};
pub use event_bus::EventBus;
pub use events::{ClientEvent, LeaveReason, ScreenShareEvent};
pub use media::{
    MediaConstraints, MediaDevices, MediaState, MediaTrack, SyntheticMediaDevices, TrackKind,
    TrackSet, TrackSource,
};
pub use peer::{
    NegotiationRole, ParticipantInfo, PeerConnection, PeerConnectionFactory,
    PeerConnectionManager, PeerState, RemoteTrack,
};
#[cfg(feature = "webrtc")]
pub use peer::RtcPeerConnectionFactory;
pub use signal_channel::{SignalChannel, SignalSender, StompSignalChannel};

pub use roomcall_types::{
    Callback, HostAction, ParticipantId, RoomId, SignalMessage, SignalType,
};

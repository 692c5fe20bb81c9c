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

//! Per-peer WebRTC connections.
//!
//! [`PeerConnection`] is the seam to the WebRTC stack: the `webrtc` feature
//! provides a real backend, the `testing` feature a deterministic fake.
//! [`PeerConnectionManager`] owns one connection per remote participant and
//! drives offer/answer/ICE through it.

mod manager;
#[cfg(feature = "webrtc")]
mod rtc;

pub use manager::{ParticipantInfo, PeerConnectionEntry, PeerConnectionManager, SharedPeerManager};
#[cfg(feature = "webrtc")]
pub use rtc::RtcPeerConnectionFactory;

use crate::error::NegotiationError;
use crate::media::{MediaTrack, TrackKind};
use async_trait::async_trait;
use roomcall_types::{IceCandidate, ParticipantId, SessionDescription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle of a [`PeerConnectionEntry`]. There is no way back from `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::Negotiating => "negotiating",
            PeerState::Connected => "connected",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Caller,
    Callee,
}

/// Offer/answer progress of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// ICE/DTLS connectivity as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Something a connection reports asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    TrackAdded(RemoteTrack),
    ConnectionStateChanged(ConnectionState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEventEnvelope {
    pub peer: ParticipantId,
    /// Identifies which connection to `peer` produced the event; events
    /// from a replaced or closed connection are stale.
    pub generation: u64,
    pub event: PeerEvent,
}

/// Handed to a backend connection so its callbacks can report events.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEventEnvelope>,
}

impl PeerEventSink {
    pub fn new(
        peer: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<PeerEventEnvelope>,
    ) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(PeerEventEnvelope {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// One WebRTC connection to a remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attaches a local track as an outbound sender.
    async fn add_track(&self, track: &MediaTrack) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Swaps the track feeding the outbound video sender without
    /// renegotiating. `Ok(false)` when there is no video sender.
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool, NegotiationError>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer: &ParticipantId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

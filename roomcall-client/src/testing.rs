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

//! In-process doubles for exercising a call without a relay or a WebRTC stack.
//!
//! [`LoopbackRelay`] behaves like the signaling server: it fans every
//! published message out to the room topic and rewrites `JOIN_ROOM` and
//! `LEAVE_ROOM` into presence broadcasts. [`FakePeerConnectionFactory`] hands
//! out connections that negotiate over a toy SDP.

use crate::error::{NegotiationError, SignalChannelError};
use crate::media::{MediaTrack, TrackKind};
use crate::peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink,
    RemoteTrack, SignalingState,
};
use crate::signal_channel::SignalChannel;
use async_trait::async_trait;
use roomcall_types::{
    IceCandidate, JoinPayload, ParticipantId, PresencePayload, RoomId, SdpType,
    SessionDescription, SignalMessage, SignalType,
};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

const SUBSCRIBER_BUFFER: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Polls `check` every 10ms for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

struct Subscriber {
    channel: u64,
    tx: mpsc::Sender<SignalMessage>,
}

#[derive(Default)]
struct RelayState {
    next_channel: u64,
    fail_connect: bool,
    published: Vec<SignalMessage>,
    subscribers: HashMap<RoomId, Vec<Subscriber>>,
    // members in join order; the first one is the host
    members: HashMap<RoomId, Vec<ParticipantId>>,
}

/// A room relay living in the test process.
#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client connection to this relay.
    pub fn channel(&self) -> LoopbackChannel {
        let id = {
            let mut state = lock(&self.state);
            state.next_channel += 1;
            state.next_channel
        };
        LoopbackChannel {
            id,
            relay: self.clone(),
            connected: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent `connect` fail.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).fail_connect = refuse;
    }

    /// Every message clients published, in order, before any rewriting.
    pub fn published(&self) -> Vec<SignalMessage> {
        lock(&self.state).published.clone()
    }

    pub fn published_of(&self, kind: SignalType) -> Vec<SignalMessage> {
        lock(&self.state)
            .published
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }

    /// Delivers `message` to the room as if the server had sent it.
    pub fn inject(&self, message: SignalMessage) {
        let mut state = lock(&self.state);
        broadcast(&mut state, message);
    }

    /// Drops every subscription to `room`, as a lost connection would.
    pub fn drop_room(&self, room: &RoomId) {
        lock(&self.state).subscribers.remove(room);
    }

    pub fn subscriber_count(&self, room: &RoomId) -> usize {
        lock(&self.state)
            .subscribers
            .get(room)
            .map_or(0, Vec::len)
    }

    pub fn members(&self, room: &RoomId) -> Vec<ParticipantId> {
        lock(&self.state)
            .members
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    fn publish(&self, message: &SignalMessage) {
        let mut state = lock(&self.state);
        state.published.push(message.clone());
        let outbound = match message.kind() {
            SignalType::JoinRoom => {
                let room = message.room_id().clone();
                let sender = message.sender().clone();
                let members = state.members.entry(room.clone()).or_default();
                if !members.contains(&sender) {
                    members.push(sender.clone());
                }
                let is_host = members.first() == Some(&sender);
                let display_name = message
                    .payload::<JoinPayload>()
                    .ok()
                    .and_then(|p| p.display_name);
                let presence = PresencePayload {
                    user_id: Some(sender.clone()),
                    is_host: Some(is_host),
                    display_name,
                };
                match SignalMessage::with_payload(SignalType::UserJoined, room, sender, &presence)
                {
                    Ok(m) => m,
                    Err(_) => return,
                }
            }
            SignalType::LeaveRoom => {
                let room = message.room_id().clone();
                let sender = message.sender().clone();
                if let Some(members) = state.members.get_mut(&room) {
                    members.retain(|m| m != &sender);
                }
                SignalMessage::new(
                    SignalType::UserLeft,
                    room,
                    sender.clone(),
                    json!({ "userId": sender }),
                )
            }
            _ => message.clone(),
        };
        broadcast(&mut state, outbound);
    }

    fn subscribe(&self, channel: u64, room: &RoomId) -> mpsc::Receiver<SignalMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        lock(&self.state)
            .subscribers
            .entry(room.clone())
            .or_default()
            .push(Subscriber { channel, tx });
        rx
    }

    fn unsubscribe_all(&self, channel: u64) {
        let mut state = lock(&self.state);
        for subscribers in state.subscribers.values_mut() {
            subscribers.retain(|s| s.channel != channel);
        }
    }
}

fn broadcast(state: &mut RelayState, message: SignalMessage) {
    if let Some(subscribers) = state.subscribers.get_mut(message.room_id()) {
        subscribers.retain(|s| s.tx.try_send(message.clone()).is_ok());
    }
}

/// One client's connection to a [`LoopbackRelay`].
pub struct LoopbackChannel {
    id: u64,
    relay: LoopbackRelay,
    connected: AtomicBool,
}

impl LoopbackChannel {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SignalChannel for LoopbackChannel {
    async fn connect(&self) -> Result<(), SignalChannelError> {
        if lock(&self.relay.state).fail_connect {
            return Err(SignalChannelError::Connect(
                "connection refused".to_string(),
            ));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn subscribe(
        &self,
        room: &RoomId,
    ) -> Result<mpsc::Receiver<SignalMessage>, SignalChannelError> {
        if !self.is_connected() {
            return Err(SignalChannelError::NotConnected);
        }
        Ok(self.relay.subscribe(self.id, room))
    }

    async fn publish(&self, message: &SignalMessage) -> Result<(), SignalChannelError> {
        if !self.is_connected() {
            return Err(SignalChannelError::NotConnected);
        }
        self.relay.publish(message);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.relay.unsubscribe_all(self.id);
    }
}

/// Hands out [`FakePeerConnection`]s and remembers them per peer.
#[derive(Default)]
pub struct FakePeerConnectionFactory {
    created: Mutex<HashMap<ParticipantId, Vec<Arc<FakePeerConnection>>>>,
    next_id: AtomicU64,
}

impl FakePeerConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections created for `peer`, oldest first.
    pub fn connections_for(&self, peer: &ParticipantId) -> Vec<Arc<FakePeerConnection>> {
        lock(&self.created).get(peer).cloned().unwrap_or_default()
    }

    pub fn latest(&self, peer: &ParticipantId) -> Option<Arc<FakePeerConnection>> {
        lock(&self.created)
            .get(peer)
            .and_then(|list| list.last().cloned())
    }

    pub fn total_created(&self) -> usize {
        lock(&self.created).values().map(Vec::len).sum()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerConnectionFactory {
    async fn create(
        &self,
        peer: &ParticipantId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let connection = Arc::new(FakePeerConnection::new(id, events));
        lock(&self.created)
            .entry(peer.clone())
            .or_default()
            .push(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
struct FakeState {
    signaling: Option<SignalingState>,
    local_tracks: Vec<MediaTrack>,
    outbound_video: Option<MediaTrack>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_track_ids: Vec<String>,
    remote_candidates: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
}

/// A connection that negotiates over toy SDP.
///
/// Descriptions list one `a=track:<kind>:<id>` line per local track. Setting
/// a local description reports one host candidate; the connection reports
/// `Connected` once both sides are applied and signaling is stable.
pub struct FakePeerConnection {
    id: u64,
    events: PeerEventSink,
    state: Mutex<FakeState>,
}

impl FakePeerConnection {
    fn new(id: u64, events: PeerEventSink) -> Self {
        Self {
            id,
            events,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        lock(&self.state).local_tracks.clone()
    }

    pub fn outbound_video(&self) -> Option<MediaTrack> {
        lock(&self.state).outbound_video.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).remote_candidates.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote_description.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn describe(&self, kind: SdpType, state: &FakeState) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=-\r\n",
            self.id
        );
        for track in &state.local_tracks {
            let id = match (track.kind(), &state.outbound_video) {
                (TrackKind::Video, Some(video)) => video.id(),
                _ => track.id(),
            };
            sdp.push_str(&format!("a=track:{}:{}\r\n", track.kind(), id));
        }
        SessionDescription { kind, sdp }
    }

    fn check_open(state: &FakeState) -> Result<(), NegotiationError> {
        if state.closed {
            Err(NegotiationError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    // Reports `Connected` once, when both descriptions are in place.
    fn maybe_connected(&self, state: &mut FakeState) {
        if state.connected
            || state.local_description.is_none()
            || state.remote_description.is_none()
            || state.signaling.unwrap_or(SignalingState::Stable) != SignalingState::Stable
        {
            return;
        }
        state.connected = true;
        self.events
            .emit(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
    }
}

fn remote_tracks(sdp: &str) -> impl Iterator<Item = (TrackKind, String)> + '_ {
    sdp.lines().filter_map(|line| {
        let rest = line.trim().strip_prefix("a=track:")?;
        let (kind, id) = rest.split_once(':')?;
        let kind = match kind {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            _ => return None,
        };
        Some((kind, id.to_string()))
    })
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        let mut state = lock(&self.state);
        Self::check_open(&state)?;
        if track.kind() == TrackKind::Video && state.outbound_video.is_none() {
            state.outbound_video = Some(track.clone());
        }
        state.local_tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = lock(&self.state);
        Self::check_open(&state)?;
        Ok(self.describe(SdpType::Offer, &state))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = lock(&self.state);
        Self::check_open(&state)?;
        if state.signaling != Some(SignalingState::HaveRemoteOffer) {
            return Err(NegotiationError::InvalidDescription(
                "no remote offer to answer".to_string(),
            ));
        }
        Ok(self.describe(SdpType::Answer, &state))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut state = lock(&self.state);
        Self::check_open(&state)?;
        let current = state.signaling.unwrap_or(SignalingState::Stable);
        let next = match (description.kind, current) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(NegotiationError::InvalidDescription(format!(
                    "cannot apply local {kind:?} in {current:?}"
                )))
            }
        };
        state.signaling = Some(next);
        state.local_description = Some(description);
        self.events.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.id,
                40000 + self.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }));
        self.maybe_connected(&mut state);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut state = lock(&self.state);
        Self::check_open(&state)?;
        if !description.sdp.starts_with("v=0") {
            return Err(NegotiationError::InvalidDescription(
                "missing version line".to_string(),
            ));
        }
        let current = state.signaling.unwrap_or(SignalingState::Stable);
        let next = match (description.kind, current) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(NegotiationError::InvalidDescription(format!(
                    "cannot apply remote {kind:?} in {current:?}"
                )))
            }
        };
        state.signaling = Some(next);
        let stream_id = self.events.peer().to_string();
        for (kind, id) in remote_tracks(&description.sdp) {
            if state.remote_track_ids.contains(&id) {
                continue;
            }
            state.remote_track_ids.push(id.clone());
            self.events.emit(PeerEvent::TrackAdded(RemoteTrack {
                id,
                kind,
                stream_id: stream_id.clone(),
            }));
        }
        state.remote_description = Some(description);
        self.maybe_connected(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = lock(&self.state);
        Self::check_open(&state)?;
        if state.remote_description.is_none() {
            return Err(NegotiationError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(NegotiationError::InvalidCandidate(candidate.candidate));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool, NegotiationError> {
        let mut state = lock(&self.state);
        Self::check_open(&state)?;
        if state.outbound_video.is_none() {
            return Ok(false);
        }
        state.outbound_video = Some(track.clone());
        Ok(true)
    }

    fn signaling_state(&self) -> SignalingState {
        let state = lock(&self.state);
        if state.closed {
            SignalingState::Closed
        } else {
            state.signaling.unwrap_or(SignalingState::Stable)
        }
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.closed = true;
            self.events
                .emit(PeerEvent::ConnectionStateChanged(ConnectionState::Closed));
        }
    }
}

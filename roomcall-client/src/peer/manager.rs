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

use super::{
    ConnectionState, NegotiationRole, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventEnvelope, PeerEventSink, PeerState, RemoteTrack, SignalingState,
};
use crate::error::{CallError, NegotiationError};
use crate::event_bus::EventBus;
use crate::events::ClientEvent;
use crate::media::{lock_media, MediaTrack, SharedLocalMedia};
use crate::signal_channel::SignalSender;
use log::{debug, info, warn};
use roomcall_types::{IceCandidate, ParticipantId, SdpType, SessionDescription, SignalType};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub type SharedPeerManager = Arc<Mutex<PeerConnectionManager>>;

/// The connection to one remote participant plus what we know about them.
pub struct PeerConnectionEntry {
    id: ParticipantId,
    connection: Arc<dyn PeerConnection>,
    generation: u64,
    role: NegotiationRole,
    state: PeerState,
    remote_tracks: Vec<RemoteTrack>,
    display_name: Option<String>,
    is_host: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    // Set while a colliding remote offer was ignored; its candidates are
    // dropped until our own offer is answered.
    ignored_remote_offer: bool,
}

impl PeerConnectionEntry {
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            state: self.state,
            role: self.role,
            display_name: self.display_name.clone(),
            is_host: self.is_host,
            remote_tracks: self.remote_tracks.len(),
        }
    }
}

/// Read-only view of an entry, for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub state: PeerState,
    pub role: NegotiationRole,
    pub display_name: Option<String>,
    pub is_host: bool,
    pub remote_tracks: usize,
}

fn rank(state: PeerState) -> u8 {
    match state {
        PeerState::New => 0,
        PeerState::Negotiating => 1,
        PeerState::Connected => 2,
        PeerState::Closed => 3,
    }
}

/// Moves `entry` forward to `state`. States never move backwards.
fn advance(entry: &mut PeerConnectionEntry, state: PeerState, events: &EventBus) {
    if rank(state) <= rank(entry.state) {
        return;
    }
    debug!("Peer {} {} -> {}", entry.id, entry.state, state);
    entry.state = state;
    events.emit(ClientEvent::PeerStateChanged {
        peer_id: entry.id.clone(),
        state,
    });
}

/// Owns every [`PeerConnectionEntry`] of a session, keyed by participant id.
///
/// All mutation goes through the operations below. Negotiation failures are
/// returned to the caller, which logs them; the other peers are unaffected.
pub struct PeerConnectionManager {
    local_id: ParticipantId,
    factory: Arc<dyn PeerConnectionFactory>,
    signal: SignalSender,
    local_media: SharedLocalMedia,
    events: EventBus,
    peer_events: mpsc::UnboundedSender<PeerEventEnvelope>,
    entries: HashMap<ParticipantId, PeerConnectionEntry>,
    next_generation: u64,
    closed: bool,
}

impl PeerConnectionManager {
    /// Returns the manager and the stream its connections report events on.
    pub fn new(
        signal: SignalSender,
        factory: Arc<dyn PeerConnectionFactory>,
        local_media: SharedLocalMedia,
        events: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEventEnvelope>) {
        let (peer_events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id: signal.local_id().clone(),
            factory,
            signal,
            local_media,
            events,
            peer_events,
            entries: HashMap::new(),
            next_generation: 0,
            closed: false,
        };
        (manager, rx)
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Returns the entry for `peer`, creating it with every local track
    /// attached if needed.
    pub async fn ensure_connection(
        &mut self,
        peer: &ParticipantId,
        role: NegotiationRole,
    ) -> Result<&PeerConnectionEntry, NegotiationError> {
        self.ensure(peer, role).await?;
        self.entries
            .get(peer)
            .ok_or(NegotiationError::ConnectionClosed)
    }

    async fn ensure(
        &mut self,
        peer: &ParticipantId,
        role: NegotiationRole,
    ) -> Result<(), NegotiationError> {
        if self.entries.contains_key(peer) {
            return Ok(());
        }
        if self.closed {
            return Err(NegotiationError::ConnectionClosed);
        }
        let (connection, generation) = self.open_connection(peer).await?;
        self.entries.insert(
            peer.clone(),
            PeerConnectionEntry {
                id: peer.clone(),
                connection,
                generation,
                role,
                state: PeerState::New,
                remote_tracks: Vec::new(),
                display_name: None,
                is_host: false,
                pending_candidates: Vec::new(),
                remote_description_set: false,
                ignored_remote_offer: false,
            },
        );
        info!("Created connection to {peer} as {role:?}");
        self.events.emit(ClientEvent::PeerAdded(peer.clone()));
        Ok(())
    }

    async fn open_connection(
        &mut self,
        peer: &ParticipantId,
    ) -> Result<(Arc<dyn PeerConnection>, u64), NegotiationError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = PeerEventSink::new(peer.clone(), generation, self.peer_events.clone());
        let connection = self.factory.create(peer, sink).await?;

        let tracks: Vec<MediaTrack> = lock_media(&self.local_media)
            .active()
            .iter()
            .cloned()
            .collect();
        for track in &tracks {
            if let Err(e) = connection.add_track(track).await {
                warn!("Failed to attach {} track {} for {peer}: {e}", track.kind(), track.id());
            }
        }
        Ok((connection, generation))
    }

    /// Swaps a fresh connection into an existing entry, closing the old one.
    async fn reopen(
        &mut self,
        peer: &ParticipantId,
        role: NegotiationRole,
    ) -> Result<(), NegotiationError> {
        let (connection, generation) = self.open_connection(peer).await?;
        let Some(entry) = self.entries.get_mut(peer) else {
            connection.close().await;
            return Err(NegotiationError::ConnectionClosed);
        };
        let old = std::mem::replace(&mut entry.connection, connection);
        entry.generation = generation;
        entry.role = role;
        entry.remote_tracks.clear();
        entry.pending_candidates.clear();
        entry.remote_description_set = false;
        entry.ignored_remote_offer = false;
        old.close().await;
        Ok(())
    }

    fn transition(
        &mut self,
        peer: &ParticipantId,
        state: PeerState,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let entry = self
            .entries
            .get_mut(peer)
            .ok_or(NegotiationError::ConnectionClosed)?;
        advance(entry, state, &self.events);
        Ok(entry.connection.clone())
    }

    /// Creates and sends an offer to `peer`. Also valid on an existing
    /// connection, which renegotiates it.
    pub async fn initiate_offer(&mut self, peer: &ParticipantId) -> Result<(), CallError> {
        self.ensure(peer, NegotiationRole::Caller).await?;
        let connection = self.transition(peer, PeerState::Negotiating)?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        info!("Sending offer to {peer}");
        self.signal.send(SignalType::Offer, &offer, Some(peer)).await
    }

    /// Applies a remote offer and answers it.
    ///
    /// On collision with our own pending offer the smaller participant id
    /// yields: it drops its offer and answers on a fresh connection, while
    /// the larger id ignores the remote offer and waits for its answer.
    pub async fn accept_offer(
        &mut self,
        peer: &ParticipantId,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        if offer.kind != SdpType::Offer {
            return Err(NegotiationError::InvalidDescription(format!(
                "expected an offer from {peer}, got {:?}",
                offer.kind
            ))
            .into());
        }

        let collision = self
            .entries
            .get(peer)
            .is_some_and(|e| e.connection.signaling_state() == SignalingState::HaveLocalOffer);
        if collision {
            if self.local_id < *peer {
                info!("Offer collision with {peer}: yielding and answering");
                self.reopen(peer, NegotiationRole::Callee).await?;
            } else {
                info!("Offer collision with {peer}: keeping our offer");
                if let Some(entry) = self.entries.get_mut(peer) {
                    entry.ignored_remote_offer = true;
                }
                return Ok(());
            }
        }

        self.ensure(peer, NegotiationRole::Callee).await?;
        let connection = self.transition(peer, PeerState::Negotiating)?;
        connection.set_remote_description(offer).await?;
        self.remote_description_applied(peer).await;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        info!("Sending answer to {peer}");
        self.signal.send(SignalType::Answer, &answer, Some(peer)).await
    }

    /// Applies the answer to our offer. An answer for a peer we no longer
    /// know is a late message and is ignored.
    pub async fn accept_answer(
        &mut self,
        peer: &ParticipantId,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        let Some(entry) = self.entries.get(peer) else {
            warn!("Answer from {peer} without a connection; ignoring");
            return Ok(());
        };
        if answer.kind != SdpType::Answer {
            return Err(NegotiationError::InvalidDescription(format!(
                "expected an answer from {peer}, got {:?}",
                answer.kind
            ))
            .into());
        }
        let signaling = entry.connection.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            warn!("Answer from {peer} while {signaling:?}; ignoring");
            return Ok(());
        }
        let connection = entry.connection.clone();
        connection.set_remote_description(answer).await?;
        self.remote_description_applied(peer).await;
        debug!("Applied answer from {peer}");
        Ok(())
    }

    async fn remote_description_applied(&mut self, peer: &ParticipantId) {
        let Some(entry) = self.entries.get_mut(peer) else {
            return;
        };
        entry.remote_description_set = true;
        entry.ignored_remote_offer = false;
        let pending = std::mem::take(&mut entry.pending_candidates);
        let connection = entry.connection.clone();
        if !pending.is_empty() {
            debug!("Flushing {} queued ICE candidates for {peer}", pending.len());
        }
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("Failed to add queued ICE candidate from {peer}: {e}");
            }
        }
    }

    /// Applies a remote ICE candidate. Never fails: a lost candidate only
    /// degrades connectivity.
    pub async fn add_remote_candidate(&mut self, peer: &ParticipantId, candidate: IceCandidate) {
        let Some(entry) = self.entries.get_mut(peer) else {
            debug!("Dropping ICE candidate from unknown peer {peer}");
            return;
        };
        if !entry.remote_description_set {
            if entry.ignored_remote_offer {
                debug!("Dropping ICE candidate for ignored offer from {peer}");
            } else {
                debug!("Queueing ICE candidate from {peer}");
                entry.pending_candidates.push(candidate);
            }
            return;
        }
        let connection = entry.connection.clone();
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate from {peer}: {e}");
        }
    }

    /// Closes and forgets the connection to `peer`. Unknown peers are a no-op.
    pub async fn remove_peer(&mut self, peer: &ParticipantId) -> bool {
        let Some(mut entry) = self.entries.remove(peer) else {
            return false;
        };
        entry.connection.close().await;
        advance(&mut entry, PeerState::Closed, &self.events);
        info!("Removed peer {peer}");
        self.events.emit(ClientEvent::PeerRemoved(peer.clone()));
        true
    }

    /// Feeds `track` into every connection's outbound video sender.
    /// Returns how many connections were switched.
    pub async fn replace_outbound_video_track(&self, track: &MediaTrack) -> usize {
        let mut replaced = 0;
        for (peer, entry) in &self.entries {
            match entry.connection.replace_video_track(track).await {
                Ok(true) => replaced += 1,
                Ok(false) => debug!("No outbound video sender for {peer}"),
                Err(e) => warn!("Failed to replace video track for {peer}: {e}"),
            }
        }
        replaced
    }

    /// Routes an event reported by one of our connections.
    pub async fn handle_peer_event(&mut self, envelope: PeerEventEnvelope) {
        let PeerEventEnvelope {
            peer,
            generation,
            event,
        } = envelope;
        let Some(entry) = self.entries.get_mut(&peer) else {
            debug!("Dropping {event:?} for departed peer {peer}");
            return;
        };
        if entry.generation != generation {
            debug!("Dropping {event:?} from replaced connection to {peer}");
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .signal
                    .send(SignalType::IceCandidate, &candidate, Some(&peer))
                    .await
                {
                    warn!("Failed to send ICE candidate to {peer}: {e}");
                }
            }
            PeerEvent::TrackAdded(track) => {
                debug!("Remote {} track {} from {peer}", track.kind, track.id);
                entry.remote_tracks.push(track.clone());
                self.events.emit(ClientEvent::RemoteTrackAdded {
                    peer_id: peer,
                    track,
                });
            }
            PeerEvent::ConnectionStateChanged(state) => match state {
                ConnectionState::Connecting => {
                    advance(entry, PeerState::Negotiating, &self.events)
                }
                ConnectionState::Connected => {
                    info!("Connected to {peer}");
                    advance(entry, PeerState::Connected, &self.events)
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    warn!("Connection to {peer} is {state:?}")
                }
                ConnectionState::New | ConnectionState::Closed => {
                    debug!("Connection to {peer} is {state:?}")
                }
            },
        }
    }

    /// Closes every connection. No new connection can be created afterwards.
    pub async fn close_all(&mut self) {
        self.closed = true;
        for (peer, mut entry) in self.entries.drain() {
            entry.connection.close().await;
            advance(&mut entry, PeerState::Closed, &self.events);
            self.events.emit(ClientEvent::PeerRemoved(peer));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn get(&self, peer: &ParticipantId) -> Option<&PeerConnectionEntry> {
        self.entries.get(peer)
    }

    pub fn contains(&self, peer: &ParticipantId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peer_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        let mut list: Vec<_> = self.entries.values().map(PeerConnectionEntry::info).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn display_name(&self, peer: &ParticipantId) -> Option<String> {
        self.entries.get(peer).and_then(|e| e.display_name.clone())
    }

    pub fn set_display_name(&mut self, peer: &ParticipantId, name: impl Into<String>) {
        let name = name.into();
        if name.is_empty() {
            return;
        }
        if let Some(entry) = self.entries.get_mut(peer) {
            entry.display_name = Some(name);
        }
    }

    pub fn set_host(&mut self, peer: &ParticipantId, is_host: bool) {
        if let Some(entry) = self.entries.get_mut(peer) {
            entry.is_host = is_host;
        }
    }
}

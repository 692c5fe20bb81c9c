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

//! Classifies inbound signals and routes them.
//!
//! Peer negotiation goes to the [`PeerConnectionManager`]; chat, host actions
//! and presence go to ordered observer lists.

use crate::event_bus::EventBus;
use crate::events::ClientEvent;
use crate::media::{lock_media, SharedLocalMedia};
use crate::peer::{PeerConnectionManager, PeerEventEnvelope, SharedPeerManager};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use roomcall_types::{
    Callback, ChatPayload, HostAction, HostActionPayload, IceCandidate, ParticipantId,
    PresencePayload, RoomId, SessionDescription, SignalMessage, SignalType,
};
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: ParticipantId,
    pub sender_name: String,
    pub content: String,
    /// `None` when the sender's timestamp could not be parsed.
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostActionEvent {
    pub from: ParticipantId,
    pub action: HostAction,
    pub target: Option<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined {
        participant: ParticipantId,
        display_name: Option<String>,
        is_host: bool,
    },
    Left {
        participant: ParticipantId,
    },
}

#[derive(Default)]
struct ObserverLists {
    chat: Vec<Callback<ChatMessage>>,
    host_action: Vec<Callback<HostActionEvent>>,
    presence: Vec<Callback<PresenceEvent>>,
}

/// Ordered observer lists. Callbacks run in registration order; registering
/// never replaces an earlier callback.
#[derive(Clone, Default)]
pub struct SignalObservers {
    lists: Arc<RwLock<ObserverLists>>,
}

impl SignalObservers {
    pub fn on_chat(&self, callback: impl Into<Callback<ChatMessage>>) {
        self.write().chat.push(callback.into());
    }

    pub fn on_host_action(&self, callback: impl Into<Callback<HostActionEvent>>) {
        self.write().host_action.push(callback.into());
    }

    pub fn on_presence(&self, callback: impl Into<Callback<PresenceEvent>>) {
        self.write().presence.push(callback.into());
    }

    // Lists are cloned out so a callback may register further observers.
    fn emit_chat(&self, message: ChatMessage) {
        let callbacks = self.read().chat.clone();
        for cb in callbacks {
            cb.emit(message.clone());
        }
    }

    fn emit_host_action(&self, event: HostActionEvent) {
        let callbacks = self.read().host_action.clone();
        for cb in callbacks {
            cb.emit(event.clone());
        }
    }

    fn emit_presence(&self, event: PresenceEvent) {
        let callbacks = self.read().presence.clone();
        for cb in callbacks {
            cb.emit(event.clone());
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ObserverLists> {
        self.lists.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ObserverLists> {
        self.lists.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for SignalObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.read();
        f.debug_struct("SignalObservers")
            .field("chat", &lists.chat.len())
            .field("host_action", &lists.host_action.len())
            .field("presence", &lists.presence.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    /// A host removed us from the room.
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    Kicked,
    ChannelClosed,
}

pub struct SignalingDispatcher {
    local_id: ParticipantId,
    room_id: RoomId,
    manager: SharedPeerManager,
    local_media: SharedLocalMedia,
    observers: SignalObservers,
    events: EventBus,
    kicked: bool,
}

impl SignalingDispatcher {
    pub fn new(
        local_id: ParticipantId,
        room_id: RoomId,
        manager: SharedPeerManager,
        local_media: SharedLocalMedia,
        observers: SignalObservers,
        events: EventBus,
    ) -> Self {
        Self {
            local_id,
            room_id,
            manager,
            local_media,
            observers,
            events,
            kicked: false,
        }
    }

    /// Echo suppression, target filtering and room filtering.
    pub fn accepts(&self, message: &SignalMessage) -> bool {
        if message.sender() == &self.local_id {
            return false;
        }
        if message.target().is_some_and(|target| target != &self.local_id) {
            return false;
        }
        if message.room_id() != &self.room_id {
            debug!(
                "Ignoring {} for room {} while in {}",
                message.kind(),
                message.room_id(),
                self.room_id
            );
            return false;
        }
        true
    }

    /// Handles one inbound message to completion.
    pub async fn dispatch(&mut self, message: SignalMessage) -> DispatchOutcome {
        if !self.accepts(&message) {
            return DispatchOutcome::Continue;
        }
        let sender = message.sender().clone();
        debug!("<- {} from {sender}", message.kind());

        match message.kind() {
            SignalType::UserJoined => {
                let presence: PresencePayload = decode(&message).unwrap_or_default();
                let mut manager = self.manager.lock().await;
                if let Err(e) = manager.initiate_offer(&sender).await {
                    warn!("Failed to offer to {sender}: {e}");
                }
                if let Some(name) = &presence.display_name {
                    manager.set_display_name(&sender, name.clone());
                }
                manager.set_host(&sender, presence.is_host.unwrap_or(false));
                drop(manager);
                self.observers.emit_presence(PresenceEvent::Joined {
                    participant: sender,
                    display_name: presence.display_name,
                    is_host: presence.is_host.unwrap_or(false),
                });
            }
            SignalType::UserLeft => {
                self.manager.lock().await.remove_peer(&sender).await;
                self.observers
                    .emit_presence(PresenceEvent::Left { participant: sender });
            }
            SignalType::Offer => {
                if let Some(offer) = decode::<SessionDescription>(&message) {
                    let mut manager = self.manager.lock().await;
                    if let Err(e) = manager.accept_offer(&sender, offer).await {
                        warn!("Failed to answer offer from {sender}: {e}");
                    }
                }
            }
            SignalType::Answer => {
                if let Some(answer) = decode::<SessionDescription>(&message) {
                    let mut manager = self.manager.lock().await;
                    if let Err(e) = manager.accept_answer(&sender, answer).await {
                        warn!("Failed to apply answer from {sender}: {e}");
                    }
                }
            }
            SignalType::IceCandidate => {
                if let Some(candidate) = decode::<IceCandidate>(&message) {
                    self.manager
                        .lock()
                        .await
                        .add_remote_candidate(&sender, candidate)
                        .await;
                }
            }
            SignalType::ChatMessage => {
                if let Some(chat) = decode::<ChatPayload>(&message) {
                    self.on_chat(sender, chat).await;
                }
            }
            SignalType::HostAction => {
                if let Some(payload) = decode::<HostActionPayload>(&message) {
                    return self.on_host_action(&message, payload);
                }
            }
            SignalType::JoinRoom | SignalType::LeaveRoom | SignalType::Unknown => {
                debug!("Ignoring {} from {sender}", message.kind());
            }
        }
        DispatchOutcome::Continue
    }

    async fn on_chat(&self, sender: ParticipantId, chat: ChatPayload) {
        let sent_at = chat.sent_at();
        let sender_name = {
            let mut manager = self.manager.lock().await;
            if chat.sender_name.is_empty() {
                manager
                    .display_name(&sender)
                    .unwrap_or_else(|| sender.to_string())
            } else {
                manager.set_display_name(&sender, chat.sender_name.clone());
                chat.sender_name
            }
        };
        self.observers.emit_chat(ChatMessage {
            from: sender,
            sender_name,
            content: chat.content,
            sent_at,
        });
    }

    fn on_host_action(
        &mut self,
        message: &SignalMessage,
        payload: HostActionPayload,
    ) -> DispatchOutcome {
        let target = payload
            .target_user_id
            .clone()
            .or_else(|| message.target().cloned());
        self.observers.emit_host_action(HostActionEvent {
            from: message.sender().clone(),
            action: payload.action,
            target: target.clone(),
        });

        let for_us = message.target() == Some(&self.local_id)
            || payload.target_user_id.as_ref() == Some(&self.local_id);
        if !for_us {
            return DispatchOutcome::Continue;
        }

        match payload.action {
            HostAction::Mute => {
                let state = {
                    let mut media = lock_media(&self.local_media);
                    media.set_audio_enabled(false);
                    media.snapshot()
                };
                info!("Muted by host {}", message.sender());
                self.events.emit(ClientEvent::ForcedMute {
                    by: message.sender().clone(),
                });
                self.events.emit(ClientEvent::LocalMediaChanged(state));
                DispatchOutcome::Continue
            }
            HostAction::Kick if self.kicked => {
                debug!("Ignoring repeated kick from {}", message.sender());
                DispatchOutcome::Continue
            }
            HostAction::Kick => {
                info!("Kicked by host {}", message.sender());
                self.kicked = true;
                DispatchOutcome::Leave
            }
            HostAction::Unknown => {
                debug!("Ignoring unknown host action from {}", message.sender());
                DispatchOutcome::Continue
            }
        }
    }

    /// Processes inbound signals and connection events one at a time until
    /// shutdown, a kick, or the channel closing.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<SignalMessage>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEventEnvelope>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> ExitReason {
        let reason = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break ExitReason::Shutdown,
                message = inbound.recv() => match message {
                    Some(message) => {
                        if self.dispatch(message).await == DispatchOutcome::Leave {
                            break ExitReason::Kicked;
                        }
                    }
                    None => {
                        warn!("Signal channel for room {} closed", self.room_id);
                        self.events.emit(ClientEvent::ConnectionLost(
                            "signal channel closed".to_string(),
                        ));
                        break ExitReason::ChannelClosed;
                    }
                },
                Some(envelope) = peer_events.recv() => {
                    self.manager.lock().await.handle_peer_event(envelope).await;
                }
            }
        };
        debug!("Dispatcher for room {} stopped: {reason:?}", self.room_id);
        reason
    }

    pub fn manager(&self) -> &SharedPeerManager {
        &self.manager
    }
}

fn decode<T: DeserializeOwned>(message: &SignalMessage) -> Option<T> {
    match message.payload::<T>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(
                "Malformed {} payload from {}: {e}",
                message.kind(),
                message.sender()
            );
            None
        }
    }
}

/// Convenience for building a manager already wrapped for sharing.
pub fn share(manager: PeerConnectionManager) -> SharedPeerManager {
    Arc::new(tokio::sync::Mutex::new(manager))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalMediaState, MediaTrack, TrackKind, TrackSet, TrackSource};
    use crate::signal_channel::{SignalChannel, SignalSender};
    use crate::testing::{FakePeerConnectionFactory, LoopbackRelay};
    use serde_json::json;
    use std::sync::Mutex;

    struct Harness {
        dispatcher: SignalingDispatcher,
        observers: SignalObservers,
        events: EventBus,
        media: SharedLocalMedia,
        factory: Arc<FakePeerConnectionFactory>,
    }

    async fn harness() -> Harness {
        let relay = LoopbackRelay::new();
        let channel = relay.channel();
        channel.connect().await.unwrap();
        let room = RoomId::from("r1");
        let local = ParticipantId::from("me");
        let signal = SignalSender::new(Arc::new(channel), room.clone(), local.clone());
        let factory = Arc::new(FakePeerConnectionFactory::new());
        let media: SharedLocalMedia = Arc::new(Mutex::new(LocalMediaState::new(TrackSet::new(
            vec![MediaTrack::new(
                TrackKind::Audio,
                TrackSource::Microphone,
                "mic",
            )],
        ))));
        let events = EventBus::new(64);
        let (manager, _peer_events) =
            PeerConnectionManager::new(signal, factory.clone(), media.clone(), events.clone());
        let observers = SignalObservers::default();
        let dispatcher = SignalingDispatcher::new(
            local,
            room,
            share(manager),
            media.clone(),
            observers.clone(),
            events.clone(),
        );
        Harness {
            dispatcher,
            observers,
            events,
            media,
            factory,
        }
    }

    fn joined(from: &str) -> SignalMessage {
        SignalMessage::new(
            SignalType::UserJoined,
            RoomId::from("r1"),
            ParticipantId::from(from),
            json!({"userId": from, "isHost": false, "displayName": "Bob"}),
        )
    }

    fn host_action(action: &str, target: Option<&str>, payload_target: &str) -> SignalMessage {
        let message = SignalMessage::new(
            SignalType::HostAction,
            RoomId::from("r1"),
            ParticipantId::from("host"),
            json!({"action": action, "targetUserId": payload_target}),
        );
        match target {
            Some(t) => message.to_target(ParticipantId::from(t)),
            None => message,
        }
    }

    #[tokio::test]
    async fn echoes_and_foreign_targets_are_ignored() {
        let mut h = harness().await;
        let chats = Arc::new(Mutex::new(0));
        let presence = Arc::new(Mutex::new(0));
        let (c, p) = (chats.clone(), presence.clone());
        h.observers.on_chat(move |_: ChatMessage| *c.lock().unwrap() += 1);
        h.observers.on_presence(move |_: PresenceEvent| *p.lock().unwrap() += 1);
        let chat_from = |from: &str| {
            SignalMessage::with_payload(
                SignalType::ChatMessage,
                RoomId::from("r1"),
                ParticipantId::from(from),
                &ChatPayload::now("hi", "Someone"),
            )
            .unwrap()
        };

        let own = joined("me");
        assert!(!h.dispatcher.accepts(&own));
        h.dispatcher.dispatch(own).await;
        h.dispatcher.dispatch(chat_from("me")).await;

        let foreign = joined("bob").to_target(ParticipantId::from("carol"));
        assert!(!h.dispatcher.accepts(&foreign));
        h.dispatcher.dispatch(foreign).await;
        h.dispatcher
            .dispatch(chat_from("bob").to_target(ParticipantId::from("carol")))
            .await;
        assert_eq!(*chats.lock().unwrap(), 0);
        assert_eq!(*presence.lock().unwrap(), 0);

        let other_room = SignalMessage::new(
            SignalType::UserJoined,
            RoomId::from("r2"),
            ParticipantId::from("bob"),
            json!({}),
        );
        assert!(!h.dispatcher.accepts(&other_room));

        assert!(h.dispatcher.manager().lock().await.is_empty());
        assert_eq!(h.factory.total_created(), 0);
        assert!(h.dispatcher.accepts(&joined("bob")));
        assert!(h
            .dispatcher
            .accepts(&joined("bob").to_target(ParticipantId::from("me"))));
    }

    #[tokio::test]
    async fn user_joined_offers_and_notifies_presence() {
        let mut h = harness().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.observers
            .on_presence(move |event: PresenceEvent| sink.lock().unwrap().push(event));

        h.dispatcher.dispatch(joined("bob")).await;

        let manager = h.dispatcher.manager().lock().await;
        let bob = ParticipantId::from("bob");
        assert!(manager.contains(&bob));
        assert_eq!(manager.display_name(&bob).as_deref(), Some("Bob"));
        drop(manager);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![PresenceEvent::Joined {
                participant: bob,
                display_name: Some("Bob".to_string()),
                is_host: false,
            }]
        );
    }

    #[tokio::test]
    async fn observers_run_in_registration_order() {
        let mut h = harness().await;
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            h.observers
                .on_chat(move |_: ChatMessage| order.lock().unwrap().push(n));
        }
        let chat = SignalMessage::with_payload(
            SignalType::ChatMessage,
            RoomId::from("r1"),
            ParticipantId::from("bob"),
            &ChatPayload::now("hi", "Bob"),
        )
        .unwrap();
        h.dispatcher.dispatch(chat).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn mute_applies_only_to_the_target() {
        let mut h = harness().await;
        let mut rx = h.events.subscribe();

        let outcome = h
            .dispatcher
            .dispatch(host_action("MUTE", None, "someone-else"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Continue);
        assert!(lock_media(&h.media).audio_enabled());

        h.dispatcher
            .dispatch(host_action("MUTE", None, "me"))
            .await;
        assert!(!lock_media(&h.media).audio_enabled());
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::ForcedMute {
                by: ParticipantId::from("host")
            }
        );
    }

    #[tokio::test]
    async fn kick_leaves_once() {
        let mut h = harness().await;
        let first = h
            .dispatcher
            .dispatch(host_action("KICK", Some("me"), "me"))
            .await;
        let second = h
            .dispatcher
            .dispatch(host_action("KICK", Some("me"), "me"))
            .await;
        assert_eq!(first, DispatchOutcome::Leave);
        assert_eq!(second, DispatchOutcome::Continue);
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let mut h = harness().await;
        let offer = SignalMessage::new(
            SignalType::Offer,
            RoomId::from("r1"),
            ParticipantId::from("bob"),
            json!({"sdp": 42}),
        );
        assert_eq!(h.dispatcher.dispatch(offer).await, DispatchOutcome::Continue);
        assert!(h.dispatcher.manager().lock().await.is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_on_closed_channel() {
        let h = harness().await;
        let (_tx, inbound) = mpsc::channel(4);
        let (_peer_tx, peer_events) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        shutdown_tx.send(()).unwrap();
        assert_eq!(
            h.dispatcher.run(inbound, peer_events, shutdown_rx).await,
            ExitReason::Shutdown
        );

        let h = harness().await;
        let mut rx = h.events.subscribe();
        let (tx, inbound) = mpsc::channel(4);
        drop(tx);
        let (_peer_tx, peer_events) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        assert_eq!(
            h.dispatcher.run(inbound, peer_events, shutdown_rx).await,
            ExitReason::ChannelClosed
        );
        assert!(matches!(
            rx.try_recv(),
            Ok(ClientEvent::ConnectionLost(_))
        ));
    }
}

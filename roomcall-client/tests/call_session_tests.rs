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

//! End-to-end call scenarios over the in-process relay.

use async_broadcast::Receiver;
use async_trait::async_trait;
use roomcall_client::testing::{eventually, FakePeerConnectionFactory, LoopbackRelay};
use roomcall_client::{
    CallConfig, CallError, CallSessionController, CallSessionOptions, ChatMessage, ClientEvent,
    HostAction, HostActionEvent, LeaveReason, MediaAcquisitionError, MediaConstraints,
    MediaDevices, MediaTrack, NegotiationRole, ParticipantId, PeerState, RoomId,
    ScreenShareEvent, SignalChannelError, SignalMessage, SignalType, SyntheticMediaDevices,
    TrackSet, TrackSource,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const ROOM: &str = "r1";

struct Participant {
    id: ParticipantId,
    controller: CallSessionController,
    devices: Arc<SyntheticMediaDevices>,
    factory: Arc<FakePeerConnectionFactory>,
}

impl Participant {
    fn camera(&self) -> MediaTrack {
        self.devices
            .created_tracks()
            .into_iter()
            .find(|t| t.source() == TrackSource::Camera)
            .expect("camera track")
    }

    fn outbound_video_to(&self, peer: &Participant) -> Option<MediaTrack> {
        self.factory
            .latest(&peer.id)
            .and_then(|conn| conn.outbound_video())
    }
}

fn participant(relay: &LoopbackRelay, id: &str) -> Participant {
    let devices = Arc::new(SyntheticMediaDevices::new());
    let factory = Arc::new(FakePeerConnectionFactory::new());
    let controller = CallSessionController::new(CallSessionOptions {
        config: CallConfig::default(),
        local_id: Some(ParticipantId::from(id)),
        channel: Arc::new(relay.channel()),
        devices: devices.clone(),
        factory: factory.clone(),
    });
    Participant {
        id: ParticipantId::from(id),
        controller,
        devices,
        factory,
    }
}

async fn joined(relay: &LoopbackRelay, id: &str, name: &str) -> Participant {
    let p = participant(relay, id);
    p.controller.join(ROOM, name).await.unwrap();
    p
}

async fn connected(p: &Participant, peer: &str) -> bool {
    p.controller
        .participants()
        .await
        .iter()
        .any(|info| info.id.as_str() == peer && info.state == PeerState::Connected)
}

async fn peer_ids(p: &Participant) -> Vec<String> {
    p.controller
        .peer_ids()
        .await
        .into_iter()
        .map(|id| id.to_string())
        .collect()
}

fn drain(rx: &mut Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// alice and bob in the same room with negotiation finished.
async fn pair(relay: &LoopbackRelay) -> (Participant, Participant) {
    let alice = joined(relay, "alice", "Alice").await;
    let bob = joined(relay, "bob", "Bob").await;
    let (a, b) = (&alice, &bob);
    assert!(eventually(move || connected(a, "bob")).await);
    assert!(eventually(move || connected(b, "alice")).await);
    (alice, bob)
}

#[tokio::test]
async fn two_participants_negotiate_to_connected() {
    let relay = LoopbackRelay::new();
    let (alice, bob) = pair(&relay).await;

    // the member already in the room offers to the newcomer
    let offers = relay.published_of(SignalType::Offer);
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].sender(), &alice.id);
    assert_eq!(offers[0].target(), Some(&bob.id));
    let answers = relay.published_of(SignalType::Answer);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].target(), Some(&alice.id));

    let at_alice = alice.controller.participants().await;
    assert_eq!(at_alice.len(), 1);
    assert_eq!(at_alice[0].role, NegotiationRole::Caller);
    assert_eq!(at_alice[0].display_name.as_deref(), Some("Bob"));
    assert_eq!(at_alice[0].remote_tracks, 2);

    let at_bob = bob.controller.participants().await;
    assert_eq!(at_bob.len(), 1);
    assert_eq!(at_bob[0].role, NegotiationRole::Callee);
    assert_eq!(at_bob[0].remote_tracks, 2);

    // both sides exchanged their candidates
    let (a, b) = (&alice, &bob);
    assert!(
        eventually(move || async move {
            a.factory.latest(&b.id).unwrap().remote_candidates().len() == 1
                && b.factory.latest(&a.id).unwrap().remote_candidates().len() == 1
        })
        .await
    );
}

#[tokio::test]
async fn joining_twice_is_rejected() {
    let relay = LoopbackRelay::new();
    let alice = joined(&relay, "alice", "Alice").await;
    let err = alice.controller.join(ROOM, "Alice").await.unwrap_err();
    assert!(matches!(err, CallError::AlreadyJoined));
    assert_eq!(relay.published_of(SignalType::JoinRoom).len(), 1);
    assert_eq!(alice.controller.room_id(), Some(RoomId::from(ROOM)));
}

#[tokio::test]
async fn leave_is_idempotent() {
    let relay = LoopbackRelay::new();
    let (alice, bob) = pair(&relay).await;
    let mut events = alice.controller.subscribe_events();

    alice.controller.leave().await;
    alice.controller.leave().await;

    assert!(!alice.controller.is_joined());
    assert!(alice.controller.local_tracks().is_empty());
    assert!(alice.devices.created_tracks().iter().all(MediaTrack::is_ended));
    assert!(alice.factory.latest(&bob.id).unwrap().is_closed());
    assert_eq!(relay.published_of(SignalType::LeaveRoom).len(), 1);

    let lefts: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ClientEvent::Left { .. }))
        .collect();
    assert_eq!(
        lefts,
        vec![ClientEvent::Left {
            reason: LeaveReason::Requested
        }]
    );

    let b = &bob;
    assert!(eventually(move || async move { b.controller.peer_ids().await.is_empty() }).await);
    assert!(bob.factory.latest(&alice.id).unwrap().is_closed());
}

#[tokio::test]
async fn controller_can_rejoin_after_leaving() {
    let relay = LoopbackRelay::new();
    let (alice, _bob) = pair(&relay).await;
    alice.controller.leave().await;
    alice.controller.join(ROOM, "Alice again").await.unwrap();

    let a = &alice;
    assert!(eventually(move || connected(a, "bob")).await);
    assert_eq!(alice.controller.display_name().as_deref(), Some("Alice again"));
}

/// Camera and microphone that are handed out only once the gate opens.
struct GatedDevices {
    devices: SyntheticMediaDevices,
    gate: watch::Sender<bool>,
    requests: AtomicUsize,
}

impl GatedDevices {
    fn closed() -> Self {
        Self {
            devices: SyntheticMediaDevices::new(),
            gate: watch::channel(false).0,
            requests: AtomicUsize::new(0),
        }
    }

    fn open(&self) {
        self.gate.send_replace(true);
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for GatedDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<TrackSet, MediaAcquisitionError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.devices.get_user_media(constraints).await
    }

    async fn get_display_media(&self) -> Result<TrackSet, MediaAcquisitionError> {
        self.devices.get_display_media().await
    }
}

fn gated_participant(
    relay: &LoopbackRelay,
    id: &str,
) -> (CallSessionController, Arc<GatedDevices>) {
    let devices = Arc::new(GatedDevices::closed());
    let controller = CallSessionController::new(CallSessionOptions {
        config: CallConfig::default(),
        local_id: Some(ParticipantId::from(id)),
        channel: Arc::new(relay.channel()),
        devices: devices.clone(),
        factory: Arc::new(FakePeerConnectionFactory::new()),
    });
    (controller, devices)
}

#[tokio::test]
async fn abandoned_join_does_not_wedge_the_controller() {
    let relay = LoopbackRelay::new();
    let (controller, devices) = gated_participant(&relay, "alice");

    let join = controller.join(ROOM, "Alice");
    assert!(tokio::time::timeout(Duration::from_millis(20), join).await.is_err());
    assert!(!controller.is_joined());
    assert_eq!(devices.requests(), 1);

    devices.open();
    controller.join(ROOM, "Alice").await.unwrap();
    assert!(controller.is_joined());
    assert_eq!(relay.published_of(SignalType::JoinRoom).len(), 1);
}

#[tokio::test]
async fn leave_during_join_cancels_it() {
    let relay = LoopbackRelay::new();
    let (controller, devices) = gated_participant(&relay, "alice");
    let mut events = controller.subscribe_events();

    let pending = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.join(ROOM, "Alice").await })
    };
    let d = &devices;
    assert!(eventually(move || async move { d.requests() == 1 }).await);

    controller.leave().await;
    devices.open();
    let err = pending.await.unwrap().unwrap_err();

    assert!(matches!(err, CallError::JoinCancelled));
    assert!(!controller.is_joined());
    assert!(devices.devices.created_tracks().iter().all(MediaTrack::is_ended));
    assert!(relay.published_of(SignalType::JoinRoom).is_empty());
    assert_eq!(relay.subscriber_count(&RoomId::from(ROOM)), 0);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, ClientEvent::Joined { .. } | ClientEvent::Left { .. })));

    controller.join(ROOM, "Alice").await.unwrap();
    assert!(controller.is_joined());
}

#[tokio::test]
async fn peer_set_tracks_joins_and_leaves() {
    let relay = LoopbackRelay::new();
    let alice = joined(&relay, "alice", "Alice").await;
    let bob = joined(&relay, "bob", "Bob").await;
    let carol = joined(&relay, "carol", "Carol").await;
    let dave = joined(&relay, "dave", "Dave").await;

    let a = &alice;
    assert!(
        eventually(move || async move { peer_ids(a).await == ["bob", "carol", "dave"] }).await
    );

    dave.controller.leave().await;
    carol.controller.leave().await;
    let _erin = joined(&relay, "erin", "Erin").await;

    assert!(eventually(move || async move { peer_ids(a).await == ["bob", "erin"] }).await);
    let b = &bob;
    assert!(eventually(move || async move { peer_ids(b).await == ["alice", "erin"] }).await);
}

#[tokio::test]
async fn own_and_misaddressed_signals_are_ignored() {
    let relay = LoopbackRelay::new();
    let alice = joined(&relay, "alice", "Alice").await;
    let room = RoomId::from(ROOM);

    relay.inject(SignalMessage::new(
        SignalType::UserJoined,
        room.clone(),
        alice.id.clone(),
        json!({"userId": "alice"}),
    ));
    relay.inject(
        SignalMessage::new(
            SignalType::Offer,
            room.clone(),
            ParticipantId::from("mallory"),
            json!({"type": "offer", "sdp": "v=0\r\n"}),
        )
        .to_target(ParticipantId::from("someone-else")),
    );
    relay.inject(
        SignalMessage::new(
            SignalType::HostAction,
            room,
            ParticipantId::from("mallory"),
            json!({"action": "KICK", "targetUserId": "someone-else"}),
        )
        .to_target(ParticipantId::from("someone-else")),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice.controller.is_joined());
    assert!(alice.controller.participants().await.is_empty());
    assert_eq!(alice.factory.total_created(), 0);
}

#[tokio::test]
async fn toggles_are_commutative() {
    let relay = LoopbackRelay::new();
    let alice = participant(&relay, "alice");
    assert!(matches!(
        alice.controller.toggle_audio(),
        Err(CallError::NotJoined)
    ));
    alice.controller.join(ROOM, "Alice").await.unwrap();

    let before = alice.controller.media_state().unwrap();
    assert!(!alice.controller.toggle_audio().unwrap());
    assert!(alice.controller.toggle_audio().unwrap());
    assert!(!alice.controller.toggle_video().unwrap());
    assert!(alice.controller.toggle_video().unwrap());
    assert_eq!(alice.controller.media_state().unwrap(), before);

    // muting never detaches the track
    alice.controller.toggle_video().unwrap();
    assert_eq!(alice.controller.local_tracks().len(), 2);
    assert!(!alice.camera().is_enabled());
    assert!(!alice.camera().is_ended());
}

#[tokio::test]
async fn screen_share_reverts_when_capture_ends() {
    let relay = LoopbackRelay::new();
    let (alice, bob) = pair(&relay).await;
    let camera = alice.camera();
    let mut events = alice.controller.subscribe_events();

    alice.controller.start_screen_share().await.unwrap();
    let screen = alice.devices.display_tracks()[0].clone();
    assert_eq!(alice.outbound_video_to(&bob), Some(screen.clone()));
    assert!(alice.controller.media_state().unwrap().screen_sharing);

    // the capture ends outside the application
    screen.stop();
    let (a, b, cam) = (&alice, &bob, &camera);
    assert!(eventually(move || async move { a.outbound_video_to(b).as_ref() == Some(cam) }).await);
    assert!(!alice.controller.media_state().unwrap().screen_sharing);
    assert!(!camera.is_ended());

    let shares: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ClientEvent::ScreenShareStateChange(change) => Some(change),
            _ => None,
        })
        .collect();
    assert_eq!(
        shares,
        vec![ScreenShareEvent::Started, ScreenShareEvent::Stopped]
    );
}

#[tokio::test]
async fn stop_screen_share_restores_the_camera() {
    let relay = LoopbackRelay::new();
    let (alice, bob) = pair(&relay).await;
    let camera = alice.camera();

    alice.controller.start_screen_share().await.unwrap();
    alice.controller.start_screen_share().await.unwrap();
    let displays = alice.devices.display_tracks();
    assert_eq!(displays.len(), 2);
    assert!(displays[0].is_ended());
    assert_eq!(alice.outbound_video_to(&bob), Some(displays[1].clone()));

    assert!(alice.controller.stop_screen_share().await.unwrap());
    assert!(!alice.controller.stop_screen_share().await.unwrap());
    assert!(displays[1].is_ended());
    assert_eq!(alice.outbound_video_to(&bob), Some(camera.clone()));
    assert_eq!(
        alice.controller.local_tracks().iter().filter(|t| **t == camera).count(),
        1
    );
}

#[tokio::test]
async fn denied_display_capture_keeps_the_call() {
    let relay = LoopbackRelay::new();
    let (alice, bob) = pair(&relay).await;
    alice.devices.deny_display(true);
    let mut events = alice.controller.subscribe_events();

    alice.controller.start_screen_share().await.unwrap();

    assert!(alice.controller.is_joined());
    assert_eq!(alice.outbound_video_to(&bob), Some(alice.camera()));
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        ClientEvent::ScreenShareStateChange(ScreenShareEvent::Failed(_))
    )));
}

#[tokio::test]
async fn kick_leaves_exactly_once() {
    let relay = LoopbackRelay::new();
    let (alice, bob) = pair(&relay).await;
    let mut events = alice.controller.subscribe_events();

    bob.controller
        .send_host_action(HostAction::Kick, &alice.id)
        .await
        .unwrap();
    bob.controller
        .send_host_action(HostAction::Kick, &alice.id)
        .await
        .unwrap();

    let a = &alice;
    assert!(eventually(move || async move { !a.controller.is_joined() }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let lefts: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ClientEvent::Left { .. }))
        .collect();
    assert_eq!(
        lefts,
        vec![ClientEvent::Left {
            reason: LeaveReason::Kicked
        }]
    );
    let alice_leaves = relay
        .published_of(SignalType::LeaveRoom)
        .into_iter()
        .filter(|m| m.sender() == &alice.id)
        .count();
    assert_eq!(alice_leaves, 1);
    assert!(bob.controller.is_joined());
}

#[tokio::test]
async fn host_mute_disables_local_audio() {
    let relay = LoopbackRelay::new();
    let (alice, bob) = pair(&relay).await;
    let actions = Arc::new(Mutex::new(Vec::new()));
    let seen = actions.clone();
    alice
        .controller
        .on_host_action(move |event: HostActionEvent| seen.lock().unwrap().push(event));

    bob.controller
        .send_host_action(HostAction::Mute, &alice.id)
        .await
        .unwrap();

    let a = &alice;
    assert!(
        eventually(move || async move { !a.controller.media_state().unwrap().audio_enabled })
            .await
    );
    assert!(alice.controller.is_joined());
    let actions = actions.lock().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, HostAction::Mute);
    assert_eq!(actions[0].from, bob.id);
}

#[tokio::test]
async fn chat_carries_the_sender_name() {
    let relay = LoopbackRelay::new();
    let (alice, bob) = pair(&relay).await;
    let inbox: Arc<Mutex<Vec<ChatMessage>>> = Arc::default();
    let sink = inbox.clone();
    bob.controller
        .on_chat(move |message: ChatMessage| sink.lock().unwrap().push(message));

    let sent = alice.controller.send_chat("hello").await.unwrap();
    assert_eq!(sent.sender_name, "Alice");

    let inbox_ref = &inbox;
    assert!(eventually(move || async move { inbox_ref.lock().unwrap().len() == 1 }).await);
    let received = inbox.lock().unwrap()[0].clone();
    assert_eq!(received, sent);
    assert!(received.sent_at.is_some());

    let b = &bob;
    assert!(
        eventually(move || async move {
            b.controller.participants().await[0].display_name.as_deref() == Some("Alice")
        })
        .await
    );
}

#[tokio::test]
async fn denied_camera_fails_the_join() {
    let relay = LoopbackRelay::new();
    let alice = participant(&relay, "alice");
    alice.devices.deny_camera(true);

    let err = alice.controller.join(ROOM, "Alice").await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Media(MediaAcquisitionError::PermissionDenied(_))
    ));
    assert!(!alice.controller.is_joined());
    assert!(relay.published().is_empty());

    alice.devices.deny_camera(false);
    alice.controller.join(ROOM, "Alice").await.unwrap();
}

#[tokio::test]
async fn unreachable_relay_fails_the_join() {
    let relay = LoopbackRelay::new();
    relay.refuse_connections(true);
    let alice = participant(&relay, "alice");

    let err = alice.controller.join(ROOM, "Alice").await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Signal(SignalChannelError::Connect(_))
    ));
    assert!(!alice.controller.is_joined());
    assert!(alice.devices.created_tracks().iter().all(MediaTrack::is_ended));
    assert!(matches!(
        alice.controller.send_chat("anyone?").await,
        Err(CallError::NotJoined)
    ));
}

#[tokio::test]
async fn lost_relay_connection_ends_the_session() {
    let relay = LoopbackRelay::new();
    let (alice, _bob) = pair(&relay).await;
    let mut events = alice.controller.subscribe_events();

    relay.drop_room(&RoomId::from(ROOM));

    let a = &alice;
    assert!(eventually(move || async move { !a.controller.is_joined() }).await);
    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::ConnectionLost(_))));
    assert!(events.contains(&ClientEvent::Left {
        reason: LeaveReason::ConnectionLost
    }));
    assert!(alice.devices.created_tracks().iter().all(MediaTrack::is_ended));
}

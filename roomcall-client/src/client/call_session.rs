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

use crate::config::CallConfig;
use crate::dispatcher::{
    share, ChatMessage, ExitReason, HostActionEvent, PresenceEvent, SignalObservers,
    SignalingDispatcher,
};
use crate::error::CallError;
use crate::event_bus::EventBus;
use crate::events::{ClientEvent, LeaveReason, ScreenShareEvent};
use crate::media::{
    lock_media, LocalMediaState, MediaConstraints, MediaDevices, MediaState, MediaTrack,
    SharedLocalMedia, TrackSource,
};
use crate::peer::{
    ParticipantInfo, PeerConnectionFactory, PeerConnectionManager, SharedPeerManager,
};
use crate::signal_channel::{SignalChannel, SignalSender};
use async_broadcast::Receiver;
use log::{debug, error, info, warn};
use roomcall_types::{
    Callback, ChatPayload, HostAction, HostActionPayload, JoinPayload, ParticipantId, RoomId,
    SignalType,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Options struct for constructing a controller via [`CallSessionController::new`].
pub struct CallSessionOptions {
    pub config: CallConfig,

    /// The local participant id. A random one is generated when `None`.
    pub local_id: Option<ParticipantId>,

    /// Connection to the signaling relay.
    pub channel: Arc<dyn SignalChannel>,

    /// Camera, microphone and display capture.
    pub devices: Arc<dyn MediaDevices>,

    /// Creates one peer connection per remote participant.
    pub factory: Arc<dyn PeerConnectionFactory>,
}

enum Lifecycle {
    Idle,
    /// Carries the id of the join attempt in flight.
    Joining(u64),
    Joined(Arc<CallSession>),
}

/// Everything that exists only while joined to a room.
struct CallSession {
    room_id: RoomId,
    display_name: String,
    local_media: SharedLocalMedia,
    manager: SharedPeerManager,
    sender: SignalSender,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    screen_watch: Mutex<Option<JoinHandle<()>>>,
}

impl CallSession {
    fn take_screen_watch(&self) -> Option<JoinHandle<()>> {
        relock(&self.screen_watch).take()
    }

    /// Puts the pre-share video back on every connection if `ended` is the
    /// track being shared.
    async fn revert_screen_share(&self, ended: &MediaTrack, events: &EventBus) -> bool {
        let (camera, state) = {
            let mut media = lock_media(&self.local_media);
            if !media.restore_previous(ended) {
                return false;
            }
            (media.video_track(), media.snapshot())
        };
        if let Some(camera) = camera {
            let replaced = self
                .manager
                .lock()
                .await
                .replace_outbound_video_track(&camera)
                .await;
            debug!("Restored camera track on {replaced} connections");
        }
        info!("Screen share in {} ended", self.room_id);
        events.emit(ClientEvent::ScreenShareStateChange(ScreenShareEvent::Stopped));
        events.emit(ClientEvent::LocalMediaChanged(state));
        true
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    config: CallConfig,
    local_id: ParticipantId,
    channel: Arc<dyn SignalChannel>,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    events: EventBus,
    observers: SignalObservers,
    lifecycle: Mutex<Lifecycle>,
    join_attempts: AtomicU64,
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        relock(&self.lifecycle)
    }
}

/// Resources held by a join that has not reached `Joined` yet.
///
/// Whatever is still held when the attempt is dropped gets released and the
/// controller returns to `Idle`.
struct JoinAttempt {
    inner: Arc<Inner>,
    id: u64,
    media: Option<SharedLocalMedia>,
    channel_open: bool,
    announced: Option<SignalSender>,
}

impl JoinAttempt {
    fn new(inner: Arc<Inner>, id: u64) -> Self {
        Self {
            inner,
            id,
            media: None,
            channel_open: false,
            announced: None,
        }
    }

    fn is_current(&self, lifecycle: &Lifecycle) -> bool {
        matches!(lifecycle, Lifecycle::Joining(id) if *id == self.id)
    }

    fn ensure_current(&self) -> Result<(), CallError> {
        if self.is_current(&self.inner.lifecycle()) {
            Ok(())
        } else {
            Err(CallError::JoinCancelled)
        }
    }

    /// Hands the held resources over to the session.
    fn commit(&mut self) {
        self.media = None;
        self.channel_open = false;
        self.announced = None;
    }

    /// Returns to `Idle` and releases what the attempt acquired.
    async fn abandon(mut self) {
        let idle = self.reset();
        if let Some(sender) = self.announced.take() {
            if let Err(e) = sender.send(SignalType::LeaveRoom, &json!({}), None).await {
                debug!("LEAVE_ROOM for abandoned join not delivered: {e}");
            }
        }
        if std::mem::take(&mut self.channel_open) && idle {
            self.inner.channel.disconnect().await;
        }
    }

    // Returns true when no other join has started since this one, in which
    // case the shared channel is still ours to close.
    fn reset(&mut self) -> bool {
        let idle = {
            let mut lifecycle = self.inner.lifecycle();
            if self.is_current(&lifecycle) {
                *lifecycle = Lifecycle::Idle;
            }
            matches!(*lifecycle, Lifecycle::Idle)
        };
        if let Some(media) = self.media.take() {
            let stopped = lock_media(&media).stop_all();
            debug!("Join attempt {} released {stopped} local tracks", self.id);
        }
        idle
    }
}

impl Drop for JoinAttempt {
    fn drop(&mut self) {
        let idle = self.reset();
        let announced = self.announced.take();
        if !std::mem::take(&mut self.channel_open) || !idle {
            return;
        }
        let channel = self.inner.channel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Join attempt {} cancelled, closing signal channel", self.id);
                handle.spawn(async move {
                    if let Some(sender) = announced {
                        let _ = sender.send(SignalType::LeaveRoom, &json!({}), None).await;
                    }
                    channel.disconnect().await;
                });
            }
            Err(_) => warn!("Join attempt {} dropped outside a runtime", self.id),
        }
    }
}

/// The client handle for a room call.
///
/// Construct it with [`new(options)`][Self::new], then [`join`][Self::join] a
/// room. Signals from the room are dispatched on a background task until
/// [`leave`][Self::leave] is called, a host kicks us, or the signaling
/// connection drops. The controller can join again after leaving.
///
/// The controller is cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct CallSessionController {
    inner: Arc<Inner>,
}

impl CallSessionController {
    pub fn new(options: CallSessionOptions) -> Self {
        let local_id = options.local_id.unwrap_or_else(ParticipantId::generate);
        let events = EventBus::new(options.config.event_bus_capacity);
        info!("Created call client {local_id}");
        Self {
            inner: Arc::new(Inner {
                config: options.config,
                local_id,
                channel: options.channel,
                devices: options.devices,
                factory: options.factory,
                events,
                observers: SignalObservers::default(),
                lifecycle: Mutex::new(Lifecycle::Idle),
                join_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Joins `room_id`, announcing ourselves as `display_name`.
    ///
    /// Acquires camera and microphone, connects the signal channel,
    /// subscribes to the room and publishes `JOIN_ROOM`. Nothing is retried:
    /// a failure leaves the controller idle with every acquired resource
    /// released. The same holds when the returned future is dropped before
    /// it completes, or when [`leave`][Self::leave] is called while the join
    /// is in flight; the latter fails the join with
    /// [`CallError::JoinCancelled`].
    pub async fn join(
        &self,
        room_id: impl Into<RoomId>,
        display_name: impl Into<String>,
    ) -> Result<(), CallError> {
        let mut attempt = {
            let mut lifecycle = self.inner.lifecycle();
            if !matches!(*lifecycle, Lifecycle::Idle) {
                return Err(CallError::AlreadyJoined);
            }
            let id = self.inner.join_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            *lifecycle = Lifecycle::Joining(id);
            JoinAttempt::new(self.inner.clone(), id)
        };

        let room_id = room_id.into();
        let display_name = display_name.into();
        match self
            .establish(&mut attempt, room_id.clone(), display_name)
            .await
        {
            Ok(()) => {
                info!("Joined room {room_id} as {}", self.inner.local_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to join room {room_id}: {e}");
                attempt.abandon().await;
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        attempt: &mut JoinAttempt,
        room_id: RoomId,
        display_name: String,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let tracks = inner
            .devices
            .get_user_media(MediaConstraints::default())
            .await?;
        let local_media: SharedLocalMedia = Arc::new(Mutex::new(LocalMediaState::new(tracks)));
        attempt.media = Some(local_media.clone());
        attempt.ensure_current()?;

        inner.channel.connect().await?;
        attempt.channel_open = true;
        let inbound = inner.channel.subscribe(&room_id).await?;
        debug!("Subscribed to {}", inner.config.room_topic(&room_id));
        attempt.ensure_current()?;

        let sender = SignalSender::new(
            inner.channel.clone(),
            room_id.clone(),
            inner.local_id.clone(),
        );
        let (manager, peer_events) = PeerConnectionManager::new(
            sender.clone(),
            inner.factory.clone(),
            local_media.clone(),
            inner.events.clone(),
        );
        let manager = share(manager);
        let dispatcher = SignalingDispatcher::new(
            inner.local_id.clone(),
            room_id.clone(),
            manager.clone(),
            local_media.clone(),
            inner.observers.clone(),
            inner.events.clone(),
        );

        let announce = JoinPayload {
            display_name: Some(display_name.clone()).filter(|n| !n.is_empty()),
        };
        sender.send(SignalType::JoinRoom, &announce, None).await?;
        attempt.announced = Some(sender.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let session = Arc::new(CallSession {
            room_id: room_id.clone(),
            display_name,
            local_media,
            manager,
            sender,
            shutdown: Mutex::new(Some(shutdown_tx)),
            screen_watch: Mutex::new(None),
        });
        {
            let mut lifecycle = inner.lifecycle();
            if !attempt.is_current(&lifecycle) {
                return Err(CallError::JoinCancelled);
            }
            *lifecycle = Lifecycle::Joined(session.clone());
        }
        attempt.commit();
        inner.events.emit(ClientEvent::Joined {
            room_id,
            local_id: inner.local_id.clone(),
        });

        let weak_inner = Arc::downgrade(&self.inner);
        let weak_session = Arc::downgrade(&session);
        tokio::spawn(async move {
            let reason = match dispatcher.run(inbound, peer_events, shutdown_rx).await {
                ExitReason::Shutdown => return,
                ExitReason::Kicked => LeaveReason::Kicked,
                ExitReason::ChannelClosed => LeaveReason::ConnectionLost,
            };
            if let (Some(inner), Some(session)) = (weak_inner.upgrade(), weak_session.upgrade()) {
                CallSessionController { inner }
                    .end_session(reason, Some(&session))
                    .await;
            }
        });
        Ok(())
    }

    /// Leaves the room and releases every resource of the session.
    /// Cancels a join still in flight. A no-op when idle.
    pub async fn leave(&self) {
        self.end_session(LeaveReason::Requested, None).await;
    }

    // `expected` pins the teardown to one session so a background task
    // cannot end a session started after its own.
    async fn end_session(&self, reason: LeaveReason, expected: Option<&Arc<CallSession>>) {
        let session = {
            let mut lifecycle = self.inner.lifecycle();
            match &*lifecycle {
                Lifecycle::Joined(current)
                    if expected.map_or(true, |e| Arc::ptr_eq(e, current)) => {}
                // The join in flight sees this and releases what it holds.
                Lifecycle::Joining(id) if expected.is_none() => {
                    info!("Cancelling join attempt {id}");
                    *lifecycle = Lifecycle::Idle;
                    return;
                }
                _ => return,
            }
            match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
                Lifecycle::Joined(session) => session,
                _ => return,
            }
        };

        if let Some(watch) = session.take_screen_watch() {
            watch.abort();
        }
        if let Some(shutdown) = relock(&session.shutdown).take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = session.sender.send(SignalType::LeaveRoom, &json!({}), None).await {
            debug!("LEAVE_ROOM for {} not delivered: {e}", session.room_id);
        }
        session.manager.lock().await.close_all().await;
        let stopped = lock_media(&session.local_media).stop_all();
        self.inner.channel.disconnect().await;

        info!(
            "Left room {} ({reason:?}), stopped {stopped} local tracks",
            session.room_id
        );
        self.inner.events.emit(ClientEvent::Left { reason });
    }

    fn session(&self) -> Result<Arc<CallSession>, CallError> {
        match &*self.inner.lifecycle() {
            Lifecycle::Joined(session) => Ok(session.clone()),
            _ => Err(CallError::NotJoined),
        }
    }

    fn is_current(&self, session: &Arc<CallSession>) -> bool {
        matches!(
            &*self.inner.lifecycle(),
            Lifecycle::Joined(current) if Arc::ptr_eq(current, session)
        )
    }

    /// Flips the microphone. Returns whether audio is now enabled.
    pub fn toggle_audio(&self) -> Result<bool, CallError> {
        let session = self.session()?;
        let (enabled, state) = {
            let mut media = lock_media(&session.local_media);
            (media.toggle_audio(), media.snapshot())
        };
        debug!("Audio {}", if enabled { "enabled" } else { "disabled" });
        self.inner.events.emit(ClientEvent::LocalMediaChanged(state));
        Ok(enabled)
    }

    /// Flips the outbound video. Returns whether video is now enabled.
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        let session = self.session()?;
        let (enabled, state) = {
            let mut media = lock_media(&session.local_media);
            (media.toggle_video(), media.snapshot())
        };
        debug!("Video {}", if enabled { "enabled" } else { "disabled" });
        self.inner.events.emit(ClientEvent::LocalMediaChanged(state));
        Ok(enabled)
    }

    /// Sends a display capture in place of the camera on every connection.
    ///
    /// When the capture ends, from [`stop_screen_share`][Self::stop_screen_share]
    /// or from outside the application, the camera is restored. A capture
    /// that cannot be acquired is reported as
    /// [`ScreenShareEvent::Failed`] and the call carries on.
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        let session = self.session()?;
        let display = match self.inner.devices.get_display_media().await {
            Ok(display) => display,
            Err(e) => {
                warn!("Screen share unavailable: {e}");
                self.inner
                    .events
                    .emit(ClientEvent::ScreenShareStateChange(ScreenShareEvent::Failed(
                        e.to_string(),
                    )));
                return Ok(());
            }
        };
        let Some(screen) = display.video().cloned() else {
            warn!("Display capture returned no video track");
            display.iter().for_each(|t| {
                t.stop();
            });
            self.inner
                .events
                .emit(ClientEvent::ScreenShareStateChange(ScreenShareEvent::Failed(
                    "no video track".to_string(),
                )));
            return Ok(());
        };
        for extra in display.iter().filter(|t| **t != screen) {
            extra.stop();
        }
        if !self.is_current(&session) {
            screen.stop();
            return Err(CallError::NotJoined);
        }

        if let Some(watch) = session.take_screen_watch() {
            watch.abort();
        }
        let (displaced, state) = {
            let mut media = lock_media(&session.local_media);
            let displaced = media.substitute_video(screen.clone());
            (displaced, media.snapshot())
        };
        if let Some(previous_share) = displaced.filter(|t| t.source() == TrackSource::Display) {
            previous_share.stop();
        }
        let replaced = session
            .manager
            .lock()
            .await
            .replace_outbound_video_track(&screen)
            .await;
        info!("Sharing screen with {replaced} connections");

        let events = self.inner.events.clone();
        let watched = Arc::downgrade(&session);
        let track = screen.clone();
        let watch = tokio::spawn(async move {
            track.ended().await;
            if let Some(session) = Weak::upgrade(&watched) {
                session.revert_screen_share(&track, &events).await;
            }
        });
        *relock(&session.screen_watch) = Some(watch);

        self.inner
            .events
            .emit(ClientEvent::ScreenShareStateChange(ScreenShareEvent::Started));
        self.inner.events.emit(ClientEvent::LocalMediaChanged(state));
        Ok(())
    }

    /// Ends the screen share and restores the camera. Returns `false` when
    /// nothing was being shared.
    pub async fn stop_screen_share(&self) -> Result<bool, CallError> {
        let session = self.session()?;
        let Some(screen) = lock_media(&session.local_media).screen_track() else {
            return Ok(false);
        };
        if let Some(watch) = session.take_screen_watch() {
            watch.abort();
        }
        screen.stop();
        Ok(session
            .revert_screen_share(&screen, &self.inner.events)
            .await)
    }

    /// Publishes a chat message to the room and returns it as the other
    /// participants will see it.
    pub async fn send_chat(&self, content: impl Into<String>) -> Result<ChatMessage, CallError> {
        let session = self.session()?;
        let payload = ChatPayload::now(content, session.display_name.clone());
        session
            .sender
            .send(SignalType::ChatMessage, &payload, None)
            .await?;
        Ok(ChatMessage {
            from: self.inner.local_id.clone(),
            sent_at: payload.sent_at(),
            sender_name: payload.sender_name,
            content: payload.content,
        })
    }

    /// Asks `target` to apply a moderation action. Nothing checks that we
    /// are actually the host.
    pub async fn send_host_action(
        &self,
        action: HostAction,
        target: &ParticipantId,
    ) -> Result<(), CallError> {
        let session = self.session()?;
        let payload = HostActionPayload {
            action,
            target_user_id: Some(target.clone()),
        };
        info!("Sending {action:?} to {target}");
        session
            .sender
            .send(SignalType::HostAction, &payload, Some(target))
            .await
    }

    pub fn is_joined(&self) -> bool {
        matches!(*self.inner.lifecycle(), Lifecycle::Joined(_))
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.inner.local_id
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.session().ok().map(|s| s.room_id.clone())
    }

    pub fn display_name(&self) -> Option<String> {
        self.session().ok().map(|s| s.display_name.clone())
    }

    /// The tracks currently attached to outbound connections.
    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        match self.session() {
            Ok(session) => lock_media(&session.local_media).active().iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn media_state(&self) -> Option<MediaState> {
        self.session()
            .ok()
            .map(|s| lock_media(&s.local_media).snapshot())
    }

    /// Remote participants we hold a connection to, sorted by id.
    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        match self.session() {
            Ok(session) => session.manager.lock().await.participants(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn peer_ids(&self) -> Vec<ParticipantId> {
        match self.session() {
            Ok(session) => session.manager.lock().await.peer_ids(),
            Err(_) => Vec::new(),
        }
    }

    pub fn subscribe_events(&self) -> Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Registers a chat observer. Observers outlive sessions and run in
    /// registration order.
    pub fn on_chat(&self, callback: impl Into<Callback<ChatMessage>>) {
        self.inner.observers.on_chat(callback);
    }

    pub fn on_host_action(&self, callback: impl Into<Callback<HostActionEvent>>) {
        self.inner.observers.on_host_action(callback);
    }

    pub fn on_presence(&self, callback: impl Into<Callback<PresenceEvent>>) {
        self.inner.observers.on_presence(callback);
    }
}

impl std::fmt::Debug for CallSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionController")
            .field("local_id", &self.inner.local_id)
            .field("joined", &self.is_joined())
            .finish()
    }
}

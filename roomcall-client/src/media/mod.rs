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

//! Local media tracks and the capture capability.
//!
//! Capture itself is an external collaborator behind [`MediaDevices`]; this
//! module only models the tracks it hands back.

mod local;
mod synthetic;

pub use local::{lock_media, LocalMediaState, MediaState, SharedLocalMedia};
pub use synthetic::SyntheticMediaDevices;

use crate::error::MediaAcquisitionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// A local media track. Clones share the same underlying track, so toggling
/// or stopping one clone is visible through every other.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Ends the track. Returns `true` only for the call that actually ended it.
    pub fn stop(&self) -> bool {
        !self.inner.ended.send_replace(true)
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has ended, whoever stopped it.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// An ordered set of local tracks, as returned by a capture call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSet {
    tracks: Vec<MediaTrack>,
}

impl TrackSet {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn push(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    pub fn audio(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn of_kind(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub(crate) fn tracks_mut(&mut self) -> &mut Vec<MediaTrack> {
        &mut self.tracks
    }
}

impl IntoIterator for TrackSet {
    type Item = MediaTrack;
    type IntoIter = std::vec::IntoIter<MediaTrack>;

    fn into_iter(self) -> Self::IntoIter {
        self.tracks.into_iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Camera, microphone and display capture.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<TrackSet, MediaAcquisitionError>;

    async fn get_display_media(&self) -> Result<TrackSet, MediaAcquisitionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_reported_once() {
        let track = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        assert!(!track.is_ended());
        assert!(track.stop());
        assert!(!track.stop());
        assert!(track.clone().is_ended());
    }

    #[test]
    fn clones_share_enabled_flag() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        let other = track.clone();
        other.set_enabled(false);
        assert!(!track.is_enabled());
        assert_eq!(track, other);
        assert_ne!(
            track,
            MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam")
        );
    }

    #[tokio::test]
    async fn ended_resolves_after_stop() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Display, "screen");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        tokio::task::yield_now().await;
        track.stop();
        waiter.await.unwrap();

        // already ended tracks resolve immediately
        track.ended().await;
    }

    #[test]
    fn track_set_lookup_by_kind() {
        let mic = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let cam = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        let set = TrackSet::new(vec![mic.clone(), cam.clone()]);
        assert_eq!(set.audio(), Some(&mic));
        assert_eq!(set.video(), Some(&cam));
        assert_eq!(set.of_kind(TrackKind::Audio).count(), 1);
        assert_eq!(set.len(), 2);
    }
}

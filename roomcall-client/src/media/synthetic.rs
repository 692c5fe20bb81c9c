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

use super::{MediaConstraints, MediaDevices, MediaTrack, TrackKind, TrackSet, TrackSource};
use crate::error::MediaAcquisitionError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Capture devices that hand out label-only tracks.
///
/// Used by headless participants and tests. Camera and display capture can
/// be denied to exercise the failure paths.
#[derive(Debug, Default)]
pub struct SyntheticMediaDevices {
    deny_camera: AtomicBool,
    deny_display: AtomicBool,
    created: Mutex<Vec<MediaTrack>>,
}

impl SyntheticMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_camera(&self, deny: bool) {
        self.deny_camera.store(deny, Ordering::Release);
    }

    pub fn deny_display(&self, deny: bool) {
        self.deny_display.store(deny, Ordering::Release);
    }

    /// Every track handed out so far, in creation order.
    pub fn created_tracks(&self) -> Vec<MediaTrack> {
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn display_tracks(&self) -> Vec<MediaTrack> {
        self.created_tracks()
            .into_iter()
            .filter(|t| t.source() == TrackSource::Display)
            .collect()
    }

    fn make(&self, kind: TrackKind, source: TrackSource, label: &str) -> MediaTrack {
        let track = MediaTrack::new(kind, source, label);
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for SyntheticMediaDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<TrackSet, MediaAcquisitionError> {
        if self.deny_camera.load(Ordering::Acquire) {
            return Err(MediaAcquisitionError::PermissionDenied(
                "camera and microphone".to_string(),
            ));
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaAcquisitionError::Unavailable(
                "no media requested".to_string(),
            ));
        }
        let mut set = TrackSet::default();
        if constraints.audio {
            set.push(self.make(TrackKind::Audio, TrackSource::Microphone, "Synthetic microphone"));
        }
        if constraints.video {
            set.push(self.make(TrackKind::Video, TrackSource::Camera, "Synthetic camera"));
        }
        Ok(set)
    }

    async fn get_display_media(&self) -> Result<TrackSet, MediaAcquisitionError> {
        if self.deny_display.load(Ordering::Acquire) {
            return Err(MediaAcquisitionError::PermissionDenied("display".to_string()));
        }
        Ok(TrackSet::new(vec![self.make(
            TrackKind::Video,
            TrackSource::Display,
            "Synthetic display",
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hands_out_requested_tracks() {
        let devices = SyntheticMediaDevices::new();
        let set = devices
            .get_user_media(MediaConstraints::default())
            .await
            .unwrap();
        assert!(set.audio().is_some());
        assert_eq!(set.video().map(|t| t.source()), Some(TrackSource::Camera));
        assert_eq!(devices.created_tracks().len(), 2);
    }

    #[tokio::test]
    async fn denial_is_reported() {
        let devices = SyntheticMediaDevices::new();
        devices.deny_camera(true);
        devices.deny_display(true);
        assert!(matches!(
            devices.get_user_media(MediaConstraints::default()).await,
            Err(MediaAcquisitionError::PermissionDenied(_))
        ));
        assert!(devices.get_display_media().await.is_err());
        assert!(devices.created_tracks().is_empty());
    }
}

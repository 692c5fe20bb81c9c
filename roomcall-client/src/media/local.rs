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

use super::{MediaTrack, TrackKind, TrackSet, TrackSource};
use std::sync::{Arc, Mutex, MutexGuard};

pub type SharedLocalMedia = Arc<Mutex<LocalMediaState>>;

/// Locks the shared local media, recovering from a poisoned lock.
pub fn lock_media(media: &SharedLocalMedia) -> MutexGuard<'_, LocalMediaState> {
    media.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Flags surfaced to the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

/// The local track set of a session.
///
/// While a screen share is active the camera set is parked in `previous`
/// and the display track takes the video slot of `active`.
#[derive(Debug, Default)]
pub struct LocalMediaState {
    active: TrackSet,
    previous: Option<TrackSet>,
}

impl LocalMediaState {
    pub fn new(tracks: TrackSet) -> Self {
        Self {
            active: tracks,
            previous: None,
        }
    }

    pub fn active(&self) -> &TrackSet {
        &self.active
    }

    pub fn video_track(&self) -> Option<MediaTrack> {
        self.active.video().cloned()
    }

    pub fn audio_enabled(&self) -> bool {
        self.kind_enabled(TrackKind::Audio)
    }

    pub fn video_enabled(&self) -> bool {
        self.kind_enabled(TrackKind::Video)
    }

    fn kind_enabled(&self, kind: TrackKind) -> bool {
        self.active.of_kind(kind).any(MediaTrack::is_enabled)
    }

    pub fn toggle_audio(&mut self) -> bool {
        let enabled = !self.audio_enabled();
        self.set_enabled(TrackKind::Audio, enabled)
    }

    pub fn toggle_video(&mut self) -> bool {
        let enabled = !self.video_enabled();
        self.set_enabled(TrackKind::Video, enabled)
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Audio, enabled)
    }

    fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> bool {
        for track in self.active.of_kind(kind) {
            track.set_enabled(enabled);
        }
        self.kind_enabled(kind)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.previous.is_some()
    }

    /// Puts `screen` in the video slot and returns the track it displaced.
    ///
    /// The pre-share set is saved only on the first substitution, so a second
    /// share still reverts to the camera.
    pub fn substitute_video(&mut self, screen: MediaTrack) -> Option<MediaTrack> {
        if self.previous.is_none() {
            self.previous = Some(self.active.clone());
        }
        let tracks = self.active.tracks_mut();
        match tracks.iter().position(|t| t.kind() == TrackKind::Video) {
            Some(index) => Some(std::mem::replace(&mut tracks[index], screen)),
            None => {
                tracks.push(screen);
                None
            }
        }
    }

    /// Restores the pre-share set if `ended` is the track currently in the
    /// video slot. Returns whether anything was restored.
    pub fn restore_previous(&mut self, ended: &MediaTrack) -> bool {
        if self.active.video() != Some(ended) {
            return false;
        }
        match self.previous.take() {
            Some(previous) => {
                self.active = previous;
                true
            }
            None => false,
        }
    }

    /// Stops every track, including a parked camera, and empties the state.
    /// Returns how many tracks this call actually stopped.
    pub fn stop_all(&mut self) -> usize {
        let parked = self.previous.take().unwrap_or_default();
        let active = std::mem::take(&mut self.active);
        active
            .into_iter()
            .chain(parked)
            .filter(|track| track.stop())
            .count()
    }

    pub fn snapshot(&self) -> MediaState {
        MediaState {
            audio_enabled: self.audio_enabled(),
            video_enabled: self.video_enabled(),
            screen_sharing: self.is_screen_sharing(),
        }
    }

    /// The display track, when one occupies the video slot.
    pub fn screen_track(&self) -> Option<MediaTrack> {
        self.active
            .video()
            .filter(|t| t.source() == TrackSource::Display)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_set() -> (MediaTrack, MediaTrack, LocalMediaState) {
        let mic = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let cam = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        let state = LocalMediaState::new(TrackSet::new(vec![mic.clone(), cam.clone()]));
        (mic, cam, state)
    }

    #[test]
    fn double_toggle_restores_flags() {
        let (mic, cam, mut state) = camera_set();
        assert!(!state.toggle_audio());
        assert!(!mic.is_enabled());
        assert!(state.toggle_audio());
        assert!(mic.is_enabled());

        assert!(!state.toggle_video());
        assert!(state.toggle_video());
        assert!(cam.is_enabled());
    }

    #[test]
    fn substitution_and_revert() {
        let (_mic, cam, mut state) = camera_set();
        let screen = MediaTrack::new(TrackKind::Video, TrackSource::Display, "screen");

        assert_eq!(state.substitute_video(screen.clone()), Some(cam.clone()));
        assert!(state.is_screen_sharing());
        assert_eq!(state.screen_track(), Some(screen.clone()));

        assert!(state.restore_previous(&screen));
        assert_eq!(state.video_track(), Some(cam));
        assert!(!state.is_screen_sharing());
        assert!(!state.restore_previous(&screen));
    }

    #[test]
    fn second_share_keeps_camera_snapshot() {
        let (_mic, cam, mut state) = camera_set();
        let first = MediaTrack::new(TrackKind::Video, TrackSource::Display, "first");
        let second = MediaTrack::new(TrackKind::Video, TrackSource::Display, "second");

        state.substitute_video(first.clone());
        assert_eq!(state.substitute_video(second.clone()), Some(first.clone()));

        // the displaced share ending must not revert anything
        assert!(!state.restore_previous(&first));
        assert!(state.restore_previous(&second));
        assert_eq!(state.video_track(), Some(cam));
    }

    #[test]
    fn stop_all_counts_each_track_once() {
        let (mic, cam, mut state) = camera_set();
        let screen = MediaTrack::new(TrackKind::Video, TrackSource::Display, "screen");
        state.substitute_video(screen.clone());

        assert_eq!(state.stop_all(), 3);
        assert!(mic.is_ended() && cam.is_ended() && screen.is_ended());
        assert_eq!(state.stop_all(), 0);
        assert!(state.active().is_empty());
    }
}

//! Local and remote media as seen by the session manager.
//!
//! Tracks are shared handles: cloning a [`MediaTrack`] yields the same track,
//! while [`MediaTrack::clone_track`] and [`MediaStream::clone_stream`] produce
//! independent copies of the same source, each with its own enable flag and
//! lifetime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use event_bus::{BusEvent, EventBus, Subscription};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media devices unavailable")]
    Unavailable,
    #[error("media permission denied")]
    PermissionDenied,
    #[error("media capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Capture request handed to [`MediaDevices::get_user_media`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_height: Option<u32>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            video_width: None,
            video_height: None,
        }
    }
}

impl MediaConfig {
    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::default()
        }
    }
}

/// Notifications a track's source can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEvent {
    Ended,
    Muted,
    Unmuted,
}

impl BusEvent for TrackEvent {
    fn name(&self) -> &'static str {
        match self {
            TrackEvent::Ended => "ended",
            TrackEvent::Muted => "mute",
            TrackEvent::Unmuted => "unmute",
        }
    }
}

const TRACK_EVENTS: &[&str] = &["ended", "mute", "unmute"];

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    muted: AtomicBool,
    stopped: AtomicBool,
    events: EventBus<TrackEvent>,
}

#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                muted: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                events: EventBus::new(TRACK_EVENTS),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Releases the track. Does not raise `ended`; that event is reserved
    /// for the source going away on its own.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    /// Independent copy of this track fed by the same source.
    pub fn clone_track(&self) -> MediaTrack {
        let copy = MediaTrack::new(self.kind(), self.label());
        copy.set_enabled(self.is_enabled());
        copy.inner.muted.store(self.is_muted(), Ordering::SeqCst);
        copy
    }

    pub fn on<F>(&self, event: &str, listener: F) -> Result<Subscription, event_bus::BusError>
    where
        F: Fn(&TrackEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(event, listener)
    }

    pub fn off(&self, subscription: &Subscription) -> bool {
        self.inner.events.off(subscription)
    }

    /// Source side: the device or remote sender stopped for good.
    pub fn end(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.events.fire(TrackEvent::Ended);
    }

    /// Source side: frames stopped arriving.
    pub fn mute(&self) {
        if !self.inner.muted.swap(true, Ordering::SeqCst) {
            self.inner.events.fire(TrackEvent::Muted);
        }
    }

    /// Source side: frames are arriving again.
    pub fn unmute(&self) {
        if self.inner.muted.swap(false, Ordering::SeqCst) {
            self.inner.events.fire(TrackEvent::Unmuted);
        }
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("muted", &self.is_muted())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    /// Copies every track so the copy can be stopped without touching `self`.
    pub fn clone_stream(&self) -> MediaStream {
        MediaStream::new(self.tracks.iter().map(MediaTrack::clone_track).collect())
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Capture collaborator: hands out the local camera/microphone stream.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, config: &MediaConfig) -> Result<MediaStream, MediaError>;
}

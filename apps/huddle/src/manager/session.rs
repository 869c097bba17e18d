use std::collections::HashMap;
use std::fmt;

use event_bus::Subscription;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::media::{MediaStream, MediaTrack};
use crate::peer::PeerHandle;

/// Lifecycle of the session with one remote participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    NotTracking,
    Resetting,
    Initializing,
    Streaming,
    Broken,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::NotTracking => "not tracking",
            SessionState::Resetting => "resetting",
            SessionState::Initializing => "initializing",
            SessionState::Streaming => "streaming",
            SessionState::Broken => "broken",
        }
    }

    /// A peer handle exists in these states.
    pub fn has_peer(self) -> bool {
        matches!(
            self,
            SessionState::Initializing | SessionState::Streaming | SessionState::Broken
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Initializing,
    Broken,
}

/// Single-shot timer; aborts its task when dropped.
pub(crate) struct Timer {
    task: JoinHandle<()>,
}

impl Timer {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) struct PeerSession {
    pub state: SessionState,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    /// Bumped on every reset; events tagged with an older value are stale.
    pub generation: u64,
    /// Bumped whenever timers are cleared.
    pub timer_epoch: u64,
    pub handle: Option<Box<dyn PeerHandle>>,
    pub stream_out: Option<MediaStream>,
    pub stream_in: Option<MediaStream>,
    pub pending_signal: Option<Value>,
    pub initializing_timer: Option<Timer>,
    pub broken_timer: Option<Timer>,
    pub track_listeners: Vec<(MediaTrack, Subscription)>,
}

impl Default for PeerSession {
    fn default() -> Self {
        Self {
            state: SessionState::NotTracking,
            audio_enabled: false,
            video_enabled: false,
            generation: 0,
            timer_epoch: 0,
            handle: None,
            stream_out: None,
            stream_in: None,
            pending_signal: None,
            initializing_timer: None,
            broken_timer: None,
            track_listeners: Vec::new(),
        }
    }
}

impl PeerSession {
    pub fn clear_timers(&mut self) {
        self.timer_epoch += 1;
        self.initializing_timer = None;
        self.broken_timer = None;
    }

    pub fn detach_track_listeners(&mut self) {
        for (track, subscription) in self.track_listeners.drain(..) {
            track.off(&subscription);
        }
    }

    pub fn timer_slot(&mut self, kind: TimerKind) -> &mut Option<Timer> {
        match kind {
            TimerKind::Initializing => &mut self.initializing_timer,
            TimerKind::Broken => &mut self.broken_timer,
        }
    }
}

/// Sessions keyed by remote participant id.
///
/// Ids never referenced read as [`SessionState::NotTracking`]; referencing an
/// id through [`entry`](Self::entry) creates its record.
#[derive(Default)]
pub(crate) struct SessionTable {
    sessions: HashMap<String, PeerSession>,
}

impl SessionTable {
    pub fn state(&self, peer_id: &str) -> SessionState {
        self.sessions
            .get(peer_id)
            .map_or(SessionState::NotTracking, |session| session.state)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerSession> {
        self.sessions.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer_id)
    }

    pub fn entry(&mut self, peer_id: &str) -> &mut PeerSession {
        self.sessions.entry(peer_id.to_string()).or_default()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> HashMap<String, SessionState> {
        self.sessions
            .iter()
            .map(|(id, session)| (id.clone(), session.state))
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut PeerSession)> {
        self.sessions.iter_mut()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

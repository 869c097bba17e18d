//! Contract for the delegated peer-connection engine.
//!
//! The session manager never looks inside a peer connection. It creates one
//! per negotiation attempt through a [`PeerConnector`], feeds it remote
//! descriptors, and reacts to what it reports through [`PeerEvents`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::media::MediaStream;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer connection already destroyed")]
    Destroyed,
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// STUN/TURN endpoint handed to every new peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl RelayServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Public STUN servers only. A TURN relay needs per-deployment credentials,
/// so it is only ever configured through `HUDDLE_RELAY_SERVERS`
/// (`turn:host|username|credential`).
pub fn default_relay_servers() -> Vec<RelayServer> {
    vec![
        RelayServer::stun("stun:stun.l.google.com:19302"),
        RelayServer::stun("stun:global.stun.twilio.com:3478"),
    ]
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connect,
    Stream(MediaStream),
    Signal(Value),
    Close,
    Error(String),
}

/// Callback sink a peer connection reports through.
#[derive(Clone)]
pub struct PeerEvents {
    emit: Arc<dyn Fn(PeerEvent) + Send + Sync>,
}

impl PeerEvents {
    pub fn new<F>(emit: F) -> Self
    where
        F: Fn(PeerEvent) + Send + Sync + 'static,
    {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.emit)(event);
    }

    pub fn connect(&self) {
        self.emit(PeerEvent::Connect);
    }

    pub fn stream(&self, stream: MediaStream) {
        self.emit(PeerEvent::Stream(stream));
    }

    pub fn signal(&self, descriptor: Value) {
        self.emit(PeerEvent::Signal(descriptor));
    }

    pub fn close(&self) {
        self.emit(PeerEvent::Close);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(PeerEvent::Error(message.into()));
    }
}

impl std::fmt::Debug for PeerEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PeerEvents")
    }
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub remote_id: String,
    /// This side produces the first offer.
    pub initiator: bool,
    pub trickle: bool,
    pub relay_servers: Vec<RelayServer>,
    pub local_stream: MediaStream,
    pub events: PeerEvents,
}

pub trait PeerHandle: Send {
    /// Applies a remote descriptor or candidate.
    fn signal(&mut self, descriptor: Value) -> Result<(), PeerError>;
    fn destroy(&mut self);
}

pub trait PeerConnector: Send + Sync {
    fn create(&self, options: PeerOptions) -> Box<dyn PeerHandle>;
}

/// Deterministic initiator selection for a pair of participants.
///
/// The participant whose id sorts first never initiates, so exactly one side
/// of every pair makes the offer and both sides agree without talking.
pub fn is_initiator(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

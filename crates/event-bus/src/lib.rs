//! Typed publish/subscribe for components that announce named events.
//!
//! A component owns an [`EventBus`] for its event enum and exposes typed
//! `on`/`fire` wrappers around it. Listeners run synchronously on the firing
//! task, in registration order. Consumers on other tasks can use
//! [`EventBus::subscribe`] to get every event through a broadcast channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;

/// An event that can travel over an [`EventBus`].
pub trait BusEvent: Clone + Send + 'static {
    /// Name listeners register against.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("event '{0}' is not published by this bus")]
    UnknownEvent(String),
}

pub type BusResult<T> = Result<T, BusError>;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to remove the listener again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    name: &'static str,
}

impl Subscription {
    pub fn event_name(&self) -> &'static str {
        self.name
    }
}

pub struct EventBus<E: BusEvent> {
    names: &'static [&'static str],
    listeners: parking_lot::RwLock<HashMap<&'static str, Vec<(u64, Listener<E>)>>>,
    next_id: AtomicU64,
    broadcast: broadcast::Sender<E>,
}

impl<E: BusEvent> EventBus<E> {
    /// Creates a bus that publishes exactly the given event names.
    pub fn new(names: &'static [&'static str]) -> Self {
        Self {
            names,
            listeners: parking_lot::RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            broadcast: broadcast::channel(BROADCAST_CAPACITY).0,
        }
    }

    pub fn event_names(&self) -> &'static [&'static str] {
        self.names
    }

    fn resolve(&self, name: &str) -> BusResult<&'static str> {
        self.names
            .iter()
            .copied()
            .find(|known| *known == name)
            .ok_or_else(|| BusError::UnknownEvent(name.to_string()))
    }

    /// Registers `listener` for events named `name`.
    pub fn on<F>(&self, name: &str, listener: F) -> BusResult<Subscription>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let name = self.resolve(name)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .entry(name)
            .or_default()
            .push((id, Arc::new(listener)));
        Ok(Subscription { id, name })
    }

    /// Removes a listener. Returns false if it was already gone.
    pub fn off(&self, subscription: &Subscription) -> bool {
        let mut guard = self.listeners.write();
        let Some(entries) = guard.get_mut(subscription.name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != subscription.id);
        before != entries.len()
    }

    /// Drops every registered listener. Broadcast receivers stay attached.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.read().get(name).map_or(0, Vec::len)
    }

    /// Delivers `event` to the listeners registered at the time of the call.
    ///
    /// The listener list is snapshotted first, so a listener may subscribe or
    /// unsubscribe while it runs.
    pub fn fire(&self, event: E) {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .read()
            .get(event.name())
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in snapshot {
            listener(&event);
        }
        // No receivers is fine.
        let _ = self.broadcast.send(event);
    }

    /// Receives every event fired after this call, regardless of name.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.broadcast.subscribe()
    }
}

impl<E: BusEvent> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&'static str, usize> = self
            .listeners
            .read()
            .iter()
            .map(|(name, entries)| (*name, entries.len()))
            .collect();
        f.debug_struct("EventBus")
            .field("names", &self.names)
            .field("listeners", &counts)
            .finish()
    }
}

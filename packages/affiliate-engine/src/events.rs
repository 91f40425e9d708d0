//! Invalidation events emitted by the master index.
//!
//! Every committed mutation produces exactly one [`InvalidationEvent`]. It
//! travels two ways:
//!
//! ```text
//! MasterIndex::commit (per-key lock held)
//!     │
//!     ├─► InvalidationListener::invalidate()   synchronous, before the new
//!     │       └─► QueryCache drops entries       state becomes readable
//!     │
//!     └─► EventBus::emit()                       after the lock is released
//!             └─► TriggerEngine (event-driven rule evaluation)
//! ```
//!
//! The synchronous path is what makes the cache coherent. The bus is
//! at-most-once: a lagged subscriber gets `RecvError::Lagged` and must fall
//! back to a full evaluation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::types::{CanonicalProgram, IdentityKey};

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 10_000;

/// A committed change to one canonical program.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    pub key: IdentityKey,
    /// State before the mutation; `None` when the program was created.
    pub before: Option<Arc<CanonicalProgram>>,
    pub after: Arc<CanonicalProgram>,
    pub version: u64,
    pub at: DateTime<Utc>,
}

impl InvalidationEvent {
    /// Both states the mutation touched, for predicate matching.
    pub fn states(&self) -> impl Iterator<Item = &CanonicalProgram> {
        self.before
            .as_deref()
            .into_iter()
            .chain(std::iter::once(self.after.as_ref()))
    }
}

/// Receives invalidations synchronously inside the index commit.
///
/// Implementations run while the index holds the per-key lock, so they must
/// be quick and must never call back into the index.
pub trait InvalidationListener: Send + Sync {
    fn invalidate(&self, event: &InvalidationEvent);
}

/// Broadcast channel for invalidation events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<InvalidationEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// The capacity determines how many events can be buffered before
    /// slow receivers start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit to all current subscribers. Returns how many received it.
    pub fn emit(&self, event: Arc<InvalidationEvent>) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<InvalidationEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

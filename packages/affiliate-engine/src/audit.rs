//! Append-only, sequenced audit logs.
//!
//! Trigger events and merge conflicts are exported to external monitoring in
//! insertion order. Entries are never mutated after they are written. Each
//! entry receives a monotonically increasing sequence number so consumers
//! can poll with [`AppendLog::entries_since`] and detect gaps if retention
//! dropped entries they had not yet read.
//!
//! # Usage
//!
//! ```ignore
//! let log = AppendLog::with_capacity(10_000);
//! let seq = log.append(event);
//!
//! // Exporter
//! for entry in log.entries_since(last_exported) {
//!     ship(entry.seq, &entry.entry);
//!     last_exported = entry.seq;
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

/// Default number of entries to retain.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// One log entry with its sequence number (1-based).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sequenced<T> {
    pub seq: u64,
    pub entry: T,
}

#[derive(Debug)]
struct LogInner<T> {
    entries: VecDeque<Sequenced<T>>,
    next_seq: u64,
    dropped: u64,
}

/// Thread-safe bounded append-only log.
#[derive(Debug)]
pub struct AppendLog<T> {
    inner: Mutex<LogInner<T>>,
    capacity: usize,
}

impl<T: Clone> AppendLog<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(LogInner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 1,
                dropped: 0,
            }),
            capacity,
        }
    }

    /// Acquire the log lock, recovering from poison if necessary.
    fn lock(&self) -> MutexGuard<'_, LogInner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry and return its sequence number.
    pub fn append(&self, entry: T) -> u64 {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
            inner.dropped += 1;
        }
        inner.entries.push_back(Sequenced { seq, entry });
        seq
    }

    /// All retained entries in insertion order.
    pub fn entries(&self) -> Vec<Sequenced<T>> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Retained entries with a sequence number greater than `seq`.
    pub fn entries_since(&self, seq: u64) -> Vec<Sequenced<T>> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect()
    }

    /// Sequence number of the most recent entry, 0 when nothing was written.
    pub fn last_seq(&self) -> u64 {
        self.lock().next_seq - 1
    }

    /// Number of entries dropped by retention.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

impl<T: Clone> Default for AppendLog<T> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

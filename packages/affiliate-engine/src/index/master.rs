//! Canonical program storage with per-key optimistic concurrency.
//!
//! # Write path
//!
//! ```text
//! upsert(raw)
//!   ├─ fingerprint known?          → skipped
//!   ├─ mapping registry            → ValidationError
//!   └─ loop (max_merge_attempts)
//!        ├─ snapshot current state (no lock held)
//!        ├─ merge off-lock
//!        └─ commit under the key's shard lock
//!             ├─ version moved?    → retry
//!             ├─ listeners.invalidate()
//!             └─ publish new state, version + 1
//! ```
//!
//! Writers to different keys never wait on each other beyond DashMap shard
//! contention. Readers of a key being committed block until listeners have
//! run, so no reader can observe the new state before caches dropped the
//! old one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::merge::{merge_record, MergePlan};
use super::query::{ProgramPage, ProgramQuery};
use super::IndexReader;
use crate::audit::AppendLog;
use crate::config::IndexConfig;
use crate::error::{ConflictError, IndexError};
use crate::events::{EventBus, InvalidationEvent, InvalidationListener};
use crate::mapping::{MappedRecord, MappingRegistry};
use crate::types::{
    CanonicalProgram, ConflictDescriptor, IdentityKey, MergeOutcome, MergeResult, RawRecord,
    RecordId,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub programs: usize,
    pub raw_records: usize,
    /// Sequence number of the latest logged conflict.
    pub conflicts_logged: u64,
    /// Committed mutations since startup.
    pub mutations: u64,
}

/// Point-in-time dump of canonical state and the raw record log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexExport {
    /// Ordered by identity key.
    pub programs: Vec<CanonicalProgram>,
    /// Ordered by (source, ingested_at, record id).
    pub raw_records: Vec<RawRecord>,
}

pub struct MasterIndex {
    registry: Arc<MappingRegistry>,
    config: IndexConfig,
    programs: DashMap<IdentityKey, Arc<CanonicalProgram>>,
    raw_log: DashMap<RecordId, Arc<RawRecord>>,
    conflicts: AppendLog<ConflictDescriptor>,
    listeners: RwLock<Vec<Arc<dyn InvalidationListener>>>,
    bus: EventBus,
    mutations: AtomicU64,
}

impl MasterIndex {
    pub fn new(registry: Arc<MappingRegistry>, config: IndexConfig) -> Self {
        Self {
            registry,
            conflicts: AppendLog::with_capacity(config.conflict_log_capacity),
            bus: EventBus::with_capacity(config.event_capacity),
            config,
            programs: DashMap::new(),
            raw_log: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            mutations: AtomicU64::new(0),
        }
    }

    /// Register a listener that runs inside every commit.
    pub fn add_listener(&self, listener: Arc<dyn InvalidationListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<InvalidationEvent>> {
        self.bus.subscribe()
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    /// Merge one raw record into canonical state.
    ///
    /// Conflicting values never fail the upsert; they are reported in the
    /// result and appended to the conflict log.
    pub fn upsert(&self, raw: RawRecord) -> Result<MergeResult, IndexError> {
        let id = raw.id();
        if self.raw_log.contains_key(&id) {
            debug!(record_id = %id, source = %raw.source, "record already ingested");
            return Ok(MergeResult::single(MergeOutcome::Skipped, Vec::new()));
        }

        let mapped = self.registry.map_record(&raw)?;
        let attempts = self.config.max_merge_attempts.max(1);

        for attempt in 1..=attempts {
            let current = self
                .programs
                .get(&mapped.key)
                .map(|entry| Arc::clone(entry.value()));

            let plan = merge_record(
                current.as_deref(),
                &mapped,
                self.config.tie_break,
                Utc::now(),
            );

            if !plan.mutates() {
                return Ok(self.settle(raw, &mapped, plan));
            }

            match self.commit(current.as_ref(), plan.program.clone()) {
                Some(event) => {
                    info!(
                        key = %event.key,
                        version = event.version,
                        outcome = ?plan.outcome,
                        source = %mapped.provenance.source,
                        "program committed"
                    );
                    let result = self.settle(raw, &mapped, plan);
                    self.bus.emit(event);
                    return Ok(result);
                }
                None => {
                    debug!(key = %mapped.key, attempt, "version moved during merge, retrying");
                }
            }
        }

        info!(key = %mapped.key, attempts, "optimistic merge retries exhausted");
        Err(ConflictError::ConcurrencyExhausted {
            key: mapped.key,
            attempts,
        }
        .into())
    }

    /// Record the raw record and its conflicts once an attempt has settled.
    fn settle(&self, raw: RawRecord, mapped: &MappedRecord, plan: MergePlan) -> MergeResult {
        for conflict in &plan.conflicts {
            info!(
                key = %conflict.key,
                field = %conflict.field,
                existing = %conflict.existing,
                incoming = %conflict.incoming,
                chosen = %conflict.chosen,
                reason = ?conflict.reason,
                "merge conflict"
            );
            self.conflicts.append(conflict.clone());
        }
        self.raw_log.insert(mapped.id.clone(), Arc::new(raw));
        MergeResult::single(plan.outcome, plan.conflicts)
    }

    /// Publish `next` if the key still holds `expected`. Returns `None` when
    /// another writer got there first.
    fn commit(
        &self,
        expected: Option<&Arc<CanonicalProgram>>,
        mut next: CanonicalProgram,
    ) -> Option<Arc<InvalidationEvent>> {
        let at = Utc::now();

        let event = match self.programs.entry(next.key.clone()) {
            Entry::Occupied(mut slot) => {
                let expected = expected?;
                if slot.get().version != expected.version {
                    return None;
                }
                next.version = expected.version + 1;
                let event = InvalidationEvent {
                    key: next.key.clone(),
                    before: Some(Arc::clone(slot.get())),
                    version: next.version,
                    after: Arc::new(next),
                    at,
                };
                self.notify(&event);
                slot.insert(Arc::clone(&event.after));
                event
            }
            Entry::Vacant(slot) => {
                if expected.is_some() {
                    return None;
                }
                next.version = 1;
                let event = InvalidationEvent {
                    key: next.key.clone(),
                    before: None,
                    version: 1,
                    after: Arc::new(next),
                    at,
                };
                self.notify(&event);
                slot.insert(Arc::clone(&event.after));
                event
            }
        };

        self.mutations.fetch_add(1, Ordering::Relaxed);
        Some(Arc::new(event))
    }

    fn notify(&self, event: &InvalidationEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for listener in listeners.iter() {
            listener.invalidate(event);
        }
    }

    pub fn get(&self, key: &IdentityKey) -> Result<CanonicalProgram, IndexError> {
        self.programs
            .get(key)
            .map(|entry| entry.value().as_ref().clone())
            .ok_or_else(|| IndexError::NotFound(key.clone()))
    }

    fn snapshot(&self) -> Vec<Arc<CanonicalProgram>> {
        self.programs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// All matches ordered by the query's sort, then identity key.
    pub fn search(&self, query: &ProgramQuery) -> Vec<CanonicalProgram> {
        let snapshot = self.snapshot();
        query
            .select(snapshot.iter().map(Arc::as_ref))
            .into_iter()
            .cloned()
            .collect()
    }

    /// One page of matches plus a cursor for the next.
    pub fn page(&self, query: &ProgramQuery) -> Result<ProgramPage, IndexError> {
        let snapshot = self.snapshot();
        Ok(query.paginate(snapshot.iter().map(Arc::as_ref))?)
    }

    pub fn count(&self, query: &ProgramQuery) -> usize {
        self.programs
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn raw_record(&self, id: &RecordId) -> Option<RawRecord> {
        self.raw_log.get(id).map(|entry| entry.value().as_ref().clone())
    }

    pub fn conflicts(&self) -> &AppendLog<ConflictDescriptor> {
        &self.conflicts
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            programs: self.programs.len(),
            raw_records: self.raw_log.len(),
            conflicts_logged: self.conflicts.last_seq(),
            mutations: self.mutations.load(Ordering::Relaxed),
        }
    }

    pub fn export(&self) -> IndexExport {
        let mut programs: Vec<CanonicalProgram> = self
            .snapshot()
            .into_iter()
            .map(|p| p.as_ref().clone())
            .collect();
        programs.sort_by(|a, b| a.key.cmp(&b.key));

        let mut raw: Vec<(RecordId, Arc<RawRecord>)> = self
            .raw_log
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        raw.sort_by(|(id_a, a), (id_b, b)| {
            (&a.source, a.ingested_at, id_a).cmp(&(&b.source, b.ingested_at, id_b))
        });

        IndexExport {
            programs,
            raw_records: raw.into_iter().map(|(_, r)| r.as_ref().clone()).collect(),
        }
    }
}

impl IndexReader for MasterIndex {
    fn count(&self, query: &ProgramQuery) -> usize {
        MasterIndex::count(self, query)
    }

    fn search(&self, query: &ProgramQuery) -> Vec<CanonicalProgram> {
        MasterIndex::search(self, query)
    }

    fn stats(&self) -> IndexStats {
        MasterIndex::stats(self)
    }
}

impl std::fmt::Debug for MasterIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterIndex")
            .field("programs", &self.programs.len())
            .field("raw_records", &self.raw_log.len())
            .finish()
    }
}

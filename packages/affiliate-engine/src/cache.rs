//! Query cache kept coherent with the master index.
//!
//! Entries are dropped by two rules when the index commits a mutation:
//!
//! 1. **Tag**: the entry's result contains the mutated identity key.
//! 2. **Predicate**: the entry's query could match the program before or
//!    after the mutation. This catches results that should now *gain* the
//!    program, including cached empty results.
//!
//! The cache registers itself as an [`InvalidationListener`], so both rules
//! run inside the index commit, before the new state is readable.
//!
//! A fill computed while an overlapping invalidation was being applied is
//! returned to its caller but not stored. The cache remembers the last
//! `invalidation_window` events to make that call; if the window was
//! overrun during the computation the fill is rejected outright.
//!
//! Eviction is LRU over a `BTreeMap<tick, signature>` recency index. TTL is a
//! hard bound checked on every read and purged before every insert.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::events::{InvalidationEvent, InvalidationListener};
use crate::index::{ProgramPage, ProgramQuery};
use crate::types::{CanonicalProgram, IdentityKey};

/// A cacheable read.
pub trait CacheQuery: Send + Sync + 'static {
    /// Canonical signature; equal signatures share an entry.
    fn signature(&self) -> String;

    /// Whether a program in this state could appear in the result.
    fn may_include(&self, program: &CanonicalProgram) -> bool;
}

/// A cacheable result, tagged with the programs it covers.
pub trait DependsOn {
    fn depends_on(&self) -> BTreeSet<IdentityKey>;
}

impl CacheQuery for ProgramQuery {
    fn signature(&self) -> String {
        ProgramQuery::signature(self)
    }

    fn may_include(&self, program: &CanonicalProgram) -> bool {
        self.matches(program)
    }
}

impl DependsOn for ProgramPage {
    fn depends_on(&self) -> BTreeSet<IdentityKey> {
        self.items.iter().map(|p| p.key.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub stale_fills_rejected: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// `None` until the first lookup.
    pub fn hit_rate(&self) -> Option<f64> {
        match self.lookups() {
            0 => None,
            n => Some(self.hits as f64 / n as f64),
        }
    }
}

/// Cache health as seen by trigger predicates.
pub trait CacheMetrics: Send + Sync {
    fn cache_stats(&self) -> CacheStats;
}

struct CacheEntry<Q, V> {
    query: Q,
    value: V,
    depends_on: BTreeSet<IdentityKey>,
    created_at: Instant,
    ttl: Duration,
    last_used: u64,
}

impl<Q, V> CacheEntry<Q, V> {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

struct RecentInvalidation {
    seq: u64,
    key: IdentityKey,
    states: Vec<Arc<CanonicalProgram>>,
}

struct CacheState<Q, V> {
    entries: HashMap<String, CacheEntry<Q, V>>,
    recency: BTreeMap<u64, String>,
    by_key: HashMap<IdentityKey, HashSet<String>>,
    clock: u64,
    invalidation_seq: u64,
    recent: VecDeque<RecentInvalidation>,
    stats: CacheStats,
}

impl<Q: CacheQuery, V: Clone> CacheState<Q, V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lookup(&mut self, signature: &str, now: Instant) -> Option<V> {
        let expired = self.entries.get(signature)?.expired(now);
        if expired {
            self.remove(signature);
            self.stats.expirations += 1;
            return None;
        }

        let tick = self.tick();
        let entry = self.entries.get_mut(signature)?;
        self.recency.remove(&entry.last_used);
        entry.last_used = tick;
        self.recency.insert(tick, signature.to_string());
        Some(entry.value.clone())
    }

    fn remove(&mut self, signature: &str) -> bool {
        let Some(entry) = self.entries.remove(signature) else {
            return false;
        };
        self.recency.remove(&entry.last_used);
        for key in &entry.depends_on {
            if let Some(signatures) = self.by_key.get_mut(key) {
                signatures.remove(signature);
                if signatures.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        true
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expired(now))
            .map(|(signature, _)| signature.clone())
            .collect();
        for signature in expired {
            self.remove(&signature);
            self.stats.expirations += 1;
        }
    }

    fn evict_lru(&mut self, capacity: usize) {
        while self.entries.len() >= capacity {
            let Some((_, signature)) = self.recency.pop_first() else {
                break;
            };
            if self.remove(&signature) {
                self.stats.evictions += 1;
                debug!(signature = %signature, "evicted least recently used entry");
            }
        }
    }

    /// Whether any invalidation after `since` could affect this fill.
    fn overlaps(&self, since: u64, query: &Q, depends_on: &BTreeSet<IdentityKey>) -> bool {
        if self.invalidation_seq == since {
            return false;
        }
        match self.recent.front() {
            Some(oldest) if oldest.seq <= since + 1 => {}
            _ => return true,
        }

        self.recent
            .iter()
            .filter(|inv| inv.seq > since)
            .any(|inv| {
                depends_on.contains(&inv.key)
                    || inv.states.iter().any(|state| query.may_include(state))
            })
    }
}

/// Bounded, TTL'd, invalidation-coherent cache of query results.
pub struct QueryCache<Q, V> {
    state: Mutex<CacheState<Q, V>>,
    config: CacheConfig,
}

impl<Q, V> QueryCache<Q, V>
where
    Q: CacheQuery + Clone,
    V: DependsOn + Clone + Send + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                by_key: HashMap::new(),
                clock: 0,
                invalidation_seq: 0,
                recent: VecDeque::new(),
                stats: CacheStats::default(),
            }),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<Q, V>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the live entry for `query`, or compute, store and return it.
    ///
    /// `compute` runs without the cache lock held. Errors are returned as-is
    /// and nothing is stored.
    pub fn get_or_compute<E, F>(&self, query: &Q, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let signature = query.signature();

        let since = {
            let mut state = self.lock();
            if let Some(value) = state.lookup(&signature, Instant::now()) {
                state.stats.hits += 1;
                return Ok(value);
            }
            state.stats.misses += 1;
            state.invalidation_seq
        };

        let value = compute()?;
        let depends_on = value.depends_on();

        let mut state = self.lock();
        if state.overlaps(since, query, &depends_on) {
            state.stats.stale_fills_rejected += 1;
            debug!(signature = %signature, "discarding fill raced by invalidation");
            return Ok(value);
        }

        let now = Instant::now();
        state.remove(&signature);
        state.purge_expired(now);
        state.evict_lru(self.config.capacity.max(1));

        let tick = state.tick();
        for key in &depends_on {
            state
                .by_key
                .entry(key.clone())
                .or_default()
                .insert(signature.clone());
        }
        state.recency.insert(tick, signature.clone());
        state.entries.insert(
            signature,
            CacheEntry {
                query: query.clone(),
                value: value.clone(),
                depends_on,
                created_at: now,
                ttl: self.config.ttl,
                last_used: tick,
            },
        );
        state.stats.inserts += 1;

        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.recency.clear();
        state.by_key.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }
}

impl<Q, V> InvalidationListener for QueryCache<Q, V>
where
    Q: CacheQuery + Clone,
    V: DependsOn + Clone + Send + 'static,
{
    fn invalidate(&self, event: &InvalidationEvent) {
        let mut state = self.lock();

        state.invalidation_seq += 1;
        let seq = state.invalidation_seq;
        state.recent.push_back(RecentInvalidation {
            seq,
            key: event.key.clone(),
            states: event
                .before
                .iter()
                .cloned()
                .chain(std::iter::once(Arc::clone(&event.after)))
                .collect(),
        });
        while state.recent.len() > self.config.invalidation_window.max(1) {
            state.recent.pop_front();
        }

        let mut doomed = state.by_key.get(&event.key).cloned().unwrap_or_default();
        doomed.extend(
            state
                .entries
                .iter()
                .filter(|(_, entry)| event.states().any(|p| entry.query.may_include(p)))
                .map(|(signature, _)| signature.clone()),
        );

        let mut removed = 0;
        for signature in &doomed {
            if state.remove(signature) {
                removed += 1;
            }
        }
        state.stats.invalidations += removed;

        if removed > 0 {
            debug!(key = %event.key, version = event.version, removed, "cache entries invalidated");
        }
    }
}

impl<Q, V> CacheMetrics for QueryCache<Q, V>
where
    Q: CacheQuery + Clone,
    V: DependsOn + Clone + Send + 'static,
{
    fn cache_stats(&self) -> CacheStats {
        self.stats()
    }
}

/// The cache the engine puts in front of index pages.
pub type ProgramCache = QueryCache<ProgramQuery, ProgramPage>;

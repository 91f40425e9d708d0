//! Rule evaluation, cooldowns and the trigger loop.
//!
//! Each rule runs its own state machine:
//!
//! ```text
//! Idle ─► Evaluating ─┬─ not matched ──────────────► Idle
//!                     └─ matched ─► Fired ─► Cooldown ─► Idle
//!                                     │
//!                  matched during cooldown: event recorded, no dispatch
//! ```
//!
//! Rules are mutually exclusive with themselves and independent of each
//! other: a predicate that errors or panics is logged against its rule and
//! the pass moves on. Passes are serialized, so one pass completes before
//! the next begins.
//!
//! A failed enqueue does not start the cooldown; the next pass retries.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::rules::{EvaluationContext, EvaluationMode, TriggerRule};
use crate::audit::AppendLog;
use crate::cache::CacheMetrics;
use crate::config::TriggerConfig;
use crate::dispatch::{ActionSink, TaskOrigin};
use crate::error::{ConfigError, PredicateError, TriggerEvaluationError};
use crate::events::InvalidationEvent;
use crate::index::IndexReader;
use crate::types::IdentityKey;

/// What started an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCause {
    Tick,
    Invalidation { key: IdentityKey },
    /// Invalidation events were missed; every on-change rule is re-checked.
    Lagged,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Disposition {
    Dispatched { task_id: Uuid },
    Suppressed { remaining_ms: u64 },
    DispatchFailed { reason: String },
}

/// One matched evaluation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerEvent {
    pub rule_id: String,
    pub fired_at: DateTime<Utc>,
    pub cause: TriggerCause,
    pub disposition: Disposition,
    /// What the predicate observed.
    pub context: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RulePhase {
    Idle,
    Evaluating,
    Cooldown { remaining_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleStatus {
    pub id: String,
    pub enabled: bool,
    pub mode: EvaluationMode,
    pub phase: RulePhase,
    pub last_evaluated: Option<DateTime<Utc>>,
    pub last_fired: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub fires: u64,
    pub suppressed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Disabled,
    /// Another evaluation of this rule is in progress.
    Busy,
    NotMatched,
    Fired { task_id: Uuid },
    Suppressed,
    DispatchFailed,
    Failed(TriggerEvaluationError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub evaluated: usize,
    pub fired: usize,
    pub suppressed: usize,
    pub dispatch_failed: usize,
    pub failed: usize,
    pub busy: usize,
}

impl PassReport {
    fn record(&mut self, outcome: &RuleOutcome) {
        match outcome {
            RuleOutcome::Disabled => return,
            RuleOutcome::Busy => {
                self.busy += 1;
                return;
            }
            RuleOutcome::NotMatched => {}
            RuleOutcome::Fired { .. } => self.fired += 1,
            RuleOutcome::Suppressed => self.suppressed += 1,
            RuleOutcome::DispatchFailed => self.dispatch_failed += 1,
            RuleOutcome::Failed(_) => self.failed += 1,
        }
        self.evaluated += 1;
    }
}

#[derive(Debug, Default)]
struct RuleState {
    cooldown_until: Option<Instant>,
    last_evaluated: Option<DateTime<Utc>>,
    last_fired: Option<DateTime<Utc>>,
    last_error: Option<String>,
    fires: u64,
    suppressed: u64,
}

struct RuleSlot {
    rule: RwLock<TriggerRule>,
    state: Mutex<RuleState>,
}

impl RuleSlot {
    fn rule(&self) -> TriggerRule {
        self.rule
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

pub struct TriggerEngine {
    config: TriggerConfig,
    index: Arc<dyn IndexReader>,
    cache: Arc<dyn CacheMetrics>,
    sink: Arc<dyn ActionSink>,
    rules: RwLock<Vec<Arc<RuleSlot>>>,
    events: AppendLog<TriggerEvent>,
    pass: Mutex<()>,
}

impl TriggerEngine {
    pub fn new(
        config: TriggerConfig,
        index: Arc<dyn IndexReader>,
        cache: Arc<dyn CacheMetrics>,
        sink: Arc<dyn ActionSink>,
    ) -> Self {
        Self {
            events: AppendLog::with_capacity(config.audit_capacity),
            config,
            index,
            cache,
            sink,
            rules: RwLock::new(Vec::new()),
            pass: Mutex::new(()),
        }
    }

    pub fn add_rule(&self, rule: TriggerRule) -> Result<(), ConfigError> {
        let mut rules = self.rules.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if rules.iter().any(|slot| slot.rule().id == rule.id) {
            return Err(ConfigError::DuplicateRule(rule.id));
        }
        info!(rule_id = %rule.id, mode = ?rule.mode, cooldown = ?rule.cooldown, "trigger rule registered");
        rules.push(Arc::new(RuleSlot {
            rule: RwLock::new(rule),
            state: Mutex::new(RuleState::default()),
        }));
        Ok(())
    }

    /// Returns false if no rule has this id.
    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let Some(slot) = self.slot(rule_id) else {
            return false;
        };
        slot.rule
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .enabled = enabled;
        true
    }

    pub fn events(&self) -> &AppendLog<TriggerEvent> {
        &self.events
    }

    fn slots(&self) -> Vec<Arc<RuleSlot>> {
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn slot(&self, rule_id: &str) -> Option<Arc<RuleSlot>> {
        self.slots().into_iter().find(|slot| slot.rule().id == rule_id)
    }

    pub fn rule_status(&self, rule_id: &str) -> Option<RuleStatus> {
        self.slot(rule_id).map(|slot| status(&slot, Instant::now()))
    }

    pub fn statuses(&self) -> Vec<RuleStatus> {
        let now = Instant::now();
        self.slots().iter().map(|slot| status(slot, now)).collect()
    }

    /// Periodic pass over tick-driven rules.
    pub fn evaluate_tick(&self) -> PassReport {
        self.evaluate_pass(&TriggerCause::Tick, |rule| rule.mode.on_tick())
    }

    /// Pass over change-driven rules that watch this event.
    pub fn evaluate_change(&self, event: &InvalidationEvent) -> PassReport {
        let cause = TriggerCause::Invalidation {
            key: event.key.clone(),
        };
        self.evaluate_pass(&cause, |rule| {
            rule.mode.on_change() && rule.predicate.watches(event)
        })
    }

    /// Every change-driven rule, used when events were missed.
    pub fn evaluate_lagged(&self) -> PassReport {
        self.evaluate_pass(&TriggerCause::Lagged, |rule| rule.mode.on_change())
    }

    /// Every rule regardless of mode.
    pub fn evaluate_all(&self) -> PassReport {
        self.evaluate_pass(&TriggerCause::Manual, |_| true)
    }

    fn evaluate_pass(&self, cause: &TriggerCause, selected: impl Fn(&TriggerRule) -> bool) -> PassReport {
        let _pass = lock(&self.pass);
        let mut report = PassReport::default();

        for slot in self.slots() {
            let rule = slot.rule();
            if !selected(&rule) {
                continue;
            }
            let outcome = self.evaluate_rule(&slot, &rule, cause);
            report.record(&outcome);
        }

        if report.evaluated > 0 {
            debug!(cause = ?cause, ?report, "trigger pass complete");
        }
        report
    }

    fn evaluate_rule(&self, slot: &RuleSlot, rule: &TriggerRule, cause: &TriggerCause) -> RuleOutcome {
        if !rule.enabled {
            return RuleOutcome::Disabled;
        }

        let mut state = match slot.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!(rule_id = %rule.id, "rule already evaluating, skipping");
                return RuleOutcome::Busy;
            }
        };

        let now = Instant::now();
        let wall_now = Utc::now();
        let ctx = EvaluationContext {
            index: self.index.as_ref(),
            cache: self.cache.as_ref(),
            now: wall_now,
        };

        let result = catch_unwind(AssertUnwindSafe(|| rule.predicate.evaluate(&ctx)))
            .unwrap_or_else(|panic| Err(PredicateError::Panicked(panic_message(&panic))));
        state.last_evaluated = Some(wall_now);

        let evaluation = match result {
            Ok(evaluation) => evaluation,
            Err(source) => {
                let error = TriggerEvaluationError {
                    rule_id: rule.id.clone(),
                    source,
                };
                warn!(rule_id = %rule.id, error = %error, "trigger evaluation failed");
                state.last_error = Some(error.to_string());
                return RuleOutcome::Failed(error);
            }
        };
        state.last_error = None;

        if !evaluation.matched {
            return RuleOutcome::NotMatched;
        }

        if let Some(until) = state.cooldown_until.filter(|until| *until > now) {
            let remaining_ms = until.duration_since(now).as_millis() as u64;
            state.suppressed += 1;
            debug!(rule_id = %rule.id, remaining_ms, "rule matched during cooldown");
            self.record(rule, wall_now, cause, Disposition::Suppressed { remaining_ms }, evaluation.observed);
            return RuleOutcome::Suppressed;
        }

        match self.sink.enqueue(rule.action.clone(), TaskOrigin::Rule(rule.id.clone())) {
            Ok(task_id) => {
                state.cooldown_until = Some(now + rule.cooldown);
                state.last_fired = Some(wall_now);
                state.fires += 1;
                info!(rule_id = %rule.id, task_id = %task_id, action = %rule.action, "rule fired");
                self.record(rule, wall_now, cause, Disposition::Dispatched { task_id }, evaluation.observed);
                RuleOutcome::Fired { task_id }
            }
            Err(failure) => {
                warn!(rule_id = %rule.id, error = %failure, "rule matched but action could not be enqueued");
                self.record(
                    rule,
                    wall_now,
                    cause,
                    Disposition::DispatchFailed {
                        reason: failure.to_string(),
                    },
                    evaluation.observed,
                );
                RuleOutcome::DispatchFailed
            }
        }
    }

    fn record(
        &self,
        rule: &TriggerRule,
        fired_at: DateTime<Utc>,
        cause: &TriggerCause,
        disposition: Disposition,
        context: Value,
    ) {
        self.events.append(TriggerEvent {
            rule_id: rule.id.clone(),
            fired_at,
            cause: cause.clone(),
            disposition,
            context,
        });
    }

    /// Evaluate on every tick and on every invalidation until `shutdown`.
    pub async fn run(
        self: Arc<Self>,
        mut invalidations: broadcast::Receiver<Arc<InvalidationEvent>>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut bus_open = true;

        info!(tick = ?self.config.tick_interval, "trigger engine starting");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.evaluate_tick();
                }
                received = invalidations.recv(), if bus_open => match received {
                    Ok(event) => {
                        self.evaluate_change(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "trigger engine lagged behind invalidations");
                        self.evaluate_lagged();
                    }
                    Err(RecvError::Closed) => {
                        warn!("invalidation bus closed, continuing on ticks only");
                        bus_open = false;
                    }
                },
            }
        }

        info!("trigger engine stopped");
    }
}

impl std::fmt::Debug for TriggerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerEngine")
            .field("rules", &self.slots().len())
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn status(slot: &RuleSlot, now: Instant) -> RuleStatus {
    let rule = slot.rule();
    let (phase, state) = match slot.state.try_lock() {
        Ok(state) => (cooldown_phase(&state, now), Some(snapshot(&state))),
        Err(TryLockError::Poisoned(poisoned)) => {
            let state = poisoned.into_inner();
            (cooldown_phase(&state, now), Some(snapshot(&state)))
        }
        Err(TryLockError::WouldBlock) => (RulePhase::Evaluating, None),
    };
    let state = state.unwrap_or_default();

    RuleStatus {
        id: rule.id,
        enabled: rule.enabled,
        mode: rule.mode,
        phase,
        last_evaluated: state.last_evaluated,
        last_fired: state.last_fired,
        last_error: state.last_error,
        fires: state.fires,
        suppressed: state.suppressed,
    }
}

fn cooldown_phase(state: &RuleState, now: Instant) -> RulePhase {
    match state.cooldown_until {
        Some(until) if until > now => RulePhase::Cooldown {
            remaining_ms: until.duration_since(now).as_millis() as u64,
        },
        _ => RulePhase::Idle,
    }
}

fn snapshot(state: &RuleState) -> RuleState {
    RuleState {
        cooldown_until: state.cooldown_until,
        last_evaluated: state.last_evaluated,
        last_fired: state.last_fired,
        last_error: state.last_error.clone(),
        fires: state.fires,
        suppressed: state.suppressed,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

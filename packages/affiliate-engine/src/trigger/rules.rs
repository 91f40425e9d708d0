//! Trigger rules and the predicates they evaluate.
//!
//! Predicates get read-only views of the index and the cache; they have no
//! way to mutate either. Rules loaded from JSON use the built-in
//! [`PredicateSpec`] variants; anything else implements [`RulePredicate`]
//! directly and is registered through [`TriggerRule::builder`].

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use typed_builder::TypedBuilder;

use crate::cache::{CacheMetrics, CacheQuery};
use crate::dispatch::ActionDescriptor;
use crate::error::{ConfigError, PredicateError};
use crate::events::InvalidationEvent;
use crate::index::{IndexReader, ProgramQuery};

/// What a predicate can see.
pub struct EvaluationContext<'a> {
    pub index: &'a dyn IndexReader,
    pub cache: &'a dyn CacheMetrics,
    pub now: DateTime<Utc>,
}

/// Result of one predicate evaluation. `observed` is stored with the
/// trigger event as the evaluated context snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub matched: bool,
    pub observed: Value,
}

impl Evaluation {
    pub fn new(matched: bool, observed: Value) -> Self {
        Self { matched, observed }
    }
}

pub trait RulePredicate: Send + Sync {
    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Evaluation, PredicateError>;

    /// Whether an invalidation could change this predicate's answer.
    /// Only consulted for rules that evaluate on change.
    fn watches(&self, _event: &InvalidationEvent) -> bool {
        true
    }
}

/// Matches while fewer than `threshold` programs satisfy `query`.
#[derive(Debug, Clone)]
pub struct MinPrograms {
    pub query: ProgramQuery,
    pub threshold: usize,
}

impl RulePredicate for MinPrograms {
    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Evaluation, PredicateError> {
        let count = ctx.index.count(&self.query);
        Ok(Evaluation::new(
            count < self.threshold,
            json!({ "count": count, "threshold": self.threshold, "query": self.query }),
        ))
    }

    fn watches(&self, event: &InvalidationEvent) -> bool {
        event.states().any(|p| self.query.may_include(p))
    }
}

/// Matches when any program in the segment has not been modified within
/// `max_age`.
#[derive(Debug, Clone)]
pub struct StaleSegment {
    pub query: ProgramQuery,
    pub max_age: Duration,
}

impl RulePredicate for StaleSegment {
    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Evaluation, PredicateError> {
        let max_age = chrono::Duration::from_std(self.max_age)
            .map_err(|e| PredicateError::InvalidParameter(format!("max_age: {e}")))?;
        let cutoff = ctx.now.checked_sub_signed(max_age).ok_or_else(|| {
            PredicateError::InvalidParameter(format!(
                "max_age: {}s reaches past the earliest representable time",
                self.max_age.as_secs()
            ))
        })?;

        let programs = ctx.index.search(&self.query);
        let stale: Vec<&str> = programs
            .iter()
            .filter(|p| p.last_modified < cutoff)
            .map(|p| p.key.as_str())
            .collect();

        Ok(Evaluation::new(
            !stale.is_empty(),
            json!({ "segment": programs.len(), "stale": stale, "max_age_secs": self.max_age.as_secs() }),
        ))
    }

    fn watches(&self, event: &InvalidationEvent) -> bool {
        event.states().any(|p| self.query.may_include(p))
    }
}

/// Matches when the cache hit rate drops below `min_rate` once at least
/// `min_lookups` lookups have happened.
#[derive(Debug, Clone)]
pub struct CacheHitRateBelow {
    pub min_rate: f64,
    pub min_lookups: u64,
}

impl RulePredicate for CacheHitRateBelow {
    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Evaluation, PredicateError> {
        if !(0.0..=1.0).contains(&self.min_rate) {
            return Err(PredicateError::InvalidParameter(format!(
                "min_rate must be within 0..=1, got {}",
                self.min_rate
            )));
        }

        let stats = ctx.cache.cache_stats();
        let lookups = stats.lookups();
        let rate = stats.hit_rate();
        let matched = lookups >= self.min_lookups.max(1)
            && rate.is_some_and(|r| r < self.min_rate);

        Ok(Evaluation::new(
            matched,
            json!({ "hit_rate": rate, "lookups": lookups, "min_rate": self.min_rate }),
        ))
    }

    fn watches(&self, _event: &InvalidationEvent) -> bool {
        false
    }
}

/// When a rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// Only on the periodic tick.
    Periodic,
    /// Only when an invalidation the predicate watches arrives.
    OnChange,
    #[default]
    Both,
}

impl EvaluationMode {
    pub fn on_tick(&self) -> bool {
        matches!(self, EvaluationMode::Periodic | EvaluationMode::Both)
    }

    pub fn on_change(&self) -> bool {
        matches!(self, EvaluationMode::OnChange | EvaluationMode::Both)
    }
}

#[derive(Clone, TypedBuilder)]
pub struct TriggerRule {
    #[builder(setter(into))]
    pub id: String,
    pub predicate: Arc<dyn RulePredicate>,
    pub cooldown: Duration,
    pub action: ActionDescriptor,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default)]
    pub mode: EvaluationMode,
}

impl fmt::Debug for TriggerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRule")
            .field("id", &self.id)
            .field("cooldown", &self.cooldown)
            .field("action", &self.action)
            .field("enabled", &self.enabled)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Serializable rules
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredicateSpec {
    MinPrograms {
        query: ProgramQuery,
        threshold: usize,
    },
    StaleSegment {
        query: ProgramQuery,
        max_age_secs: u64,
    },
    CacheHitRateBelow {
        min_rate: f64,
        #[serde(default)]
        min_lookups: u64,
    },
}

impl PredicateSpec {
    fn build(&self) -> Result<Arc<dyn RulePredicate>, String> {
        Ok(match self {
            PredicateSpec::MinPrograms { query, threshold } => {
                if *threshold == 0 {
                    return Err("threshold must be greater than zero".into());
                }
                Arc::new(MinPrograms {
                    query: query.clone(),
                    threshold: *threshold,
                })
            }
            PredicateSpec::StaleSegment { query, max_age_secs } => {
                if *max_age_secs == 0 {
                    return Err("max_age_secs must be greater than zero".into());
                }
                Arc::new(StaleSegment {
                    query: query.clone(),
                    max_age: Duration::from_secs(*max_age_secs),
                })
            }
            PredicateSpec::CacheHitRateBelow {
                min_rate,
                min_lookups,
            } => {
                if !(0.0..=1.0).contains(min_rate) {
                    return Err(format!("min_rate must be within 0..=1, got {min_rate}"));
                }
                Arc::new(CacheHitRateBelow {
                    min_rate: *min_rate,
                    min_lookups: *min_lookups,
                })
            }
        })
    }
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub predicate: PredicateSpec,
    pub cooldown_secs: u64,
    pub action: ActionDescriptor,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: EvaluationMode,
}

impl RuleSpec {
    pub fn into_rule(self) -> Result<TriggerRule, ConfigError> {
        let predicate = self.predicate.build().map_err(|reason| ConfigError::InvalidRule {
            rule_id: self.id.clone(),
            reason,
        })?;

        Ok(TriggerRule::builder()
            .id(self.id)
            .predicate(predicate)
            .cooldown(Duration::from_secs(self.cooldown_secs))
            .action(self.action)
            .enabled(self.enabled)
            .mode(self.mode)
            .build())
    }
}

/// Build rules from specs, rejecting duplicate ids.
pub fn rules_from_specs(specs: Vec<RuleSpec>) -> Result<Vec<TriggerRule>, ConfigError> {
    let mut seen = BTreeSet::new();
    specs
        .into_iter()
        .map(|spec| {
            if !seen.insert(spec.id.clone()) {
                return Err(ConfigError::DuplicateRule(spec.id));
            }
            spec.into_rule()
        })
        .collect()
}

/// Load a JSON array of rule specs.
pub fn load_rules(path: impl AsRef<Path>) -> Result<Vec<TriggerRule>, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let specs: Vec<RuleSpec> = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    rules_from_specs(specs)
}

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::ConfigError;
use crate::index::TieBreak;

/// Engine configuration loaded from `ENGINE_*` environment variables.
///
/// Every value has a default; only values that are present but unusable
/// are errors.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub trigger: TriggerConfig,
    pub dispatch: DispatchConfig,
    /// JSON array of field mapping tables.
    pub mappings_path: Option<PathBuf>,
    /// JSON array of trigger rule specs.
    pub rules_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Optimistic merge attempts per upsert before giving up on a key.
    pub max_merge_attempts: u32,
    pub tie_break: TieBreak,
    /// Invalidation events buffered per bus subscriber.
    pub event_capacity: usize,
    /// Merge conflicts retained in the audit log.
    pub conflict_log_capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_merge_attempts: 8,
            tie_break: TieBreak::default(),
            event_capacity: 10_000,
            conflict_log_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum live entries before LRU eviction.
    pub capacity: usize,
    /// Hard upper bound on entry age.
    pub ttl: Duration,
    /// Recent invalidations remembered for rejecting stale fills.
    pub invalidation_window: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl: Duration::from_secs(300),
            invalidation_window: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub tick_interval: Duration,
    /// Trigger events retained in the audit log.
    pub audit_capacity: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            audit_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrent discovery submissions.
    pub workers: usize,
    pub queue_capacity: usize,
    /// Attempts per task, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub task_timeout: Duration,
    /// Finished tasks kept for inspection; older ones are evicted.
    pub task_retention: usize,
    /// `None` disables rate limiting.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            task_timeout: Duration::from_secs(120),
            task_retention: 1_000,
            rate_limit: None,
        }
    }
}

/// Fixed-window limit applied per discovery strategy class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub max_concurrent: usize,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let vars = Vars(&lookup);

        let index = IndexConfig {
            max_merge_attempts: vars.parse("ENGINE_MAX_MERGE_ATTEMPTS", defaults.index.max_merge_attempts)?,
            tie_break: vars.parse("ENGINE_TIE_BREAK", defaults.index.tie_break)?,
            event_capacity: vars.parse("ENGINE_EVENT_CAPACITY", defaults.index.event_capacity)?,
            conflict_log_capacity: vars.parse("ENGINE_CONFLICT_LOG_CAPACITY", defaults.index.conflict_log_capacity)?,
        };

        let cache = CacheConfig {
            capacity: vars.parse("ENGINE_CACHE_CAPACITY", defaults.cache.capacity)?,
            ttl: vars.secs("ENGINE_CACHE_TTL_SECS", defaults.cache.ttl)?,
            invalidation_window: vars.parse("ENGINE_CACHE_INVALIDATION_WINDOW", defaults.cache.invalidation_window)?,
        };

        let trigger = TriggerConfig {
            tick_interval: vars.secs("ENGINE_TRIGGER_TICK_SECS", defaults.trigger.tick_interval)?,
            audit_capacity: vars.parse("ENGINE_AUDIT_CAPACITY", defaults.trigger.audit_capacity)?,
        };

        let rate_limit = match vars.get("ENGINE_RATE_LIMIT_MAX") {
            Some(_) => Some(RateLimitConfig {
                max_requests: vars.parse("ENGINE_RATE_LIMIT_MAX", 0)?,
                window: vars.secs("ENGINE_RATE_LIMIT_WINDOW_SECS", Duration::from_secs(60))?,
                max_concurrent: vars.parse("ENGINE_RATE_LIMIT_CONCURRENCY", 4)?,
            }),
            None => None,
        };

        let dispatch = DispatchConfig {
            workers: vars.parse("ENGINE_DISPATCH_WORKERS", defaults.dispatch.workers)?,
            queue_capacity: vars.parse("ENGINE_DISPATCH_QUEUE_CAPACITY", defaults.dispatch.queue_capacity)?,
            max_attempts: vars.parse("ENGINE_DISPATCH_MAX_ATTEMPTS", defaults.dispatch.max_attempts)?,
            base_backoff: vars.millis("ENGINE_DISPATCH_BASE_BACKOFF_MS", defaults.dispatch.base_backoff)?,
            max_backoff: vars.millis("ENGINE_DISPATCH_MAX_BACKOFF_MS", defaults.dispatch.max_backoff)?,
            task_timeout: vars.secs("ENGINE_DISPATCH_TASK_TIMEOUT_SECS", defaults.dispatch.task_timeout)?,
            task_retention: vars.parse("ENGINE_DISPATCH_TASK_RETENTION", defaults.dispatch.task_retention)?,
            rate_limit,
        };

        let config = Self {
            index,
            cache,
            trigger,
            dispatch,
            mappings_path: vars.get("ENGINE_MAPPINGS_PATH").map(PathBuf::from),
            rules_path: vars.get("ENGINE_RULES_PATH").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(var: &'static str, ok: bool) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::InvalidVar {
                    var,
                    reason: "must be greater than zero".into(),
                })
            }
        }

        positive("ENGINE_MAX_MERGE_ATTEMPTS", self.index.max_merge_attempts > 0)?;
        positive("ENGINE_EVENT_CAPACITY", self.index.event_capacity > 0)?;
        positive("ENGINE_CACHE_CAPACITY", self.cache.capacity > 0)?;
        positive("ENGINE_CACHE_TTL_SECS", !self.cache.ttl.is_zero())?;
        positive("ENGINE_TRIGGER_TICK_SECS", !self.trigger.tick_interval.is_zero())?;
        positive("ENGINE_DISPATCH_WORKERS", self.dispatch.workers > 0)?;
        positive("ENGINE_DISPATCH_QUEUE_CAPACITY", self.dispatch.queue_capacity > 0)?;
        positive("ENGINE_DISPATCH_MAX_ATTEMPTS", self.dispatch.max_attempts > 0)?;
        positive("ENGINE_DISPATCH_TASK_TIMEOUT_SECS", !self.dispatch.task_timeout.is_zero())?;

        if self.dispatch.base_backoff > self.dispatch.max_backoff {
            return Err(ConfigError::InvalidVar {
                var: "ENGINE_DISPATCH_BASE_BACKOFF_MS",
                reason: "must not exceed ENGINE_DISPATCH_MAX_BACKOFF_MS".into(),
            });
        }

        if let Some(limit) = &self.dispatch.rate_limit {
            positive("ENGINE_RATE_LIMIT_MAX", limit.max_requests > 0)?;
            positive("ENGINE_RATE_LIMIT_WINDOW_SECS", !limit.window.is_zero())?;
            positive("ENGINE_RATE_LIMIT_CONCURRENCY", limit.max_concurrent > 0)?;
        }
        Ok(())
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(var) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
                var,
                reason: format!("'{raw}': {e}"),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_millis() as u64).map(Duration::from_millis)
    }
}

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitDecision {
    Allow,
    DenyWindowLimit,
    DenyConcurrency,
}

/// Gatekeeper for discovery submissions, keyed by strategy class.
///
/// Every `Allow` must be paired with exactly one `release`.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn acquire(&self, key: &str) -> RateLimitDecision;

    async fn release(&self, key: &str);
}

/// Allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn acquire(&self, _key: &str) -> RateLimitDecision {
        RateLimitDecision::Allow
    }

    async fn release(&self, _key: &str) {}
}

#[derive(Debug)]
struct Window {
    started: Instant,
    granted: u32,
    in_flight: usize,
}

/// Fixed-window limiter with a per-key concurrency cap.
#[derive(Debug)]
pub struct WindowRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl WindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RateLimiter for WindowRateLimiter {
    async fn acquire(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut windows = self.lock();
        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            granted: 0,
            in_flight: 0,
        });

        if now.duration_since(window.started) >= self.config.window {
            window.started = now;
            window.granted = 0;
        }

        if window.in_flight >= self.config.max_concurrent {
            return RateLimitDecision::DenyConcurrency;
        }
        if window.granted >= self.config.max_requests {
            return RateLimitDecision::DenyWindowLimit;
        }

        window.granted += 1;
        window.in_flight += 1;
        RateLimitDecision::Allow
    }

    async fn release(&self, key: &str) {
        if let Some(window) = self.lock().get_mut(key) {
            window.in_flight = window.in_flight.saturating_sub(1);
        }
    }
}

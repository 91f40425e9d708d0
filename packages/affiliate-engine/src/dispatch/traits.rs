use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use super::task::{ActionDescriptor, ActionTask, TaskOrigin};
use crate::error::ActionFailure;
use crate::types::RawRecord;

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    NonRetryable,
}

impl FailureKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, FailureKind::Retryable)
    }
}

/// Structured failure returned by the discovery collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{reason}")]
pub struct DiscoveryFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl DiscoveryFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            reason: reason.into(),
        }
    }

    pub fn non_retryable(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NonRetryable,
            reason: reason.into(),
        }
    }
}

/// The external capability that actually finds programs.
#[async_trait]
pub trait DiscoveryCollaborator: Send + Sync {
    async fn submit(&self, descriptor: &ActionDescriptor) -> Result<Vec<RawRecord>, DiscoveryFailure>;
}

/// Receives tasks that exhausted their attempts.
pub trait MonitoringSink: Send + Sync {
    fn task_failed(&self, task: &ActionTask);
}

/// Reports terminal failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl MonitoringSink for TracingMonitor {
    fn task_failed(&self, task: &ActionTask) {
        error!(
            task_id = %task.id,
            action = %task.descriptor,
            attempts = task.attempts,
            error = task.last_error.as_deref().unwrap_or("unknown"),
            "discovery task failed permanently"
        );
    }
}

/// Where fired rules put their work.
pub trait ActionSink: Send + Sync {
    fn enqueue(&self, descriptor: ActionDescriptor, origin: TaskOrigin) -> Result<Uuid, ActionFailure>;
}

//! Asynchronous execution of discovery actions.

mod rate_limit;
mod task;
mod traits;
mod worker;

pub use rate_limit::{RateLimitDecision, RateLimiter, Unlimited, WindowRateLimiter};
pub use task::{ActionDescriptor, ActionTask, DiscoveryStrategy, TaskOrigin, TaskStatus};
pub use traits::{
    ActionSink, DiscoveryCollaborator, DiscoveryFailure, FailureKind, MonitoringSink,
    TracingMonitor,
};
pub use worker::{ActionDispatcher, DispatchStats};

//! Bounded worker pool for discovery actions.
//!
//! # Architecture
//!
//! ```text
//! ActionDispatcher::enqueue()  ─► mpsc queue (task ids)
//!                                     │
//! ActionDispatcher::run()  ◄──────────┘◄──── delayed (backoff timers)
//!     │  Semaphore(workers) + JoinSet                 ▲
//!     └─► process(task) ─ one attempt                 │
//!           ├─ RateLimiter::acquire(strategy class)   │
//!           ├─ timeout(DiscoveryCollaborator::submit) │
//!           ├─ RateLimiter::release                   │
//!           ├─ ok        → Ingestor::ingest_batch → Succeeded
//!           ├─ timed out → requeue once ──────────────┤
//!           ├─ retryable → Retrying, backoff ─────────┘
//!           └─ otherwise → Failed → MonitoringSink
//! ```
//!
//! A worker permit is held only while an attempt runs. Backoff and
//! requeue waits happen in the run loop, so a task waiting to retry never
//! occupies a pool slot. No index lock is held while a submission is in
//! flight; discovered records go through the same ingestion path as any
//! other batch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::rate_limit::{RateLimitDecision, RateLimiter};
use super::task::{ActionDescriptor, ActionTask, TaskOrigin, TaskStatus};
use super::traits::{ActionSink, DiscoveryCollaborator, MonitoringSink};
use crate::config::DispatchConfig;
use crate::error::ActionFailure;
use crate::ingest::Ingestor;
use crate::types::RawRecord;

/// Live task counts plus lifetime totals. `succeeded` and `failed` count
/// every finished task, including ones already evicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub rejected_full: u64,
}

/// What the run loop does with a task after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Followup {
    Done,
    RunAfter(Duration),
}

struct Shared {
    config: DispatchConfig,
    collaborator: Arc<dyn DiscoveryCollaborator>,
    monitor: Arc<dyn MonitoringSink>,
    limiter: Arc<dyn RateLimiter>,
    ingestor: Ingestor,
    tasks: DashMap<Uuid, ActionTask>,
    /// Terminal task ids, oldest first.
    finished: Mutex<VecDeque<Uuid>>,
    queue: mpsc::Sender<Uuid>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    rejected_full: AtomicU64,
}

pub struct ActionDispatcher {
    shared: Arc<Shared>,
    receiver: Mutex<Option<mpsc::Receiver<Uuid>>>,
}

impl ActionDispatcher {
    pub fn new(
        config: DispatchConfig,
        collaborator: Arc<dyn DiscoveryCollaborator>,
        monitor: Arc<dyn MonitoringSink>,
        limiter: Arc<dyn RateLimiter>,
        ingestor: Ingestor,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                collaborator,
                monitor,
                limiter,
                ingestor,
                tasks: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                queue,
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                rejected_full: AtomicU64::new(0),
            }),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// A live task, or a finished one still within `task_retention`.
    pub fn task(&self, id: Uuid) -> Option<ActionTask> {
        self.shared.tasks.get(&id).map(|task| task.value().clone())
    }

    /// All retained tasks, oldest first.
    pub fn tasks(&self) -> Vec<ActionTask> {
        let mut tasks: Vec<ActionTask> = self
            .shared
            .tasks
            .iter()
            .map(|task| task.value().clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn stats(&self) -> DispatchStats {
        let mut stats = DispatchStats {
            succeeded: self.shared.succeeded.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
            timeouts: self.shared.timeouts.load(Ordering::Relaxed),
            rejected_full: self.shared.rejected_full.load(Ordering::Relaxed),
            ..Default::default()
        };
        for task in self.shared.tasks.iter() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Retrying => stats.retrying += 1,
                TaskStatus::Succeeded | TaskStatus::Failed => {}
            }
        }
        stats
    }

    /// Consume the queue until `shutdown` fires, then wait for in-flight
    /// tasks. Only the first call does anything.
    pub async fn run(&self, shutdown: CancellationToken) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut receiver) = receiver else {
            warn!("action dispatcher is already running");
            return;
        };

        let workers = self.shared.config.workers.max(1);
        let permits = Arc::new(Semaphore::new(workers));
        let mut running: JoinSet<(Uuid, Followup)> = JoinSet::new();
        let mut delayed: JoinSet<Uuid> = JoinSet::new();
        info!(workers, "action dispatcher starting");

        loop {
            let ready = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    match joined {
                        Ok((id, Followup::RunAfter(delay))) => {
                            let wake = shutdown.child_token();
                            delayed.spawn(async move {
                                tokio::select! {
                                    _ = wake.cancelled() => {}
                                    _ = tokio::time::sleep(delay) => {}
                                }
                                id
                            });
                        }
                        Ok((_, Followup::Done)) => {}
                        Err(e) => error!(error = %e, "action task panicked"),
                    }
                    continue;
                }
                Some(joined) = delayed.join_next(), if !delayed.is_empty() => match joined {
                    Ok(id) => id,
                    Err(e) => {
                        error!(error = %e, "retry timer failed");
                        continue;
                    }
                },
                next = receiver.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let Some(permit) = acquire(&permits, &shutdown).await else {
                self.shared.fail(ready, &ActionFailure::Closed);
                break;
            };
            let shared = Arc::clone(&self.shared);
            let cancel = shutdown.child_token();
            running.spawn(async move {
                let _permit = permit;
                (ready, shared.process(ready, cancel).await)
            });
        }

        // Queued and waiting work is failed, not dropped.
        receiver.close();
        while let Ok(id) = receiver.try_recv() {
            self.shared.fail(id, &ActionFailure::Closed);
        }

        if !running.is_empty() {
            info!(count = running.len(), "waiting for in-flight actions");
        }
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((id, Followup::RunAfter(_))) => self.shared.fail(id, &ActionFailure::Closed),
                Ok((_, Followup::Done)) => {}
                Err(e) => error!(error = %e, "action task panicked"),
            }
        }
        while let Some(joined) = delayed.join_next().await {
            if let Ok(id) = joined {
                self.shared.fail(id, &ActionFailure::Closed);
            }
        }
        info!("action dispatcher stopped");
    }
}

async fn acquire(permits: &Arc<Semaphore>, shutdown: &CancellationToken) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        permit = Arc::clone(permits).acquire_owned() => permit.ok(),
    }
}

impl ActionSink for ActionDispatcher {
    fn enqueue(&self, descriptor: ActionDescriptor, origin: TaskOrigin) -> Result<Uuid, ActionFailure> {
        let task = ActionTask::new(descriptor, origin);
        let id = task.id;
        debug!(task_id = %id, action = %task.descriptor, "enqueueing action");
        self.shared.tasks.insert(id, task);

        match self.shared.queue.try_send(id) {
            Ok(()) => Ok(id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.tasks.remove(&id);
                self.shared.rejected_full.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %id, "action queue full");
                Err(ActionFailure::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.tasks.remove(&id);
                Err(ActionFailure::Closed)
            }
        }
    }
}

impl Shared {
    fn update(&self, id: Uuid, f: impl FnOnce(&mut ActionTask)) -> Option<ActionTask> {
        let mut task = self.tasks.get_mut(&id)?;
        f(task.value_mut());
        task.updated_at = Utc::now();
        Some(task.value().clone())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.config
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff)
    }

    /// Run one attempt and decide what happens next.
    async fn process(&self, id: Uuid, cancel: CancellationToken) -> Followup {
        let Some(task) = self.update(id, |task| {
            task.status = TaskStatus::Running;
            task.attempts += 1;
        }) else {
            warn!(task_id = %id, "dequeued unknown task");
            return Followup::Done;
        };

        debug!(task_id = %id, attempt = task.attempts, action = %task.descriptor, "running action");

        let failure = match self.attempt(&task.descriptor, &cancel).await {
            Ok(records) => {
                self.succeed(id, records);
                return Followup::Done;
            }
            Err(failure) => failure,
        };

        if let ActionFailure::TimedOut(after) = &failure {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            if task.requeued || cancel.is_cancelled() {
                self.fail(id, &failure);
                return Followup::Done;
            }
            self.update(id, |task| {
                task.status = TaskStatus::Pending;
                task.requeued = true;
                task.last_error = Some(failure.to_string());
            });
            warn!(task_id = %id, timeout = ?after, "action timed out, requeued");
            return Followup::RunAfter(Duration::ZERO);
        }

        let retry = failure.failure_kind().should_retry()
            && task.attempts < self.config.max_attempts
            && !cancel.is_cancelled();
        if !retry {
            self.fail(id, &failure);
            return Followup::Done;
        }

        let delay = self.backoff(task.attempts);
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.update(id, |task| {
            task.status = TaskStatus::Retrying;
            task.last_error = Some(failure.to_string());
        });
        warn!(
            task_id = %id,
            attempt = task.attempts,
            delay = ?delay,
            error = %failure,
            "action failed, retrying"
        );
        Followup::RunAfter(delay)
    }

    /// One submission, bracketed by the rate limiter. The limiter slot is
    /// released before returning on every path, including timeout.
    async fn attempt(
        &self,
        descriptor: &ActionDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRecord>, ActionFailure> {
        let class = descriptor.strategy_class();
        match self.limiter.acquire(class).await {
            RateLimitDecision::Allow => {}
            decision => {
                debug!(class, ?decision, "submission denied by rate limiter");
                return Err(ActionFailure::RateLimited(class.to_string()));
            }
        }

        let timeout = self.config.task_timeout;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ActionFailure::Closed),
            result = tokio::time::timeout(timeout, self.collaborator.submit(descriptor)) => match result {
                Ok(Ok(records)) => Ok(records),
                Ok(Err(failure)) => Err(ActionFailure::Discovery(failure)),
                Err(_) => Err(ActionFailure::TimedOut(timeout)),
            },
        };

        self.limiter.release(class).await;
        outcome
    }

    fn succeed(&self, id: Uuid, records: Vec<RawRecord>) {
        let discovered = records.len();
        let report = self.ingestor.ingest_batch(records);

        self.update(id, |task| {
            task.status = TaskStatus::Succeeded;
            task.last_error = None;
            task.rejected = report.rejected.len();
            task.merge = Some(report.merge.clone());
        });
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.retire(id);

        info!(
            task_id = %id,
            discovered,
            added = report.merge.added,
            updated = report.merge.updated,
            rejected = report.rejected.len(),
            "action succeeded"
        );
    }

    fn fail(&self, id: Uuid, failure: &ActionFailure) {
        let Some(task) = self.update(id, |task| {
            task.status = TaskStatus::Failed;
            task.last_error = Some(failure.to_string());
        }) else {
            return;
        };
        self.failed.fetch_add(1, Ordering::Relaxed);
        error!(task_id = %id, attempts = task.attempts, error = %failure, "action failed");
        self.monitor.task_failed(&task);
        self.retire(id);
    }

    /// Record a terminal task and evict the oldest beyond `task_retention`.
    fn retire(&self, id: Uuid) {
        let mut finished = self
            .finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        finished.push_back(id);
        while finished.len() > self.config.task_retention {
            if let Some(evicted) = finished.pop_front() {
                self.tasks.remove(&evicted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, RateLimitConfig};
    use crate::dispatch::{DiscoveryFailure, DiscoveryStrategy, Unlimited, WindowRateLimiter};
    use crate::index::MasterIndex;
    use crate::mapping::{FieldMappingTable, MappingRegistry, Transform};
    use crate::types::Field;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    enum Step {
        Found(Vec<RawRecord>),
        Fail(DiscoveryFailure),
        Hang,
    }

    #[derive(Default)]
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DiscoveryCollaborator for Scripted {
        async fn submit(&self, _descriptor: &ActionDescriptor) -> Result<Vec<RawRecord>, DiscoveryFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Found(records)) => Ok(records),
                Some(Step::Fail(failure)) => Err(failure),
                Some(Step::Hang) => {
                    futures::future::pending::<()>().await;
                    Ok(Vec::new())
                }
                None => Ok(Vec::new()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingMonitor(Mutex<Vec<ActionTask>>);

    impl MonitoringSink for RecordingMonitor {
        fn task_failed(&self, task: &ActionTask) {
            self.0.lock().unwrap().push(task.clone());
        }
    }

    /// Fails every submission for one niche and succeeds for the rest,
    /// remembering when each niche was submitted.
    struct ByNiche {
        failing: &'static str,
        started: tokio::time::Instant,
        calls: Mutex<Vec<(String, Duration)>>,
    }

    impl ByNiche {
        fn failing(niche: &'static str) -> Arc<Self> {
            Arc::new(Self {
                failing: niche,
                started: tokio::time::Instant::now(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn submitted_at(&self, niche: &str) -> Vec<Duration> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _)| n == niche)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl DiscoveryCollaborator for ByNiche {
        async fn submit(&self, descriptor: &ActionDescriptor) -> Result<Vec<RawRecord>, DiscoveryFailure> {
            let niche = match descriptor {
                ActionDescriptor::DiscoverNiche { niche, .. } => niche.clone(),
                other => other.to_string(),
            };
            self.calls
                .lock()
                .unwrap()
                .push((niche.clone(), self.started.elapsed()));
            if niche == self.failing {
                Err(DiscoveryFailure::retryable("upstream unavailable"))
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            workers: 2,
            queue_capacity: 8,
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            task_timeout: Duration::from_secs(5),
            task_retention: 16,
            rate_limit: None,
        }
    }

    fn ingestor() -> Ingestor {
        let registry = MappingRegistry::from_tables([FieldMappingTable::new("discovery", 1)
            .map("domain", Field::Domain, Transform::Domain)
            .map("niche", Field::Niche, Transform::Lowercase)])
        .unwrap();
        Ingestor::new(Arc::new(MasterIndex::new(
            Arc::new(registry),
            IndexConfig::default(),
        )))
    }

    fn found(domain: &str) -> RawRecord {
        RawRecord::new("discovery", 1, Utc::now())
            .with_field("domain", domain)
            .with_field("niche", "fitness")
    }

    struct Harness {
        dispatcher: Arc<ActionDispatcher>,
        monitor: Arc<RecordingMonitor>,
        ingestor: Ingestor,
        shutdown: CancellationToken,
    }

    fn start(
        collaborator: Arc<dyn DiscoveryCollaborator>,
        config: DispatchConfig,
        limiter: Arc<dyn RateLimiter>,
    ) -> Harness {
        let monitor = Arc::new(RecordingMonitor::default());
        let ingestor = ingestor();
        let dispatcher = Arc::new(ActionDispatcher::new(
            config,
            collaborator,
            monitor.clone(),
            limiter,
            ingestor.clone(),
        ));
        let shutdown = CancellationToken::new();
        let runner = Arc::clone(&dispatcher);
        let token = shutdown.clone();
        tokio::spawn(async move { runner.run(token).await });
        Harness {
            dispatcher,
            monitor,
            ingestor,
            shutdown,
        }
    }

    async fn settled(dispatcher: &ActionDispatcher, id: Uuid) -> ActionTask {
        for _ in 0..10_000 {
            if let Some(task) = dispatcher.task(id) {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never settled");
    }

    async fn finished(dispatcher: &ActionDispatcher, count: u64) {
        for _ in 0..10_000 {
            let stats = dispatcher.stats();
            if stats.succeeded + stats.failed >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fewer than {count} tasks finished");
    }

    fn niche() -> ActionDescriptor {
        discover("fitness")
    }

    fn discover(niche: &str) -> ActionDescriptor {
        ActionDescriptor::discover_niche(niche, DiscoveryStrategy::SearchEngine)
    }

    #[tokio::test(start_paused = true)]
    async fn discovered_records_are_ingested() {
        let collaborator = Scripted::new(vec![Step::Found(vec![found("a.com"), found("b.com")])]);
        let h = start(collaborator, config(), Arc::new(Unlimited));

        let id = h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap();
        let task = settled(&h.dispatcher, id).await;

        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.merge.map(|m| m.added), Some(2));
        assert_eq!(h.ingestor.index().len(), 2);
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let collaborator = Scripted::new(vec![
            Step::Fail(DiscoveryFailure::retryable("503")),
            Step::Fail(DiscoveryFailure::retryable("503")),
            Step::Found(vec![found("a.com")]),
        ]);
        let h = start(collaborator.clone(), config(), Arc::new(Unlimited));

        let id = h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap();
        let task = settled(&h.dispatcher, id).await;

        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 3);
        assert_eq!(collaborator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.dispatcher.stats().retries, 2);
        assert!(h.monitor.0.lock().unwrap().is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_reach_monitoring() {
        let collaborator = Scripted::new(vec![
            Step::Fail(DiscoveryFailure::retryable("503")),
            Step::Fail(DiscoveryFailure::retryable("503")),
            Step::Fail(DiscoveryFailure::retryable("503")),
        ]);
        let h = start(collaborator, config(), Arc::new(Unlimited));

        let id = h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap();
        let task = settled(&h.dispatcher, id).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        let reported = h.monitor.0.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].id, id);
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failures_fail_immediately() {
        let collaborator = Scripted::new(vec![Step::Fail(DiscoveryFailure::non_retryable("bad niche"))]);
        let h = start(collaborator.clone(), config(), Arc::new(Unlimited));

        let id = h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap();
        let task = settled(&h.dispatcher, id).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.last_error.as_deref(), Some("bad niche"));
        assert_eq!(h.monitor.0.lock().unwrap().len(), 1);
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_task_is_requeued_once_then_failed() {
        let collaborator = Scripted::new(vec![Step::Hang, Step::Hang]);
        let h = start(collaborator.clone(), config(), Arc::new(Unlimited));

        let id = h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap();
        let task = settled(&h.dispatcher, id).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.requeued);
        assert_eq!(task.attempts, 2);
        assert_eq!(collaborator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.dispatcher.stats().timeouts, 2);
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_task_can_succeed_after_requeue() {
        let collaborator = Scripted::new(vec![Step::Hang, Step::Found(vec![found("a.com")])]);
        let h = start(collaborator, config(), Arc::new(Unlimited));

        let id = h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap();
        let task = settled(&h.dispatcher, id).await;

        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.requeued);
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_requeue_does_not_need_queue_space() {
        let collaborator = Scripted::new(vec![Step::Hang]);
        let h = start(
            collaborator.clone(),
            DispatchConfig {
                workers: 1,
                queue_capacity: 1,
                ..config()
            },
            Arc::new(Unlimited),
        );

        let hung = h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Taken off the queue, waiting for the only worker.
        let second = h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Occupies the only queue slot when the first task times out.
        let third = h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap();

        let task = settled(&h.dispatcher, hung).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.requeued);
        assert_eq!(task.attempts, 2);
        assert_eq!(settled(&h.dispatcher, second).await.status, TaskStatus::Succeeded);
        assert_eq!(settled(&h.dispatcher, third).await.status, TaskStatus::Succeeded);
        assert_eq!(collaborator.calls.load(Ordering::SeqCst), 4);
        assert!(h.monitor.0.lock().unwrap().is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn task_in_backoff_leaves_its_worker_free() {
        let collaborator = ByNiche::failing("slow");
        let h = start(
            collaborator.clone(),
            DispatchConfig {
                workers: 1,
                base_backoff: Duration::from_secs(30),
                max_backoff: Duration::from_secs(120),
                ..config()
            },
            Arc::new(Unlimited),
        );

        let slow = h.dispatcher.enqueue(discover("slow"), TaskOrigin::Manual).unwrap();
        let fast = h.dispatcher.enqueue(discover("fast"), TaskOrigin::Manual).unwrap();

        assert_eq!(settled(&h.dispatcher, fast).await.status, TaskStatus::Succeeded);
        assert_eq!(h.dispatcher.task(slow).unwrap().status, TaskStatus::Retrying);
        let fast_at = collaborator.submitted_at("fast");
        assert_eq!(fast_at.len(), 1);
        assert!(fast_at[0] < Duration::from_secs(30), "fast waited {:?}", fast_at[0]);

        let slow_task = settled(&h.dispatcher, slow).await;
        assert_eq!(slow_task.status, TaskStatus::Failed);
        assert_eq!(slow_task.attempts, 3);
        let slow_at = collaborator.submitted_at("slow");
        assert_eq!(slow_at.len(), 3);
        assert!(slow_at[1] - slow_at[0] >= Duration::from_secs(30));
        assert!(slow_at[2] - slow_at[1] >= Duration::from_secs(60));
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_tasks_waiting_to_retry() {
        let collaborator = ByNiche::failing("slow");
        let h = start(
            collaborator,
            DispatchConfig {
                base_backoff: Duration::from_secs(30),
                max_backoff: Duration::from_secs(120),
                ..config()
            },
            Arc::new(Unlimited),
        );

        let id = h.dispatcher.enqueue(discover("slow"), TaskOrigin::Manual).unwrap();
        for _ in 0..100 {
            if h.dispatcher.task(id).is_some_and(|t| t.status == TaskStatus::Retrying) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.shutdown.cancel();

        let task = settled(&h.dispatcher, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.last_error.as_deref(), Some("dispatcher is shut down"));
        assert_eq!(h.monitor.0.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_tasks_are_evicted_beyond_retention() {
        let h = start(
            Scripted::new(vec![]),
            DispatchConfig {
                task_retention: 3,
                ..config()
            },
            Arc::new(Unlimited),
        );

        let mut ids = Vec::new();
        for n in 1..=10 {
            ids.push(h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap());
            finished(&h.dispatcher, n).await;
        }

        let mut retained: Vec<Uuid> = h.dispatcher.tasks().iter().map(|t| t.id).collect();
        retained.sort();
        let mut newest = ids[7..].to_vec();
        newest.sort();
        assert_eq!(retained, newest);
        assert!(h.dispatcher.task(ids[0]).is_none());

        let stats = h.dispatcher.stats();
        assert_eq!(stats.succeeded, 10);
        assert_eq!(stats.pending + stats.running + stats.retrying, 0);
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_denial_is_retried_and_releases_nothing() {
        let limiter = Arc::new(WindowRateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            max_concurrent: 4,
        }));
        // The only slot in the window is spent before the task runs.
        assert_eq!(limiter.acquire("search_engine").await, RateLimitDecision::Allow);
        limiter.release("search_engine").await;

        let collaborator = Scripted::new(vec![]);
        let h = start(collaborator.clone(), config(), limiter);

        let id = h.dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap();
        let task = settled(&h.dispatcher, id).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.last_error.as_deref(), Some("rate limited on 'search_engine'"));
        assert_eq!(collaborator.calls.load(Ordering::SeqCst), 0);
        h.shutdown.cancel();
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let dispatcher = ActionDispatcher::new(
            config(),
            Scripted::new(vec![]),
            Arc::new(RecordingMonitor::default()),
            Arc::new(Unlimited),
            ingestor(),
        );
        let shared = &dispatcher.shared;
        assert_eq!(shared.backoff(1), Duration::from_millis(100));
        assert_eq!(shared.backoff(2), Duration::from_millis(200));
        assert_eq!(shared.backoff(4), Duration::from_millis(800));
        assert_eq!(shared.backoff(5), Duration::from_secs(1));
        assert_eq!(shared.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn full_queue_is_reported_to_the_caller() {
        let dispatcher = ActionDispatcher::new(
            DispatchConfig {
                queue_capacity: 1,
                ..config()
            },
            Scripted::new(vec![]),
            Arc::new(RecordingMonitor::default()),
            Arc::new(Unlimited),
            ingestor(),
        );

        assert!(dispatcher.enqueue(niche(), TaskOrigin::Manual).is_ok());
        assert_eq!(
            dispatcher.enqueue(niche(), TaskOrigin::Manual).unwrap_err(),
            ActionFailure::QueueFull
        );
        assert_eq!(dispatcher.tasks().len(), 1);
        assert_eq!(dispatcher.stats().rejected_full, 1);
    }
}

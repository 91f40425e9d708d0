//! Engine wiring and lifecycle.
//!
//! ```text
//! records ─► Ingestor ─► MasterIndex ──(listener, in commit)──► ProgramCache
//!                            │
//!                            └─(broadcast)─► TriggerEngine ─► ActionDispatcher
//!                                                                   │
//!            Ingestor ◄── discovered records ◄── DiscoveryCollaborator
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, ProgramCache};
use crate::config::EngineConfig;
use crate::dispatch::{
    ActionDescriptor, ActionDispatcher, ActionSink, DiscoveryCollaborator, DispatchStats,
    MonitoringSink, RateLimiter, TaskOrigin, TracingMonitor, Unlimited, WindowRateLimiter,
};
use crate::error::{ActionFailure, ConfigError, EngineError, IndexError};
use crate::index::{IndexStats, MasterIndex, ProgramPage, ProgramQuery};
use crate::ingest::{BatchReport, Ingestor};
use crate::mapping::MappingRegistry;
use crate::trigger::{load_rules, RuleStatus, TriggerEngine, TriggerRule};
use crate::types::{CanonicalProgram, IdentityKey, RawRecord};

/// Assembles an [`Engine`]. Only the discovery collaborator is required.
pub struct EngineBuilder {
    config: EngineConfig,
    collaborator: Arc<dyn DiscoveryCollaborator>,
    registry: Option<MappingRegistry>,
    monitor: Option<Arc<dyn MonitoringSink>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    rules: Vec<TriggerRule>,
}

impl EngineBuilder {
    /// Use this registry instead of loading `mappings_path`.
    pub fn registry(mut self, registry: MappingRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn MonitoringSink>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Added after any rules loaded from `rules_path`.
    pub fn rule(mut self, rule: TriggerRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate()?;

        let registry = match (self.registry, &config.mappings_path) {
            (Some(registry), _) => registry,
            (None, Some(path)) => MappingRegistry::load(path)?,
            (None, None) => {
                warn!("no field mappings configured, every record will be rejected");
                MappingRegistry::new()
            }
        };

        let mut rules = match &config.rules_path {
            Some(path) => load_rules(path)?,
            None => Vec::new(),
        };
        rules.extend(self.rules);

        let index = Arc::new(MasterIndex::new(Arc::new(registry), config.index.clone()));
        let cache = Arc::new(ProgramCache::new(config.cache.clone()));
        index.add_listener(cache.clone());

        let ingestor = Ingestor::new(Arc::clone(&index));
        let limiter: Arc<dyn RateLimiter> = match (self.limiter, config.dispatch.rate_limit) {
            (Some(limiter), _) => limiter,
            (None, Some(limits)) => Arc::new(WindowRateLimiter::new(limits)),
            (None, None) => Arc::new(Unlimited),
        };
        let monitor: Arc<dyn MonitoringSink> = match self.monitor {
            Some(monitor) => monitor,
            None => Arc::new(TracingMonitor),
        };
        let dispatcher = Arc::new(ActionDispatcher::new(
            config.dispatch.clone(),
            self.collaborator,
            monitor,
            limiter,
            ingestor.clone(),
        ));

        let trigger = Arc::new(TriggerEngine::new(
            config.trigger.clone(),
            index.clone(),
            cache.clone(),
            dispatcher.clone(),
        ));
        for rule in rules {
            trigger.add_rule(rule)?;
        }

        info!(
            sources = index.registry().sources().count(),
            rules = trigger.statuses().len(),
            workers = config.dispatch.workers,
            "engine assembled"
        );

        Ok(Engine {
            config,
            index,
            cache,
            ingestor,
            dispatcher,
            trigger,
        })
    }
}

/// The assembled index, cache, trigger engine and dispatcher.
pub struct Engine {
    config: EngineConfig,
    index: Arc<MasterIndex>,
    cache: Arc<ProgramCache>,
    ingestor: Ingestor,
    dispatcher: Arc<ActionDispatcher>,
    trigger: Arc<TriggerEngine>,
}

impl Engine {
    pub fn builder(config: EngineConfig, collaborator: Arc<dyn DiscoveryCollaborator>) -> EngineBuilder {
        EngineBuilder {
            config,
            collaborator,
            registry: None,
            monitor: None,
            limiter: None,
            rules: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ingest(&self, records: impl IntoIterator<Item = RawRecord>) -> BatchReport {
        self.ingestor.ingest_batch(records)
    }

    /// Query through the cache. Results are never staler than the last
    /// committed mutation.
    pub fn query(&self, query: &ProgramQuery) -> Result<ProgramPage, IndexError> {
        self.cache.get_or_compute(query, || self.index.page(query))
    }

    pub fn get(&self, key: &IdentityKey) -> Result<CanonicalProgram, IndexError> {
        self.index.get(key)
    }

    pub fn add_rule(&self, rule: TriggerRule) -> Result<(), ConfigError> {
        self.trigger.add_rule(rule)
    }

    /// Queue an action outside of any rule.
    pub fn enqueue(&self, descriptor: ActionDescriptor) -> Result<Uuid, ActionFailure> {
        self.dispatcher.enqueue(descriptor, TaskOrigin::Manual)
    }

    pub fn index(&self) -> &Arc<MasterIndex> {
        &self.index
    }

    pub fn cache(&self) -> &Arc<ProgramCache> {
        &self.cache
    }

    pub fn trigger(&self) -> &Arc<TriggerEngine> {
        &self.trigger
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn rule_statuses(&self) -> Vec<RuleStatus> {
        self.trigger.statuses()
    }

    /// Spawn the trigger loop and the dispatcher pool.
    ///
    /// The invalidation subscription is taken before this returns, so no
    /// mutation committed afterwards is missed. Must be called inside a
    /// tokio runtime.
    pub fn start(&self) -> EngineHandle {
        let shutdown = CancellationToken::new();

        let invalidations = self.index.subscribe();
        let trigger = tokio::spawn(
            Arc::clone(&self.trigger).run(invalidations, shutdown.child_token()),
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let token = shutdown.child_token();
        let dispatcher = tokio::spawn(async move { dispatcher.run(token).await });

        info!("engine started");
        EngineHandle {
            shutdown,
            trigger,
            dispatcher,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("index", &self.index)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

/// Running background tasks of a started [`Engine`].
pub struct EngineHandle {
    shutdown: CancellationToken,
    trigger: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl EngineHandle {
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop evaluating rules, stop taking tasks and wait for in-flight ones.
    pub async fn shutdown(self) {
        info!("engine shutting down");
        self.shutdown.cancel();

        if let Err(e) = self.trigger.await {
            error!(error = %e, "trigger loop ended abnormally");
        }
        if let Err(e) = self.dispatcher.await {
            error!(error = %e, "dispatcher ended abnormally");
        }

        info!("engine stopped");
    }
}

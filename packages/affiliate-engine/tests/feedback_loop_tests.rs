//! End-to-end behaviour of ingestion, cached queries, triggers and discovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use affiliate_engine::dispatch::{
    ActionDescriptor, DiscoveryFailure, DiscoveryStrategy, TaskOrigin, TaskStatus,
};
use affiliate_engine::index::ProgramQuery;
use affiliate_engine::trigger::{Disposition, MinPrograms, RulePhase, TriggerRule};
use affiliate_engine::{Commission, Engine, EngineConfig, MergeOutcome};
use common::*;

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.trigger.tick_interval = Duration::from_secs(1);
    config.dispatch.base_backoff = Duration::from_millis(100);
    config.dispatch.max_backoff = Duration::from_secs(1);
    config
}

fn fitness_gap(threshold: usize) -> TriggerRule {
    TriggerRule::builder()
        .id("fitness-gap")
        .predicate(Arc::new(MinPrograms {
            query: ProgramQuery::new().niche("fitness"),
            threshold,
        }))
        .cooldown(Duration::from_secs(3600))
        .action(ActionDescriptor::discover_niche(
            "fitness",
            DiscoveryStrategy::SearchEngine,
        ))
        .build()
}

fn dispositions(engine: &Engine) -> (usize, usize) {
    let events = engine.trigger().events().entries();
    let dispatched = events
        .iter()
        .filter(|e| matches!(e.entry.disposition, Disposition::Dispatched { .. }))
        .count();
    let suppressed = events
        .iter()
        .filter(|e| matches!(e.entry.disposition, Disposition::Suppressed { .. }))
        .count();
    (dispatched, suppressed)
}

#[tokio::test(start_paused = true)]
async fn fitness_gap_fires_once_and_discovery_feeds_the_index() {
    let collaborator = FakeCollaborator::returning(vec![
        RecordBuilder::crawled("fitgear.com")
            .niche("fitness")
            .commission("8%")
            .build(),
        RecordBuilder::crawled("https://www.RunFast.io/affiliates")
            .niche("Fitness")
            .commission("12%")
            .build(),
    ]);
    let engine = Engine::builder(config(), collaborator.clone())
        .registry(registry())
        .rule(fitness_gap(3))
        .build()
        .unwrap();

    engine.ingest([RecordBuilder::feed("kitchen.com").niche("cooking").build()]);
    let query = ProgramQuery::new().niche("fitness");
    assert_eq!(engine.query(&query).unwrap().total, 0);

    let handle = engine.start();
    wait_until(|| engine.query(&query).is_ok_and(|page| page.total == 2)).await;

    // Two programs is still under the threshold; the rule keeps matching
    // but stays in cooldown for the rest of the run.
    tokio::time::sleep(Duration::from_secs(30)).await;
    bounded(handle.shutdown()).await;

    let calls = collaborator.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        &calls[0],
        ActionDescriptor::DiscoverNiche { niche, .. } if niche == "fitness"
    ));

    let (dispatched, suppressed) = dispositions(&engine);
    assert_eq!(dispatched, 1);
    assert!(suppressed >= 20);
    let status = engine.trigger().rule_status("fitness-gap").unwrap();
    assert_eq!(status.fires, 1);
    assert!(matches!(status.phase, RulePhase::Cooldown { .. }));

    let tasks = engine.dispatcher().tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Succeeded);
    assert_eq!(tasks[0].origin, TaskOrigin::Rule("fitness-gap".into()));
    assert_eq!(tasks[0].merge.as_ref().map(|m| m.added), Some(2));

    let page = engine.query(&query).unwrap();
    let keys: Vec<&str> = page.items.iter().map(|p| p.key.as_str()).collect();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&"direct:fitgear.com"));
    assert!(keys.contains(&"direct:runfast.io"));
}

#[tokio::test(start_paused = true)]
async fn rule_does_not_fire_while_niche_is_covered() {
    let collaborator = FakeCollaborator::new();
    let engine = Engine::builder(config(), collaborator.clone())
        .registry(registry())
        .rule(fitness_gap(2))
        .build()
        .unwrap();

    engine.ingest([
        RecordBuilder::feed("a.com").niche("fitness").build(),
        RecordBuilder::feed("b.com").niche("fitness").build(),
    ]);

    let handle = engine.start();
    tokio::time::sleep(Duration::from_secs(10)).await;
    bounded(handle.shutdown()).await;

    assert!(collaborator.calls().is_empty());
    assert!(engine.trigger().events().is_empty());
    assert!(engine.trigger().rule_status("fitness-gap").unwrap().last_evaluated.is_some());
}

#[tokio::test(start_paused = true)]
async fn transient_discovery_failures_are_retried() {
    let collaborator = FakeCollaborator::new();
    collaborator.push(Err(DiscoveryFailure::retryable("search backend unavailable")));
    collaborator.push(Ok(vec![
        RecordBuilder::crawled("a.com").niche("fitness").build(),
        RecordBuilder::crawled("b.com").niche("fitness").build(),
    ]));
    let monitor = RecordingMonitor::new();
    let engine = Engine::builder(config(), collaborator.clone())
        .registry(registry())
        .monitor(monitor.clone())
        .rule(fitness_gap(2))
        .build()
        .unwrap();

    let handle = engine.start();
    let query = ProgramQuery::new().niche("fitness");
    wait_until(|| engine.query(&query).is_ok_and(|page| page.total == 2)).await;
    bounded(handle.shutdown()).await;

    assert_eq!(collaborator.calls().len(), 2);
    assert!(monitor.failed().is_empty());
    let task = &engine.dispatcher().tasks()[0];
    assert_eq!(task.attempts, 2);
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(engine.dispatch_stats().retries, 1);
}

#[tokio::test(start_paused = true)]
async fn permanent_discovery_failure_reaches_monitoring() {
    let collaborator = FakeCollaborator::new();
    collaborator.push(Err(DiscoveryFailure::non_retryable("niche not supported")));
    let monitor = RecordingMonitor::new();
    let engine = Engine::builder(config(), collaborator.clone())
        .registry(registry())
        .monitor(monitor.clone())
        .rule(fitness_gap(2))
        .build()
        .unwrap();

    let handle = engine.start();
    wait_until(|| !monitor.failed().is_empty()).await;
    bounded(handle.shutdown()).await;

    let failed = monitor.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, TaskStatus::Failed);
    assert_eq!(failed[0].last_error.as_deref(), Some("niche not supported"));
    // Cooldown still holds after a failed task.
    assert_eq!(dispositions(&engine).0, 1);
}

#[test]
fn commission_raise_is_an_update() {
    let engine = Engine::builder(config(), FakeCollaborator::new())
        .registry(registry())
        .build()
        .unwrap();
    let query = ProgramQuery::new().niche("outdoor");

    let first = engine.ingest([RecordBuilder::feed("trailco.com")
        .niche("outdoor")
        .commission("10%")
        .at(0)
        .build()]);
    assert_eq!(first.merge.outcome(), Some(MergeOutcome::Added));

    let before = engine.query(&query).unwrap();
    assert_eq!(before.items[0].commission(), Some(Commission::percentage(10.0)));

    let second = engine.ingest([RecordBuilder::crawled("trailco.com")
        .niche("outdoor")
        .commission("12%")
        .trust(2)
        .at(3600)
        .build()]);
    assert_eq!(second.merge.outcome(), Some(MergeOutcome::Updated));
    assert!(second.merge.conflicts.is_empty());

    let after = engine.query(&query).unwrap();
    assert_eq!(after.items[0].commission(), Some(Commission::percentage(12.0)));
    assert_eq!(after.items[0].version, 2);

    let generous = ProgramQuery::new().min_commission_percent(11.0);
    assert_eq!(engine.query(&generous).unwrap().total, 1);
}

#[test]
fn flat_commission_conflicts_with_percentage() {
    let engine = Engine::builder(config(), FakeCollaborator::new())
        .registry(registry())
        .build()
        .unwrap();

    engine.ingest([RecordBuilder::feed("trailco.com")
        .commission("10%")
        .trust(2)
        .at(0)
        .build()]);
    let report = engine.ingest([RecordBuilder::crawled("trailco.com").commission("$5").at(10).build()]);

    assert_eq!(report.merge.outcome(), Some(MergeOutcome::Conflicted));
    assert_eq!(report.merge.conflicts.len(), 1);
    assert_eq!(engine.index().conflicts().len(), 1);

    let program = engine.get(&"direct:trailco.com".into()).unwrap();
    assert_eq!(program.commission(), Some(Commission::percentage(10.0)));
}

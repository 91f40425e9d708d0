// Common test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use affiliate_engine::dispatch::{
    ActionDescriptor, ActionTask, DiscoveryCollaborator, DiscoveryFailure, MonitoringSink,
};
use affiliate_engine::mapping::{FieldMappingTable, MappingRegistry, Transform};
use affiliate_engine::{Field, RawRecord};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

pub const FEED: &str = "network-feed";
pub const CRAWLER: &str = "crawler";

/// Mappings for the two sources used across tests.
pub fn registry() -> MappingRegistry {
    let table = |source: &str| {
        FieldMappingTable::new(source, 1)
            .map("domain", Field::Domain, Transform::Domain)
            .map("network", Field::Network, Transform::Lowercase)
            .map("name", Field::Name, Transform::Text)
            .map("niche", Field::Niche, Transform::Lowercase)
            .map("commission", Field::Commission, Transform::Commission)
    };
    MappingRegistry::from_tables([table(FEED), table(CRAWLER)])
        .expect("test mappings are valid")
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Builder for raw records in the shared mapping shape.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: RawRecord,
}

impl RecordBuilder {
    pub fn new(source: &str, domain: &str) -> Self {
        Self {
            record: RawRecord::new(source, 1, at(0)).with_field("domain", domain),
        }
    }

    pub fn feed(domain: &str) -> Self {
        Self::new(FEED, domain)
    }

    pub fn crawled(domain: &str) -> Self {
        Self::new(CRAWLER, domain)
    }

    pub fn niche(mut self, niche: &str) -> Self {
        self.record = self.record.with_field("niche", niche);
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.record = self.record.with_field("name", name);
        self
    }

    pub fn commission(mut self, commission: &str) -> Self {
        self.record = self.record.with_field("commission", commission);
        self
    }

    pub fn trust(mut self, trust_rank: u32) -> Self {
        self.record.trust_rank = trust_rank;
        self
    }

    pub fn at(mut self, secs: i64) -> Self {
        self.record.ingested_at = at(secs);
        self
    }

    pub fn build(self) -> RawRecord {
        self.record
    }
}

/// Discovery collaborator that answers from a script and remembers what it
/// was asked. Once the script runs out every call returns no records.
#[derive(Default)]
pub struct FakeCollaborator {
    script: Mutex<VecDeque<Result<Vec<RawRecord>, DiscoveryFailure>>>,
    calls: Mutex<Vec<ActionDescriptor>>,
}

impl FakeCollaborator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn returning(records: Vec<RawRecord>) -> Arc<Self> {
        let fake = Self::new();
        fake.push(Ok(records));
        fake
    }

    pub fn push(&self, response: Result<Vec<RawRecord>, DiscoveryFailure>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<ActionDescriptor> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiscoveryCollaborator for FakeCollaborator {
    async fn submit(&self, action: &ActionDescriptor) -> Result<Vec<RawRecord>, DiscoveryFailure> {
        self.calls.lock().unwrap().push(action.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Default)]
pub struct RecordingMonitor {
    failed: Mutex<Vec<ActionTask>>,
}

impl RecordingMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failed(&self) -> Vec<ActionTask> {
        self.failed.lock().unwrap().clone()
    }
}

impl MonitoringSink for RecordingMonitor {
    fn task_failed(&self, task: &ActionTask) {
        self.failed.lock().unwrap().push(task.clone());
    }
}

/// Poll `condition` until it holds, giving background tasks time to run.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Run `future` to completion with a generous bound.
pub async fn bounded<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(30), future)
        .await
        .expect("future did not complete")
}

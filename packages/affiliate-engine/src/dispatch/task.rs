use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::MergeResult;

fn default_discovery_limit() -> usize {
    25
}

/// How the discovery collaborator should look for programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    #[default]
    SearchEngine,
    NetworkDirectory,
    CompetitorBacklinks,
}

impl DiscoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStrategy::SearchEngine => "search_engine",
            DiscoveryStrategy::NetworkDirectory => "network_directory",
            DiscoveryStrategy::CompetitorBacklinks => "competitor_backlinks",
        }
    }
}

/// A unit of discovery work. Closed set; the collaborator decides how each
/// variant is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionDescriptor {
    /// Find new programs in a niche.
    DiscoverNiche {
        niche: String,
        #[serde(default)]
        strategy: DiscoveryStrategy,
        #[serde(default = "default_discovery_limit")]
        limit: usize,
    },
    /// Re-fetch the terms of one known program.
    RefreshProgram {
        domain: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        network: Option<String>,
    },
    /// Walk an affiliate network's directory.
    ExploreNetwork {
        network: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        niche: Option<String>,
    },
}

impl ActionDescriptor {
    pub fn discover_niche(niche: impl Into<String>, strategy: DiscoveryStrategy) -> Self {
        ActionDescriptor::DiscoverNiche {
            niche: niche.into(),
            strategy,
            limit: default_discovery_limit(),
        }
    }

    /// Rate limiting key.
    pub fn strategy_class(&self) -> &'static str {
        match self {
            ActionDescriptor::DiscoverNiche { strategy, .. } => strategy.as_str(),
            ActionDescriptor::RefreshProgram { .. } => "refresh",
            ActionDescriptor::ExploreNetwork { .. } => DiscoveryStrategy::NetworkDirectory.as_str(),
        }
    }
}

impl fmt::Display for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionDescriptor::DiscoverNiche { niche, strategy, .. } => {
                write!(f, "discover '{niche}' via {}", strategy.as_str())
            }
            ActionDescriptor::RefreshProgram { domain, .. } => write!(f, "refresh {domain}"),
            ActionDescriptor::ExploreNetwork { network, .. } => write!(f, "explore {network}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum TaskOrigin {
    Rule(String),
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionTask {
    pub id: Uuid,
    pub descriptor: ActionDescriptor,
    pub origin: TaskOrigin,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Set once a timed-out attempt has been put back on the queue.
    pub requeued: bool,
    /// Merge summary of the records this task fed back into the index.
    pub merge: Option<MergeResult>,
    /// Discovered records that failed validation.
    pub rejected: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionTask {
    pub fn new(descriptor: ActionDescriptor, origin: TaskOrigin) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            descriptor,
            origin,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            requeued: false,
            merge: None,
            rejected: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

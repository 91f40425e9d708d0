//! Batch ingestion into the master index.
//!
//! The single path by which raw records reach canonical state, whether they
//! come from a feed adapter or from a discovery task. Malformed records are
//! rejected one at a time; the rest of the batch still lands.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ConflictError, IndexError};
use crate::index::MasterIndex;
use crate::types::{IdentityKey, MergeResult, RawRecord};

/// A record that did not make it into the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    /// Position in the submitted batch.
    pub index: usize,
    pub source: String,
    pub reason: RejectionReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RejectionReason {
    Invalid { error: String },
    /// Optimistic merge retries ran out on a hot key.
    Contended { key: IdentityKey, attempts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub merge: MergeResult,
    pub rejected: Vec<Rejection>,
}

impl BatchReport {
    pub fn accepted(&self) -> usize {
        self.merge.total()
    }
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    index: Arc<MasterIndex>,
}

impl Ingestor {
    pub fn new(index: Arc<MasterIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<MasterIndex> {
        &self.index
    }

    pub fn ingest_batch(&self, records: impl IntoIterator<Item = RawRecord>) -> BatchReport {
        let mut report = BatchReport::default();

        for (position, record) in records.into_iter().enumerate() {
            let source = record.source.clone();
            match self.index.upsert(record) {
                Ok(result) => report.merge.absorb(result),
                Err(IndexError::Conflict(ConflictError::ConcurrencyExhausted { key, attempts })) => {
                    warn!(source = %source, position, key = %key, attempts, "record lost merge race");
                    report.rejected.push(Rejection {
                        index: position,
                        source,
                        reason: RejectionReason::Contended { key, attempts },
                    });
                }
                Err(error) => {
                    warn!(source = %source, position, error = %error, "rejected malformed record");
                    report.rejected.push(Rejection {
                        index: position,
                        source,
                        reason: RejectionReason::Invalid {
                            error: error.to_string(),
                        },
                    });
                }
            }
        }

        info!(
            added = report.merge.added,
            updated = report.merge.updated,
            skipped = report.merge.skipped,
            conflicted = report.merge.conflicted,
            rejected = report.rejected.len(),
            "batch ingested"
        );
        report
    }
}

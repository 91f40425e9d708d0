//! Replays a JSON-lines file of raw records through the master index.
//!
//! Prints the merged outcome counts and the conflict log as JSON on stdout.
//! Logs go to stderr.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use affiliate_engine::audit::Sequenced;
use affiliate_engine::index::{IndexExport, IndexStats, MasterIndex};
use affiliate_engine::ingest::{Ingestor, Rejection};
use affiliate_engine::mapping::MappingRegistry;
use affiliate_engine::{ConflictDescriptor, EngineConfig, MergeResult, RawRecord};
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "replay")]
#[command(about = "Ingest raw affiliate records and report merge outcomes")]
struct Cli {
    /// JSON-lines file, one raw record per line
    #[arg(long)]
    records: PathBuf,

    /// JSON array of field mapping tables (defaults to ENGINE_MAPPINGS_PATH)
    #[arg(long)]
    mappings: Option<PathBuf>,

    /// Records per ingestion batch
    #[arg(long, default_value_t = 500)]
    batch_size: usize,

    /// Include the canonical programs and raw record log in the output
    #[arg(long)]
    export: bool,
}

#[derive(Serialize)]
struct Report {
    merge: MergeResult,
    rejected: Vec<Rejection>,
    conflicts: Vec<Sequenced<ConflictDescriptor>>,
    stats: IndexStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    export: Option<IndexExport>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,affiliate_engine=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    anyhow::ensure!(cli.batch_size > 0, "--batch-size must be greater than zero");

    let config = EngineConfig::from_env().context("Failed to load engine configuration")?;
    let mappings = cli
        .mappings
        .or_else(|| config.mappings_path.clone())
        .context("No mappings given (pass --mappings or set ENGINE_MAPPINGS_PATH)")?;
    let registry = MappingRegistry::load(&mappings)
        .with_context(|| format!("Failed to load mappings from {}", mappings.display()))?;

    let index = Arc::new(MasterIndex::new(Arc::new(registry), config.index.clone()));
    let ingestor = Ingestor::new(Arc::clone(&index));

    let file = File::open(&cli.records)
        .with_context(|| format!("Failed to open {}", cli.records.display()))?;

    let mut merge = MergeResult::default();
    let mut rejected = Vec::new();
    let mut batch = Vec::with_capacity(cli.batch_size);
    let mut offset = 0;

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: RawRecord = serde_json::from_str(&line)
            .with_context(|| format!("Line {} is not a raw record", line_no + 1))?;
        batch.push(record);

        if batch.len() == cli.batch_size {
            offset = flush(&ingestor, &mut batch, offset, &mut merge, &mut rejected);
        }
    }
    flush(&ingestor, &mut batch, offset, &mut merge, &mut rejected);

    tracing::info!(
        programs = index.len(),
        accepted = merge.total(),
        rejected = rejected.len(),
        "replay complete"
    );

    let report = Report {
        merge,
        rejected,
        conflicts: index.conflicts().entries(),
        stats: index.stats(),
        export: cli.export.then(|| index.export()),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

/// Ingest one batch, shifting rejection positions to file order.
fn flush(
    ingestor: &Ingestor,
    batch: &mut Vec<RawRecord>,
    offset: usize,
    merge: &mut MergeResult,
    rejected: &mut Vec<Rejection>,
) -> usize {
    if batch.is_empty() {
        return offset;
    }
    let size = batch.len();
    let report = ingestor.ingest_batch(batch.drain(..));

    merge.absorb(report.merge);
    rejected.extend(report.rejected.into_iter().map(|mut rejection| {
        rejection.index += offset;
        rejection
    }));
    offset + size
}

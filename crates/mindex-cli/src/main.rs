use std::path::PathBuf;

use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use mindex_reconcile::{reconcile, MatchConfig, Matcher};
use mindex_sync::{build_engine, maybe_build_scheduler, JobSlot, SyncConfig, SyncSummary};
use mindex_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "mindex-cli")]
#[command(about = "Mineral reference mirror and reconciliation engine")]
struct Cli {
    /// Optional YAML config overlaying the environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll every reference id in a range and mirror the outcome.
    SyncRange {
        start_id: i64,
        end_id: i64,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Re-validate the stalest mirrored records.
    ValidateSample {
        sample_size: usize,
        /// Only revisit records last synced more than this many days ago.
        #[arg(long)]
        older_than_days: Option<i64>,
    },
    /// Re-fetch records with a transitional classification code.
    RefreshIncomplete {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Reconcile an exported dataset (JSON array) against the mirror.
    Reconcile { dataset: PathBuf },
    /// Serve the job-trigger HTTP surface.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load(cli.config.as_deref())?;
    let (engine, mirror) = build_engine(&config)?;

    match cli.command {
        Commands::SyncRange {
            start_id,
            end_id,
            batch_size,
        } => {
            let summary = engine.sync_range(start_id, end_id, batch_size).await?;
            print_summary(&summary);
        }
        Commands::ValidateSample {
            sample_size,
            older_than_days,
        } => {
            let cutoff = older_than_days.map(|days| Utc::now() - Duration::days(days));
            let summary = engine.validate_sample(sample_size, cutoff).await?;
            print_summary(&summary);
        }
        Commands::RefreshIncomplete { limit } => {
            let summary = engine.refresh_incomplete(limit).await?;
            print_summary(&summary);
        }
        Commands::Reconcile { dataset } => {
            let load = mindex_adapters::load_dataset(&dataset)?;
            let matcher = Matcher::new(MatchConfig::default());
            let report = reconcile(load.records, mirror.as_ref(), &matcher);
            println!(
                "reconciled {} records: {} need review, {} with conflicts, {} unmatched ({} rows skipped)",
                report.total,
                report.needs_review,
                report.with_conflicts,
                report.unmatched,
                load.skipped.len()
            );
            for (strategy, count) in &report.by_strategy {
                println!("  {strategy}: {count}");
            }
        }
        Commands::Serve { port } => {
            let slot = JobSlot::new();
            let scheduler = maybe_build_scheduler(engine.clone(), slot.clone(), &config).await?;
            if let Some(mut sched) = scheduler {
                sched.start().await?;
            }
            let state = AppState::new(engine, mirror, Matcher::new(MatchConfig::default()), slot);
            mindex_web::serve(state, port).await?;
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!(
        "{} run {}: checked={} new={} updated={} unchanged={} deleted={} errors={} truncated={} cancelled={}",
        summary.operation,
        summary.run_id,
        summary.checked,
        summary.new,
        summary.updated,
        summary.unchanged,
        summary.deleted,
        summary.errors.len(),
        summary.errors_truncated,
        summary.cancelled
    );
    for err in &summary.errors {
        eprintln!("  id {}: {}", err.reference_id, err.message);
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use finsync_core::{clean_entity_id, EntityId};
use finsync_storage::Store;
use finsync_sync::{check_earnings_last_update, load_entity_list, SyncConfig, SyncPipeline};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "finsync")]
#[command(about = "Financial statement sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full pipeline: entity list, financials, prices, event calendar.
    Sync,
    /// Refresh financial statements for stale entities only.
    Financials {
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Refresh daily prices (all active entities when none are given).
    Prices { entities: Vec<String> },
    /// Re-derive next event dates for entities whose calendar is stale.
    Calendar,
    /// Upsert the entity list (defaults to `<workspace>/entities.yaml`).
    Entities {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    Migrate,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::connect(config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} stale={} refreshed={} failed={} rows={} reports={}",
                summary.run_id,
                summary.worklist_len,
                summary.batch.succeeded().len(),
                summary.batch.failures().count(),
                summary.batch.records_written(),
                summary.reports_dir
            );
            if summary.all_entities_failed() {
                bail!("every entity in run {} failed", summary.run_id);
            }
        }
        Commands::Financials { chunk_size } => {
            let chunk_size = chunk_size.unwrap_or(config.chunk_size);
            let pipeline = SyncPipeline::connect(config).await?;
            let worklist = pipeline.evaluate_staleness().await?;
            let summary = pipeline.run_batch(&worklist, chunk_size).await;
            for (stage, count) in summary.failure_counts() {
                println!("failed at {stage}: {count}");
            }
            println!(
                "financials: attempted={} refreshed={} chunks={} chunk_errors={} rows={}",
                summary.attempted(),
                summary.succeeded().len(),
                summary.chunks.len(),
                summary.chunk_errors(),
                summary.records_written()
            );
            if summary.attempted() > 0 && summary.succeeded().is_empty() {
                bail!("every entity failed");
            }
        }
        Commands::Prices { entities } => {
            let pipeline = SyncPipeline::connect(config).await?;
            let ids: Vec<EntityId> = if entities.is_empty() {
                pipeline
                    .store()
                    .load_active_entities()
                    .await?
                    .into_iter()
                    .map(|e| e.id)
                    .collect()
            } else {
                entities.iter().map(|e| clean_entity_id(e)).collect()
            };
            let summary = pipeline.refresh_prices(&ids).await?;
            println!(
                "prices: attempted={} refreshed={} failed={} rows={}",
                summary.attempted,
                summary.succeeded.len(),
                summary.failed.len(),
                summary.records_written
            );
        }
        Commands::Calendar => {
            let pipeline = SyncPipeline::connect(config).await?;
            let entities = pipeline.store().load_active_entities().await?;
            let worklist = check_earnings_last_update(&entities);
            let summary = pipeline.refresh_event_calendar(&worklist).await?;
            println!(
                "calendar: attempted={} updated={} no_event={} failed={}",
                summary.attempted,
                summary.updated.len(),
                summary.no_event.len(),
                summary.failed.len()
            );
        }
        Commands::Entities { file } => {
            let path = file.unwrap_or_else(|| config.workspace_root.join("entities.yaml"));
            let snapshot = load_entity_list(&path)?;
            let pipeline = SyncPipeline::connect(config).await?;
            let report = pipeline.ingest_entity_list(&snapshot).await?;
            println!(
                "entities: submitted={} inserted={} updated={}",
                report.submitted, report.inserted, report.updated
            );
        }
        Commands::Migrate => {
            let store = Store::connect(&config.database_url).await?;
            store.migrate().await?;
            store.close().await;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let Some(mut scheduler) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set FINSYNC_SCHEDULER_ENABLED=true");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

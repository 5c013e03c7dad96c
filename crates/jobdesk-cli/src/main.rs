use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobdesk_core::{Actor, Role};
use jobdesk_feeds::FeedRegistry;
use jobdesk_pipeline::{FeedScheduler, IngestPipeline, PipelineConfig, ReviewWorkflow};
use jobdesk_storage::{JobStore, LocalSnapshotStore, MemoryJobStore, PgJobStore, SnapshotStore};
use jobdesk_web::{AppState, WebConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobdesk")]
#[command(about = "Job posting ingestion and review desk")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API, plus the feed scheduler when enabled.
    Serve {
        /// Keep jobs in process memory instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    Migrate,
    /// Ingest a JSON file holding a feed bundle or a plain array of jobs.
    Ingest { file: PathBuf },
    /// Run every enabled feed once.
    Feeds,
    Repair,
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,jobdesk=debug,sqlx=warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { memory: false }) {
        Commands::Serve { memory } => {
            let store = if memory {
                warn!("using the in-memory store; jobs are lost on exit");
                Arc::new(MemoryJobStore::new()) as Arc<dyn JobStore>
            } else {
                connect(&config).await?
            };
            serve(&config, Arc::clone(&store)).await?;
            store.close().await;
        }
        Commands::Migrate => {
            let store = PgJobStore::connect(&config.store_config())
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            store.close().await;
            println!("migrations applied");
        }
        Commands::Ingest { file } => {
            let store = connect(&config).await?;
            let pipeline = pipeline(&config, Arc::clone(&store))?;
            let jobs = jobdesk_feeds::load_feed_document(&file).await?.into_jobs();
            let report = pipeline.ingest_all(jobs).await;
            store.close().await;
            println!(
                "ingest complete: file={} inserted={} duplicates={} errors={}",
                file.display(),
                report.inserted,
                report.duplicates,
                report.errors
            );
        }
        Commands::Feeds => {
            let store = connect(&config).await?;
            let scheduler = feed_scheduler(&config, pipeline(&config, Arc::clone(&store))?).await?;
            let summary = scheduler.run_once().await;
            store.close().await;
            println!(
                "feeds complete: run={} failed={} inserted={} duplicates={} errors={}",
                summary.feeds_run,
                summary.feeds_failed,
                summary.report.inserted,
                summary.report.duplicates,
                summary.report.errors
            );
        }
        Commands::Repair => {
            let store = connect(&config).await?;
            let report = ReviewWorkflow::new(Arc::clone(&store))
                .repair(&cli_actor())
                .await?;
            store.close().await;
            println!(
                "repair complete: requeued={} pruned={}",
                report.requeued, report.pruned
            );
        }
        Commands::Stats => {
            let store = connect(&config).await?;
            let stats = ReviewWorkflow::new(Arc::clone(&store))
                .stats(&cli_actor())
                .await?;
            store.close().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

fn cli_actor() -> Actor {
    Actor::new("cli", Role::Admin)
}

async fn connect(config: &PipelineConfig) -> Result<Arc<dyn JobStore>> {
    let store = PgJobStore::connect(&config.store_config())
        .await
        .context("connecting to postgres")?;
    Ok(Arc::new(store))
}

fn pipeline(config: &PipelineConfig, store: Arc<dyn JobStore>) -> Result<Arc<IngestPipeline>> {
    let normalizer = config.build_normalizer()?;
    Ok(Arc::new(
        IngestPipeline::new(store, normalizer).with_concurrency(config.normalize_concurrency),
    ))
}

async fn feed_scheduler(
    config: &PipelineConfig,
    pipeline: Arc<IngestPipeline>,
) -> Result<FeedScheduler> {
    let registry = FeedRegistry::load(&config.workspace_root).await?;
    let snapshots: Arc<dyn SnapshotStore> =
        Arc::new(LocalSnapshotStore::new(config.snapshots_dir.clone()));
    let feeds = registry.build_feeds(&config.workspace_root, Some(snapshots));
    Ok(FeedScheduler::new(pipeline, feeds, config.feed_cron.clone()))
}

async fn serve(config: &PipelineConfig, store: Arc<dyn JobStore>) -> Result<()> {
    let web = WebConfig::from_env();
    let pipeline = pipeline(config, store)?;

    let mut scheduler = None;
    if config.scheduler_enabled {
        let feeds = Arc::new(feed_scheduler(config, Arc::clone(&pipeline)).await?);
        info!(feeds = feeds.feed_count(), cron = %config.feed_cron, "starting feed scheduler");
        scheduler = Some(feeds.start().await?);
    }

    let authorizer = web.authorizer()?;
    if authorizer.is_empty() {
        warn!("JOBDESK_API_TOKENS is empty; admin routes will answer 401");
    }
    let state = AppState::new(pipeline, Arc::new(authorizer)).with_expose_errors(web.expose_errors);
    let served = jobdesk_web::serve(&web, state).await;

    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "feed scheduler did not shut down cleanly");
        }
    }
    served
}

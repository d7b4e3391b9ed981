//! CLI command definitions for reelcast.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::{BatchOrchestrator, HttpGenerationClient, PROCESS_VIDEO_TASK};
use crate::config::AppConfig;
use crate::metrics::{init_metrics, MetricsCollector};
use crate::publisher::{HttpPlatformClient, PlatformRegistry, Publisher};
use crate::queue::{DeadLetter, QueueStats, RedisTaskQueue, TaskQueue, WorkerPool};
use crate::scheduler::{JobStats, RedisJobStore, Scheduler};
use crate::storage::{
    AccountRepository, BatchRepository, MemoryStore, MigrationRunner, PgStore, PostRepository,
};

/// How often the worker refreshes the queue depth gauge.
const QUEUE_GAUGE_INTERVAL: Duration = Duration::from_secs(15);

/// Job scheduler, batch video generator and social publisher.
#[derive(Parser)]
#[command(name = "reelcast")]
#[command(about = "Schedule posts and generate video batches")]
#[command(version)]
#[command(
    long_about = "reelcast runs the job scheduler, the batch video worker pool and the social publisher.\n\nConfiguration is read from the environment (REDIS_URL, DATABASE_URL, GENERATION_API_BASE, ...).\n\nExample usage:\n  reelcast worker\n  reelcast stats --dead-letters 10"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler loop and the batch worker pool until interrupted.
    Worker(WorkerArgs),

    /// Print scheduler and batch queue statistics as JSON.
    Stats(StatsArgs),

    /// Apply the Postgres schema.
    Migrate(MigrateArgs),
}

#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Override the number of batch workers.
    #[arg(short = 'w', long, env = "BATCH_WORKERS")]
    pub workers: Option<usize>,

    /// Run the scheduler only, without consuming batch tasks.
    #[arg(long)]
    pub no_batch: bool,
}

#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Also list up to this many dead-lettered tasks.
    #[arg(long, default_value = "0")]
    pub dead_letters: usize,
}

#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// Postgres connection URL.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// List applied migrations instead of applying new ones.
    #[arg(long)]
    pub list: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
        Commands::Migrate(args) => run_migrate_command(args).await,
    }
}

/// Repositories behind the services, Postgres-backed when configured.
struct Stores {
    batches: Arc<dyn BatchRepository>,
    posts: Arc<dyn PostRepository>,
    accounts: Arc<dyn AccountRepository>,
}

async fn open_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    match config.database_url {
        Some(ref url) => {
            let store = Arc::new(PgStore::connect(url).await?);
            let applied = store.run_migrations().await?;
            info!(applied, "Postgres store ready");
            Ok(Stores {
                batches: store.clone(),
                posts: store.clone(),
                accounts: store,
            })
        }
        None => {
            warn!("DATABASE_URL not set, records are kept in memory");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                batches: store.clone(),
                posts: store.clone(),
                accounts: store,
            })
        }
    }
}

fn build_registry(config: &AppConfig) -> anyhow::Result<PlatformRegistry> {
    let mut registry = PlatformRegistry::new();
    let Some(ref api_base) = config.platform_api_base else {
        warn!("PLATFORM_API_BASE not set, no platform uploaders registered");
        return Ok(registry);
    };
    for platform in config.enabled_platforms() {
        let client = HttpPlatformClient::new(platform, api_base, config.platform_api_key.clone())?;
        registry.register(Arc::new(client));
    }
    info!(platforms = ?registry.platforms(), "Platform uploaders registered");
    Ok(registry)
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = AppConfig::from_env()?;
    if let Some(workers) = args.workers {
        config = config.with_batch_workers(workers);
        config.validate()?;
    }

    init_metrics().context("failed to register metrics")?;

    let job_store = RedisJobStore::connect(&config.redis_url, &config.key_prefix).await?;
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(job_store),
        config.scheduler_config(),
    ));
    let stores = open_stores(&config).await?;

    let publisher = Arc::new(Publisher::new(
        stores.posts,
        stores.accounts,
        build_registry(&config)?,
        scheduler.clone(),
    ));
    publisher.register();

    let cancel = CancellationToken::new();
    let scheduler_handle = tokio::spawn(scheduler.clone().process_jobs(cancel.clone()));

    let mut pool = if args.no_batch {
        None
    } else {
        let api_base = config
            .generation_api_base
            .clone()
            .context("GENERATION_API_BASE must be set to process batches (or pass --no-batch)")?;
        let stages = HttpGenerationClient::new(api_base, config.generation_api_key.clone())?;
        let queue: Arc<dyn TaskQueue> = Arc::new(
            RedisTaskQueue::connect(&config.redis_url, &config.batch_queue_name).await?,
        );
        let orchestrator = Arc::new(
            BatchOrchestrator::new(
                stores.batches,
                queue.clone(),
                Arc::new(stages),
                config.orchestrator_config(),
            )
            .with_clock(scheduler.clock()),
        );

        let mut pool = WorkerPool::new(config.worker_pool_config(), queue.clone());
        pool.register_handler(PROCESS_VIDEO_TASK, orchestrator);
        pool.start().await?;
        tokio::spawn(report_queue_depth(queue, cancel.clone()));
        Some(pool)
    };

    info!(
        redis_url = %config.redis_url,
        batch_workers = pool.as_ref().map(|p| p.num_workers()).unwrap_or(0),
        "Worker running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    cancel.cancel();
    if let Some(ref mut pool) = pool {
        pool.shutdown().await?;
        let stats = pool.stats();
        info!(
            completed = stats.tasks_completed,
            failed = stats.tasks_failed,
            "Worker pool stopped"
        );
    }
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Scheduler loop ended abnormally");
    }
    Ok(())
}

async fn report_queue_depth(queue: Arc<dyn TaskQueue>, cancel: CancellationToken) {
    let metrics = MetricsCollector::new();
    let mut interval = tokio::time::interval(QUEUE_GAUGE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match queue.stats().await {
                    Ok(stats) => metrics.set_queue_depth(&stats.queue_name, stats.pending_tasks),
                    Err(e) => warn!(error = %e, "Failed to read queue stats"),
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsReport {
    scheduler: JobStats,
    batch_queue: QueueStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dead_letters: Vec<DeadLetter>,
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let job_store = RedisJobStore::connect(&config.redis_url, &config.key_prefix).await?;
    let scheduler = Scheduler::new(Arc::new(job_store), config.scheduler_config());
    let queue = RedisTaskQueue::connect(&config.redis_url, &config.batch_queue_name).await?;

    let dead_letters = if args.dead_letters > 0 {
        queue.peek_dead_letter(args.dead_letters).await?
    } else {
        Vec::new()
    };
    let report = StatsReport {
        scheduler: scheduler.get_queue_stats().await?,
        batch_queue: queue.stats().await?,
        dead_letters,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_migrate_command(args: MigrateArgs) -> anyhow::Result<()> {
    let store = PgStore::connect(&args.database_url).await?;
    let runner = MigrationRunner::new(store.pool().clone());

    if args.list {
        for migration in runner.list_applied_migrations().await? {
            println!("{}  {}", migration.applied_at.to_rfc3339(), migration.name);
        }
        return Ok(());
    }

    let applied = runner.run_migrations().await?;
    println!("Applied {} migration(s)", applied);
    Ok(())
}

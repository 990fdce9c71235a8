//! Cognitive triangulation pipeline CLI (spec §6).
//!
//! `start` bootstraps [`app::AppContext`], runs file discovery, and launches
//! every queue worker plus the outbox publisher; `stop`/`status`/`clear`/
//! `test-connections` are short-lived commands against the same relational
//! store and ambient infrastructure a running `start` uses.

mod app;
mod discovery;
mod events;
mod handlers;
mod ids;
mod metrics;
mod oracle_findings;
mod queues;
mod registry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use outbox::{OutboxProcessor, QueueBrokerPublisher};
use redis_utils::DistributedLease;
use store::models::PipelineRunStatus;
use store::PipelineRunRepository;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use app::AppContext;
use pipeline_config::PipelineConfig;

const OUTBOX_LEADER_LEASE_KEY: &str = "outbox-publisher-leader";
const OUTBOX_LEADER_LEASE_TTL_MS: u64 = 30_000;

#[derive(Parser)]
#[command(name = "pipeline", about = "Cognitive triangulation code analysis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Walk `target_dir`, discover files, and run every worker until stopped.
    Start {
        target_dir: PathBuf,
    },
    /// Request a cooperative stop of a running pipeline.
    Stop {
        pipeline_id: String,
    },
    /// Print a running or finished pipeline's status.
    Status {
        pipeline_id: String,
    },
    /// Purge the relational store, graph store, and outbox.
    Clear,
    /// Verify connectivity to SQLite, Neo4j, Redis, and the oracle.
    TestConnections,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pipeline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    let config = match PipelineConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Command::Start { target_dir } => run_start(config, target_dir).await,
        Command::Stop { pipeline_id } => run_stop(config, &pipeline_id).await,
        Command::Status { pipeline_id } => run_status(config, &pipeline_id).await,
        Command::Clear => run_clear(config).await,
        Command::TestConnections => run_test_connections(config).await,
    }
}

async fn bootstrap(config: PipelineConfig) -> Result<AppContext, ExitCode> {
    AppContext::bootstrap(config).await.map_err(|e| {
        tracing::error!(error = %e, "failed to connect to ambient infrastructure");
        ExitCode::from(2)
    })
}

async fn run_start(config: PipelineConfig, target_dir: PathBuf) -> ExitCode {
    if !target_dir.is_dir() {
        tracing::error!(path = %target_dir.display(), "target directory does not exist");
        return ExitCode::from(1);
    }

    let ctx = match bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };

    let pipeline_id = uuid::Uuid::new_v4().to_string();
    if let Err(e) = ctx
        .store
        .pipeline_runs
        .start(&pipeline_id, &target_dir.to_string_lossy())
        .await
    {
        tracing::error!(error = %e, "failed to record pipeline run");
        return ExitCode::from(3);
    }

    let registry = registry::spawn();
    registry
        .register(pipeline_id.clone(), target_dir.to_string_lossy().to_string())
        .await;

    tracing::info!(pipeline_id = %pipeline_id, target = %target_dir.display(), "pipeline starting");

    spawn_outbox_processor(&ctx);
    spawn_workers(&ctx);

    let discovery_result = discovery::run(&ctx, &target_dir, &pipeline_id, &registry).await;

    let mut outcome = match discovery_result {
        Ok(discovered) => {
            tracing::info!(discovered, "discovery phase complete, waiting for workers to drain queues");
            PipelineRunStatus::Completed
        }
        Err(e) => {
            tracing::error!(error = %e, "discovery phase failed");
            PipelineRunStatus::Failed
        }
    };

    let mut last_error = if outcome == PipelineRunStatus::Failed {
        Some("file discovery failed, see logs".to_string())
    } else {
        None
    };

    if outcome != PipelineRunStatus::Failed {
        wait_for_drain(&ctx).await;

        match ctx.broker.queue_depth(queue_broker::FAILED_JOBS_QUEUE).await {
            Ok(0) => {}
            Ok(failed) => {
                tracing::warn!(failed, "pipeline drained with jobs in failed-jobs");
                outcome = PipelineRunStatus::CompletedWithFailures;
                last_error = Some(format!("{failed} job(s) dead-lettered, see failed-jobs"));
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to check failed-jobs queue depth");
            }
        }
    }

    if let Err(e) = ctx
        .store
        .pipeline_runs
        .finish(&pipeline_id, outcome, last_error.as_deref())
        .await
    {
        tracing::error!(error = %e, "failed to record pipeline completion");
        return ExitCode::from(3);
    }

    match outcome {
        PipelineRunStatus::Failed => ExitCode::from(3),
        _ => ExitCode::SUCCESS,
    }
}

/// Queues whose depth reaching zero (together with no pending outbox
/// events) signals that a run has actually finished fanning out work, not
/// just that discovery returned. `ANALYSIS_FINDINGS` is an audit sink with
/// no consumer and `FAILED_JOBS_QUEUE` is the dead-letter sink checked
/// separately, so neither belongs in the drain check or it would never
/// settle.
const DRAIN_WATCHED_QUEUES: &[&str] = &[
    queues::FILE_ANALYSIS,
    queues::DIRECTORY_AGGREGATION,
    queues::DIRECTORY_RESOLUTION,
    queues::RELATIONSHIP_RESOLUTION,
    queues::RELATIONSHIP_VALIDATED,
    queues::RECONCILIATION,
    queues::GRAPH_BUILDER,
];

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DRAIN_QUIET_ROUNDS: u32 = 3;

/// Polls every forward-flowing queue plus the outbox until they have all
/// reported empty for `DRAIN_QUIET_ROUNDS` consecutive polls in a row, or
/// until the operator hits ctrl-c. A run is only "done" once nothing is
/// left in flight, not merely once discovery stops enqueuing.
async fn wait_for_drain(ctx: &AppContext) {
    let mut quiet_rounds = 0u32;
    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::warn!("drain wait interrupted by operator, returning with queues possibly still in flight");
                return;
            }
            _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
        }

        let mut total_depth = 0u64;
        for queue in DRAIN_WATCHED_QUEUES {
            match ctx.broker.queue_depth(queue).await {
                Ok(depth) => total_depth += depth,
                Err(e) => {
                    tracing::warn!(queue, error = %e, "failed to check queue depth during drain wait");
                    total_depth += 1;
                }
            }
        }

        let pending_outbox = match ctx.outbox.pending_stats_impl().await {
            Ok((pending, _age)) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "failed to check outbox pending count during drain wait");
                1
            }
        };

        if total_depth == 0 && pending_outbox == 0 {
            quiet_rounds += 1;
            if quiet_rounds >= DRAIN_QUIET_ROUNDS {
                tracing::info!("all queues and the outbox drained");
                return;
            }
        } else {
            quiet_rounds = 0;
        }
    }
}

/// Spawns the single leader-elected outbox processor. Every `start`
/// invocation races for the `outbox-publisher-leader` lease; the loser keeps
/// its own workers running and simply never drains the outbox itself.
fn spawn_outbox_processor(ctx: &AppContext) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let manager = ctx.redis_manager();
        let lease = loop {
            match DistributedLease::acquire(&manager, OUTBOX_LEADER_LEASE_KEY, OUTBOX_LEADER_LEASE_TTL_MS).await {
                Ok(Some(lease)) => break lease,
                Ok(None) => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to acquire outbox leader lease, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        };
        tracing::info!("acquired outbox publisher leadership");

        let publisher = Arc::new(QueueBrokerPublisher::new(ctx.broker.clone()));
        let processor = OutboxProcessor::new(
            ctx.outbox.clone(),
            publisher,
            100,
            Duration::from_secs(2),
            ctx.config.max_job_attempts as i32,
        );

        let renew_lease = lease;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                if !renew_lease.renew(&manager, OUTBOX_LEADER_LEASE_TTL_MS).await.unwrap_or(false) {
                    tracing::error!("lost outbox publisher leadership, exiting renewal loop");
                    break;
                }
            }
        });

        if let Err(e) = processor.start().await {
            tracing::error!(error = ?e, "outbox processor exited");
        }
    });
}

/// Spawns every named queue's consumer loop at its configured concurrency.
/// C6 (relationship resolution) and C7 (validation) have no dedicated
/// concurrency knob in `WorkerConcurrency`; both ride on the `directory`
/// setting since they are similarly oracle-call-bound (C6) or cheap and
/// store-bound (C7, rounded up) workers.
fn spawn_workers(ctx: &AppContext) {
    let concurrency = ctx.config.worker_concurrency.clone();

    consume(ctx, queues::FILE_ANALYSIS, "file-analysis", concurrency.file_analysis, {
        let ctx = ctx.clone();
        Arc::new(handlers::FileAnalysisHandler { ctx })
    });
    consume(ctx, queues::DIRECTORY_AGGREGATION, "directory-aggregation", concurrency.directory, {
        let ctx = ctx.clone();
        Arc::new(handlers::DirectoryAggregationHandler { ctx })
    });
    consume(ctx, queues::DIRECTORY_RESOLUTION, "directory-resolution", concurrency.directory, {
        let ctx = ctx.clone();
        Arc::new(handlers::DirectoryResolutionHandler { ctx })
    });
    consume(ctx, queues::RELATIONSHIP_RESOLUTION, "relationship-resolution", concurrency.directory, {
        let ctx = ctx.clone();
        Arc::new(handlers::GlobalResolutionHandler { ctx })
    });
    consume(ctx, queues::RELATIONSHIP_VALIDATED, "validation", concurrency.directory, {
        let ctx = ctx.clone();
        Arc::new(handlers::ValidationHandler { ctx })
    });
    consume(ctx, queues::RECONCILIATION, "reconciliation", concurrency.reconciliation, {
        let ctx = ctx.clone();
        Arc::new(handlers::ReconciliationHandler { ctx })
    });
    consume(ctx, queues::GRAPH_BUILDER, "graph-builder", concurrency.graph_builder, {
        let ctx = ctx.clone();
        Arc::new(handlers::GraphBuilderHandler { ctx })
    });
}

fn consume<H: queue_broker::JobHandler + 'static>(
    ctx: &AppContext,
    queue: &'static str,
    consumer_id: &'static str,
    concurrency: u32,
    handler: Arc<H>,
) {
    let broker = ctx.broker.clone();
    tokio::spawn(async move {
        if let Err(e) = broker
            .consume(queue, consumer_id, handler, concurrency.max(1) as usize)
            .await
        {
            tracing::error!(queue, error = ?e, "queue consumer exited");
        }
    });
}

async fn run_stop(config: PipelineConfig, pipeline_id: &str) -> ExitCode {
    let ctx = match bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };

    match ctx
        .store
        .pipeline_runs
        .finish(pipeline_id, PipelineRunStatus::Failed, Some("stopped by operator"))
        .await
    {
        Ok(()) => {
            tracing::info!(pipeline_id, "pipeline run marked stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(pipeline_id, error = %e, "failed to stop pipeline run");
            ExitCode::from(3)
        }
    }
}

async fn run_status(config: PipelineConfig, pipeline_id: &str) -> ExitCode {
    let ctx = match bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };

    match ctx.store.pipeline_runs.get(pipeline_id).await {
        Ok(run) => {
            println!("{}", serde_json::to_string_pretty(&run).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(pipeline_id, error = %e, "pipeline run not found");
            ExitCode::from(3)
        }
    }
}

async fn run_clear(config: PipelineConfig) -> ExitCode {
    let ctx = match bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };

    if let Err(e) = ctx.graph.clear().await {
        tracing::error!(error = %e, "failed to clear graph store");
        return ExitCode::from(3);
    }

    let tables = ["relationship_evidence", "relationships", "pois", "directory_summaries", "files", "outbox", "pipeline_runs", "processed_events"];
    for table in tables {
        if let Err(e) = sqlx::query(&format!("DELETE FROM {table}")).execute(&ctx.pool).await {
            tracing::error!(table, error = %e, "failed to clear table");
            return ExitCode::from(3);
        }
    }

    tracing::info!("relational store and graph store cleared");
    ExitCode::SUCCESS
}

async fn run_test_connections(config: PipelineConfig) -> ExitCode {
    match bootstrap(config).await {
        Ok(ctx) => {
            if let Err(e) = ctx.graph.stats().await {
                tracing::error!(error = %e, "graph store connection check failed");
                return ExitCode::from(2);
            }
            tracing::info!("all connections healthy");
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}

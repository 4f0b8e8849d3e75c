//! playtrack-ingest - ingestion service and operator CLI
//!
//! `run` consumes newline-delimited JSON playback events (from a file or
//! stdin) through the full dedup pipeline. The other subcommands inspect
//! and act on the dead-letter store and the audit ledger.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use playtrack_common::config::{
    default_config_path, load_toml_config, RootFolderInitializer, RootFolderResolver, TomlConfig,
};
use playtrack_common::db::{init_database, init_wal_database};
use playtrack_common::models::{
    AuditStatus, DedupeLayer, DedupeReason, FailedEventStatus, FailureLayer, RawEvent,
    RestorePolicy,
};
use playtrack_ingest::audit::AuditFilter;
use playtrack_ingest::dead_letter::FailedEventFilter;
use playtrack_ingest::recovery::run_maintenance;
use playtrack_ingest::retry_scheduler::RetryScheduler;
use playtrack_ingest::{recover_on_startup, AdminService, Pipeline, WorkerPool};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Time allowed for queued deliveries to settle before shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "playtrack-ingest")]
#[command(about = "Exactly-once playback event ingestion")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "PLAYTRACK_CONFIG")]
    config: Option<PathBuf>,

    /// Folder holding playtrack.db and consumer_wal.db
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest NDJSON events through the pipeline
    Run {
        /// Input file; stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Keep running after the input ends, until interrupted
        #[arg(long)]
        follow: bool,
    },
    /// Replay unapplied WAL entries and exit
    Recover,
    /// Print store, WAL, dead-letter and audit counts
    Stats,
    /// Dead-letter store
    #[command(subcommand)]
    Failed(FailedCommand),
    /// Dedup audit ledger
    #[command(subcommand)]
    Audit(AuditCommand),
}

#[derive(ClapArgs, Debug)]
struct Resolution {
    /// Operator performing the action
    #[arg(long)]
    actor: String,

    #[arg(long)]
    notes: Option<String>,
}

#[derive(Subcommand, Debug)]
enum FailedCommand {
    List {
        #[arg(long)]
        status: Option<FailedEventStatus>,
        #[arg(long)]
        layer: Option<FailureLayer>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    /// Re-submit a failed event now
    Retry { id: Uuid },
    Abandon {
        id: Uuid,
        #[command(flatten)]
        resolution: Resolution,
    },
    Resolve {
        id: Uuid,
        #[command(flatten)]
        resolution: Resolution,
    },
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    List {
        #[arg(long)]
        user_id: Option<i64>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        status: Option<AuditStatus>,
        #[arg(long)]
        reason: Option<DedupeReason>,
        #[arg(long)]
        layer: Option<DedupeLayer>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    Get { id: Uuid },
    Stats,
    /// Mark a discard as correct
    Confirm {
        id: Uuid,
        #[command(flatten)]
        resolution: Resolution,
    },
    /// Reinstate a discarded event
    Restore {
        id: Uuid,
        /// disambiguated_key or allow_coexistence
        #[arg(long)]
        policy: RestorePolicy,
        #[command(flatten)]
        resolution: Resolution,
    },
    /// Delete reviewed entries past retention
    Cleanup {
        /// Overrides [audit] retention_days
        #[arg(long)]
        retention_days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(default_config_path);
    let config = match &config_path {
        Some(path) => load_toml_config(path)?,
        None => TomlConfig::default(),
    };
    config.validate()?;

    let level = config.logging.level.as_str();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("playtrack_ingest={level},playtrack_common={level}", level = level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let root_folder = RootFolderResolver::new()
        .with_cli_arg(args.root_folder.clone())
        .with_toml_value(config.root_folder.clone())
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", initializer.root().display());

    let events = init_database(&initializer.database_path())
        .await
        .context("Failed to open event database")?;
    let wal = init_wal_database(&initializer.wal_path())
        .await
        .context("Failed to open WAL database")?;
    let pipeline = Arc::new(Pipeline::new(&config, events, wal));
    let admin = AdminService::new(Arc::clone(&pipeline));

    match args.command {
        Command::Run { input, follow } => run(pipeline, &config, input, follow).await?,
        Command::Recover => print_json(&recover_on_startup(&pipeline).await?)?,
        Command::Stats => print_json(&admin.overview().await?)?,
        Command::Failed(command) => failed(&admin, command).await?,
        Command::Audit(command) => audit(&admin, &config, command).await?,
    }
    Ok(())
}

async fn run(pipeline: Arc<Pipeline>, config: &TomlConfig, input: Option<PathBuf>, follow: bool) -> Result<()> {
    info!("Starting playtrack-ingest v{}", env!("CARGO_PKG_VERSION"));

    // Replay before consuming so recovered transactions win over redeliveries
    recover_on_startup(&pipeline).await?;

    let workers = WorkerPool::spawn(Arc::clone(&pipeline));
    let shutdown = pipeline.shutdown_token();

    let maintenance = {
        let pipeline = Arc::clone(&pipeline);
        let cancel = shutdown.clone();
        let interval = Duration::from_secs(config.wal.retry_interval_secs.max(1));
        let retention = Duration::from_secs(config.wal.applied_retention_hours * 3600);
        tokio::spawn(async move { run_maintenance(&pipeline, interval, retention, cancel).await })
    };
    let scheduler = {
        let pipeline = Arc::clone(&pipeline);
        let cancel = shutdown.clone();
        let scheduler = RetryScheduler::new(
            Duration::from_secs(config.dead_letter.retry_interval_secs.max(1)),
            Duration::from_secs(config.dead_letter.retry_backoff_secs),
        );
        tokio::spawn(async move { scheduler.run(&pipeline, cancel).await })
    };

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let interrupted = tokio::select! {
        result = ingest_lines(&pipeline, reader) => {
            let (ingested, skipped) = result?;
            info!(ingested, skipped, "Input exhausted");
            false
        }
        _ = shutdown_signal() => true,
    };

    if follow && !interrupted {
        info!("Waiting for shutdown signal");
        shutdown_signal().await;
    }

    if !workers.wait_idle(DRAIN_TIMEOUT).await {
        warn!(
            queued = pipeline.broker().queued(),
            "Deliveries still queued at shutdown; WAL recovery will replay started ones"
        );
    }
    workers.shutdown().await;
    if let Err(e) = maintenance.await {
        warn!("Maintenance task ended abnormally: {}", e);
    }
    if let Err(e) = scheduler.await {
        warn!("Retry scheduler ended abnormally: {}", e);
    }

    print_json(&pipeline.stats())?;
    info!("Shutdown complete");
    Ok(())
}

/// Ingest one JSON event per line. Lines that are not valid JSON are skipped.
async fn ingest_lines(
    pipeline: &Pipeline,
    reader: Box<dyn AsyncRead + Unpin + Send>,
) -> Result<(u64, u64)> {
    let mut lines = BufReader::new(reader).lines();
    let mut ingested = 0u64;
    let mut skipped = 0u64;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawEvent>(line) {
            Ok(event) => {
                pipeline.ingest(event).await?;
                ingested += 1;
            }
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping unparseable input line");
                skipped += 1;
            }
        }
    }
    Ok((ingested, skipped))
}

async fn failed(admin: &AdminService, command: FailedCommand) -> Result<()> {
    match command {
        FailedCommand::List {
            status,
            layer,
            source,
            limit,
            offset,
        } => {
            let filter = FailedEventFilter {
                status,
                layer,
                source,
                limit,
                offset,
            };
            print_json(&admin.list_failed(&filter).await?)
        }
        FailedCommand::Retry { id } => {
            let outcome = admin.retry_failed(id).await?;
            // The delivery is processed in-process before exiting
            admin_drain(admin).await;
            info!("Retry outcome: {:?}", outcome);
            print_json(&admin.get_failed(id).await?)
        }
        FailedCommand::Abandon { id, resolution } => print_json(
            &admin
                .abandon_failed(id, &resolution.actor, resolution.notes.as_deref())
                .await?,
        ),
        FailedCommand::Resolve { id, resolution } => print_json(
            &admin
                .resolve_failed(id, &resolution.actor, resolution.notes.as_deref())
                .await?,
        ),
    }
}

async fn audit(admin: &AdminService, config: &TomlConfig, command: AuditCommand) -> Result<()> {
    match command {
        AuditCommand::List {
            user_id,
            source,
            status,
            reason,
            layer,
            limit,
            offset,
        } => {
            let filter = AuditFilter {
                user_id,
                source,
                status,
                reason,
                layer,
                limit,
                offset,
                ..Default::default()
            };
            print_json(&admin.list_audit(&filter).await?)
        }
        AuditCommand::Get { id } => print_json(&admin.get_audit(id).await?),
        AuditCommand::Stats => print_json(&admin.audit_stats().await?),
        AuditCommand::Confirm { id, resolution } => print_json(
            &admin
                .confirm(id, &resolution.actor, resolution.notes.as_deref())
                .await?,
        ),
        AuditCommand::Restore {
            id,
            policy,
            resolution,
        } => {
            let outcome = admin
                .restore(id, &resolution.actor, resolution.notes.as_deref(), policy)
                .await?;
            admin_drain(admin).await;
            info!(
                transaction_id = %outcome.transaction_id,
                correlation_key = %outcome.correlation_key,
                "Restored event re-injected"
            );
            print_json(&outcome.entry)
        }
        AuditCommand::Cleanup { retention_days } => {
            let days = retention_days.unwrap_or(config.audit.retention_days);
            let deleted = admin.cleanup_audit(days).await?;
            print_json(&serde_json::json!({ "deleted": deleted, "retention_days": days }))
        }
    }
}

/// One-shot commands run no workers, so re-injected deliveries are processed here
async fn admin_drain(admin: &AdminService) {
    let handled = admin.drain().await;
    info!(handled, "Processed re-injected deliveries");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

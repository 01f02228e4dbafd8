//! runledger CLI: serve the query service, drive delivery sweeps, and run
//! maintenance (integrity check, rebuild, backups) against the store pair.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use runledger_core::applog::AppendLog;
use runledger_core::config::{ENV_DATA_DIR, LedgerConfig};
use runledger_core::forwarder::SyncForwarder;
use runledger_core::logging::init_logging;
use runledger_core::server::{AppState, serve};
use runledger_core::telemetry::Counters;
use runledger_core::{RunRecorder, RunStore, backup, recovery};

#[derive(Parser)]
#[command(name = "runledger", version, about = "Durable dual-write event store for agent runs")]
struct Cli {
    /// Storage directory (overrides config and environment).
    #[arg(long, env = ENV_DATA_DIR, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP query service and the background forwarder.
    Serve {
        /// Bind address (overrides config).
        #[arg(long)]
        listen: Option<String>,
    },
    /// One delivery sweep to the collector, then exit.
    Sync,
    /// Integrity-check the indexed store.
    Check,
    /// Rebuild the indexed store from the append log.
    Rebuild,
    /// Snapshot management for the indexed store.
    Backup {
        #[command(subcommand)]
        action: Option<BackupAction>,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Take a new verified snapshot (the default).
    Create,
    /// List existing snapshots, newest first.
    List,
    /// Verify a snapshot file.
    Verify { path: PathBuf },
    /// Replace the live store with a snapshot.
    Restore { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = LedgerConfig::load().context("loading configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    init_logging(&config.log).context("initializing logging")?;
    config.ensure_dirs().context("creating data directories")?;

    match cli.command {
        Command::Serve { listen } => serve_command(config, listen).await,
        Command::Sync => sync_command(config).await,
        Command::Check => check_command(&config),
        Command::Rebuild => rebuild_command(&config),
        Command::Backup { action } => backup_command(&config, action),
    }
}

async fn serve_command(config: LedgerConfig, listen: Option<String>) -> anyhow::Result<()> {
    let addr = listen.unwrap_or_else(|| config.listen_addr.clone());

    // A corrupt index must not serve; rebuild it from the log first.
    {
        let log = AppendLog::open(
            config.append_log_path(),
            config.lock_path(),
            config.lock_timeout(),
        )?;
        if let Some(stats) = recovery::ensure_healthy(&log, &config.db_path())
            .context("verifying indexed store")?
        {
            info!(runs = stats.runs, "indexed store rebuilt from append log at startup");
        }
    }

    let recorder = Arc::new(RunRecorder::open(&config).context("opening store pair")?);
    let read_store = RunStore::open(config.db_path()).context("opening read store")?;
    let state = AppState::new(Arc::clone(&recorder), read_store);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let forwarder_task = match &config.collector_url {
        Some(url) => {
            let forwarder = SyncForwarder::open(
                &config.db_path(),
                url.clone(),
                config.sync.clone(),
                recorder.counters(),
            )
            .context("starting forwarder")?;
            info!(collector = %url, "forwarder enabled");
            Some(tokio::spawn(forwarder.run(shutdown_rx.clone())))
        }
        None => {
            info!("no collector configured; forwarding disabled");
            None
        }
    };

    let server = tokio::spawn({
        let rx = shutdown_rx.clone();
        async move { serve(state, &addr, rx).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    server.await?.context("query service")?;
    if let Some(task) = forwarder_task {
        task.await.context("forwarder task")?;
    }
    Ok(())
}

async fn sync_command(config: LedgerConfig) -> anyhow::Result<()> {
    let url = config
        .collector_url
        .as_ref()
        .context("no collector_url configured")?;
    let forwarder = SyncForwarder::open(
        &config.db_path(),
        url.clone(),
        config.sync.clone(),
        Arc::new(Counters::new()),
    )?;
    let stats = forwarder.sync_once().await?;
    println!(
        "scanned {} runs: {} delivered, {} failed",
        stats.scanned, stats.delivered, stats.failed
    );
    if stats.failed > 0 {
        anyhow::bail!("{} runs failed to deliver", stats.failed);
    }
    Ok(())
}

fn check_command(config: &LedgerConfig) -> anyhow::Result<()> {
    let store = RunStore::open(config.db_path())?;
    let report = recovery::check_integrity(&store)?;
    println!(
        "integrity: {} ({} runs, {} events)",
        if report.is_healthy() { "ok" } else { "FAILED" },
        report.run_count,
        report.event_count
    );
    for finding in &report.findings {
        println!("  finding: {finding}");
    }
    for table in &report.missing_tables {
        println!("  missing table: {table}");
    }
    if !report.is_healthy() {
        anyhow::bail!("integrity check failed; run `runledger rebuild`");
    }
    Ok(())
}

fn rebuild_command(config: &LedgerConfig) -> anyhow::Result<()> {
    let log = AppendLog::open(
        config.append_log_path(),
        config.lock_path(),
        config.lock_timeout(),
    )?;
    let stats = recovery::rebuild(&log, &config.db_path())?;
    println!(
        "rebuilt {} runs from {} log records ({} duplicates skipped)",
        stats.runs, stats.records_applied, stats.records_duplicate
    );
    Ok(())
}

fn backup_command(config: &LedgerConfig, action: Option<BackupAction>) -> anyhow::Result<()> {
    match action.unwrap_or(BackupAction::Create) {
        BackupAction::Create => {
            let path = backup::create(&config.db_path(), &config.backups_dir())?;
            println!("backup written to {}", path.display());
        }
        BackupAction::List => {
            let entries = backup::list(&config.backups_dir())?;
            if entries.is_empty() {
                println!("no backups");
            }
            for entry in entries {
                println!("{}", entry.display());
            }
        }
        BackupAction::Verify { path } => {
            backup::verify(&path)?;
            println!("backup ok: {}", path.display());
        }
        BackupAction::Restore { path } => {
            backup::restore(&path, &config.db_path())?;
            println!("restored {} from {}", config.db_path().display(), path.display());
        }
    }
    Ok(())
}

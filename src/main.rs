//! Pipeline entry point: one binary, one subcommand per service process.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use scrutin::aggregate::{reconcile, Aggregator};
use scrutin::bus::MessageBus;
use scrutin::config::AppConfig;
use scrutin::credential::MemoryCredentialStore;
use scrutin::domain::Fingerprint;
use scrutin::ingest::{serve, AppState};
use scrutin::store::{open_pool, AuditStore, TallyStore};
use scrutin::worker::spawn_pool;

#[derive(Parser)]
#[command(name = "scrutin", about = "Distributed vote-processing pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP ingestion front-end.
    Ingest,
    /// Run the validation worker pool.
    Worker,
    /// Run the aggregation service.
    Aggregate,
    /// Compare accepted audits against tallies and re-emit missing
    /// aggregation messages. Run at quiescence.
    Reconcile,
    /// Validate a credential generator output file without loading it.
    CheckCredentials {
        /// Path to the fingerprint file, one per line.
        #[arg(long)]
        file: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = AppConfig::load().context("configuration")?;

    match cli.command {
        Command::Ingest => run_ingest(config).await,
        Command::Worker => run_worker(config).await,
        Command::Aggregate => run_aggregate(config).await,
        Command::Reconcile => run_reconcile(config).await,
        Command::CheckCredentials { file } => check_credentials(&file),
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn open_infrastructure(config: &AppConfig) -> anyhow::Result<(MessageBus, AuditStore, TallyStore)> {
    if let Some(parent) = config.storage.bus_path.parent() {
        std::fs::create_dir_all(parent).context("creating bus data directory")?;
    }
    if let Some(parent) = config.storage.tally_path.parent() {
        std::fs::create_dir_all(parent).context("creating tally data directory")?;
    }
    let bus = MessageBus::open(&config.storage.bus_path, config.broker.bus_options())
        .context("opening bus")?;
    let pool = open_pool(&config.storage.tally_path).context("opening tally store")?;
    Ok((bus, AuditStore::new(pool.clone()), TallyStore::new(pool)))
}

async fn run_ingest(config: AppConfig) -> anyhow::Result<()> {
    let (bus, _, tally) = open_infrastructure(&config)?;
    let state = AppState::new(bus, tally, &config.http, &config.broker);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = state
        .windows()
        .clone()
        .spawn_refresher(config.http.window_cache_refresh, shutdown_rx.clone());

    let addr = format!("{}:{}", config.http.bind_addr, config.http.port)
        .parse()
        .context("bind address")?;
    let server = tokio::spawn(serve(addr, state, shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received");
    shutdown_tx.send(true).ok();

    server.await?.context("ingestion server")?;
    refresher.await.ok();
    Ok(())
}

async fn run_worker(config: AppConfig) -> anyhow::Result<()> {
    let (bus, audit, tally) = open_infrastructure(&config)?;

    let credentials = Arc::new(MemoryCredentialStore::new(
        config.credentials.duplicate_count_ttl,
    ));
    let Some(path) = &config.credentials.valid_credentials_path else {
        bail!("VALID_CREDENTIALS_PATH is required for the worker");
    };
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let loaded = credentials
        .load_valid(BufReader::new(file))
        .await
        .context("loading valid credential set")?;
    if loaded == 0 {
        warn!("valid credential set is empty; every submission will be invalid");
    }

    // Rebuild the cast set from the audit log so redelivered or re-run
    // state stays consistent across restarts.
    let accepted = audit.accepted_fingerprints().await.context("audit replay")?;
    credentials.restore_cast(accepted).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_pool(
        config.worker.count,
        bus,
        credentials,
        audit,
        tally,
        config.worker.clone(),
        shutdown_rx,
    );
    info!(count = config.worker.count, "worker pool started");

    let mut set: JoinSet<anyhow::Result<()>> = JoinSet::new();
    for handle in handles {
        set.spawn(async move { handle.await?.map_err(Into::into) });
    }

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        Some(result) = set.join_next() => {
            // A worker only returns early on a fatal inconsistency.
            match result {
                Ok(Err(e)) => {
                    error!(error = %e, "worker terminated");
                    fatal = Some(e);
                }
                Err(e) => {
                    error!(error = %e, "worker panicked");
                    fatal = Some(e.into());
                }
                Ok(Ok(())) => {}
            }
        }
    }

    shutdown_tx.send(true).ok();
    while let Some(result) = set.join_next().await {
        if let Ok(Err(e)) = result {
            error!(error = %e, "worker terminated");
            fatal.get_or_insert(e);
        }
    }

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_aggregate(config: AppConfig) -> anyhow::Result<()> {
    let (bus, _, tally) = open_infrastructure(&config)?;
    let aggregator = Aggregator::new(bus, tally, config.aggregator.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(aggregator.run(shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received");
    shutdown_tx.send(true).ok();
    handle.await?;
    Ok(())
}

async fn run_reconcile(config: AppConfig) -> anyhow::Result<()> {
    let (bus, audit, tally) = open_infrastructure(&config)?;
    let emitted = reconcile(&bus, &tally, &audit).await.context("reconcile")?;
    println!("re-emitted {emitted} aggregation messages");
    Ok(())
}

/// Check a generator output file against the fingerprint contract and
/// report counts without touching any store.
fn check_credentials(path: &std::path::Path) -> anyhow::Result<()> {
    use std::io::BufRead;

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut valid = 0u64;
    let mut invalid = 0u64;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match Fingerprint::parse(line) {
            Ok(_) => valid += 1,
            Err(_) => invalid += 1,
        }
    }
    println!("{valid} well-formed fingerprints, {invalid} malformed lines");
    if invalid > 0 {
        bail!("credential file contains malformed fingerprints");
    }
    Ok(())
}

//! corrald — the Corral scheduling daemon.
//!
//! Single binary that assembles the scheduling engine:
//! - State store (redb)
//! - Evaluation broker and blocked evaluation tracker
//! - Plan applier
//! - Scheduling workers
//! - Failed evaluation reaper
//!
//! # Usage
//!
//! ```text
//! corrald run --config /etc/corral/corral.toml --data-dir /var/lib/corral --workers 8
//! corrald simulate --cluster cluster.json
//! ```

mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use corral_core::CorralConfig;
use corral_core::config::LoggingConfig;
use corral_scheduler::Engine;

/// How often failed and superseded evaluations are settled.
const REAP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "corrald", about = "Corral scheduling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduling engine against a persistent state store.
    Run {
        /// Path to corral.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/corral")]
        data_dir: PathBuf,

        /// Number of scheduling workers (overrides the config).
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Schedule a cluster fixture in memory and print the outcomes as JSON.
    Simulate {
        /// JSON file with `nodes`, `jobs` and optional `allocs`.
        #[arg(long)]
        cluster: PathBuf,

        /// Path to corral.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            workers,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(workers) = workers {
                config.scheduler.workers = workers;
            }
            config.validate()?;
            init_tracing(&config.logging);
            run(config, data_dir).await
        }
        Command::Simulate { cluster, config } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config.logging);
            let fixture = simulate::ClusterFixture::from_file(&cluster)?;
            let report = simulate::simulate(config, fixture).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CorralConfig> {
    match path {
        Some(path) => CorralConfig::from_file(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(CorralConfig::default()),
    }
}

/// `RUST_LOG` wins over the configured filter. Logs go to stderr so that
/// `simulate` output stays parseable.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: CorralConfig, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("Corral daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("corral.redb");

    // ── Initialize engine ──────────────────────────────────────

    let engine = Arc::new(Engine::open(config, &db_path)?);
    info!(path = ?db_path, "state store opened");

    let restored = engine.restore()?;
    info!(restored, "broker and blocked evaluations restored");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let workers = engine.config().scheduler.workers;
    let mut handles = Vec::with_capacity(workers + 1);
    for id in 0..workers {
        let worker = engine.worker(id);
        handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }
    info!(workers, "scheduling workers started");

    let reaper = engine.clone();
    let reaper_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        reaper.run_reaper(REAP_INTERVAL, reaper_shutdown).await;
    }));

    // Graceful shutdown on Ctrl-C.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Wait for background tasks.
    for handle in handles {
        let _ = handle.await;
    }
    engine.reap()?;

    info!("Corral daemon stopped");
    Ok(())
}

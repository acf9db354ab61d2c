//! tabletd — the TabletGrid daemon.
//!
//! Single binary that assembles the scheduling stack:
//! - In-memory catalog and cluster, bootstrapped from a topology file
//! - Replica journal (redb), replayed on startup
//! - Tablet scheduler loop
//! - Health checker loop
//! - Simulated storage agent
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! tabletd run --config tabletgrid.toml --topology topology.toml --data-dir /var/lib/tabletgrid
//! tabletd check-config --config tabletgrid.toml
//! ```

mod agent;
mod checker;
mod topology;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;

use tabletgrid_core::{Clock, SystemClock, TabletGridConfig};
use tabletgrid_scheduler::{SchedEnv, TabletScheduler};
use tabletgrid_state::{JournalStore, MemoryCatalog, MemoryCluster, MemoryTxnManager};

use crate::agent::SimulatedAgent;
use crate::checker::HealthChecker;
use crate::topology::{Topology, replay_journal};

#[derive(Parser)]
#[command(name = "tabletd", about = "TabletGrid daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, health checker, simulated agent and API server.
    Run {
        /// Scheduler and API configuration.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Cluster topology to load into the catalog.
        #[arg(long)]
        topology: PathBuf,

        /// Port to listen on; overrides `api.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the replica journal.
        #[arg(long, default_value = "/var/lib/tabletgrid")]
        data_dir: PathBuf,

        /// Health check interval in milliseconds.
        #[arg(long, default_value = "5000")]
        check_interval_ms: u64,

        /// Simulated clone latency in milliseconds.
        #[arg(long, default_value = "500")]
        agent_delay_ms: u64,
    },
    /// Parse and validate a configuration file, then print it.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,

        /// Also validate a topology file.
        #[arg(long)]
        topology: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            topology,
            port,
            data_dir,
            check_interval_ms,
            agent_delay_ms,
        } => {
            let mut config = match config {
                Some(path) => TabletGridConfig::from_file(&path)?,
                None => TabletGridConfig::default(),
            };
            if let Some(port) = port {
                config.api.port = port;
            }
            run(
                config,
                &topology,
                data_dir,
                Duration::from_millis(check_interval_ms),
                Duration::from_millis(agent_delay_ms),
            )
            .await
        }
        Command::CheckConfig { config, topology } => check_config(&config, topology.as_deref()),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tabletd=debug,tabletgrid=debug".parse().unwrap());
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

fn check_config(path: &Path, topology: Option<&Path>) -> anyhow::Result<()> {
    let config = TabletGridConfig::from_file(path)?;
    if let Some(topology) = topology {
        let topology = Topology::from_file(topology)?;
        info!(
            backends = topology.backends.len(),
            tables = topology.tables.len(),
            "topology is valid"
        );
    }
    print!("{}", config.to_toml_string()?);
    Ok(())
}

async fn run(
    config: TabletGridConfig,
    topology_path: &Path,
    data_dir: PathBuf,
    check_interval: Duration,
    agent_delay: Duration,
) -> anyhow::Result<()> {
    info!("TabletGrid daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let journal_path = data_dir.join("journal.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let journal = JournalStore::open(&journal_path)?;
    info!(path = ?journal_path, "replica journal opened");

    let catalog = Arc::new(MemoryCatalog::new());
    let cluster = Arc::new(MemoryCluster::new(vec![]));
    let topology = Topology::from_file(topology_path)?;
    let summary = topology.load_into(&catalog, &cluster);
    info!(
        backends = summary.backends,
        tables = summary.tables,
        tablets = summary.tablets,
        replicas = summary.replicas,
        "topology loaded"
    );
    let replayed = replay_journal(&journal, &catalog)?;
    info!(replayed, "replica journal replayed");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (dispatcher, task_rx) = agent::channel();
    let env = SchedEnv::new(
        catalog.clone(),
        cluster.clone(),
        Arc::new(MemoryTxnManager::new(1)),
        Arc::new(journal),
        Arc::new(dispatcher),
    )
    .with_clock(clock.clone());
    let scheduler = Arc::new(TabletScheduler::with_load_score_rebalancer(env, config.scheduler.clone()));
    info!(rebalancer = scheduler.rebalancer_name(), "scheduler initialized");

    let checker = Arc::new(HealthChecker::new(
        catalog.clone(),
        cluster.clone(),
        scheduler.clone(),
        clock,
        check_interval,
    ));
    let agent = Arc::new(SimulatedAgent::new(catalog.clone(), scheduler.clone(), agent_delay));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let scheduler_handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx.clone()));
    let checker_handle = tokio::spawn(checker.run(shutdown_rx.clone()));
    let agent_handle = tokio::spawn(agent.run(task_rx, shutdown_rx));

    // ── Start API server ───────────────────────────────────────

    let router = tabletgrid_api::build_router(scheduler);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = scheduler_handle.await;
    let _ = checker_handle.await;
    let _ = agent_handle.await;

    info!("TabletGrid daemon stopped");
    Ok(())
}

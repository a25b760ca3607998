use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rewards_controller::backend::{DryRunBackend, RewardsBackend};
use rewards_controller::config::{ControllerConfig, CoordinationConfig};
use rewards_controller::controller::Controller;
use rewards_controller::coordination::{ConsulStore, CoordinationStore};
use rewards_controller::rounds::{MemoryRoundStore, RedbRoundStore, RoundStore};
use rewards_controller::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "rewards-controller")]
#[command(version)]
#[command(about = "Leader-elected staking rewards round controller")]
struct Args {
    /// Coordination store base address, e.g. "http://127.0.0.1:8500".
    /// Unset runs the controller in single-node mode.
    #[arg(long, env = "CONSUL_ADDR")]
    consul_addr: Option<String>,

    /// ACL token for the coordination store
    #[arg(long, env = "CONSUL_TOKEN", hide_env_values = true)]
    consul_token: Option<String>,

    /// Service name used for the leader lock key and session identity
    #[arg(long, env = "SERVICE_NAME", default_value = "rewards-controller")]
    service_name: String,

    /// Whether this process takes part in leader election on its host
    #[arg(long, env = "IS_LOCAL_LEADER")]
    local_leader: bool,

    /// Enable external side effects (batch submission, durable uploads)
    #[arg(long, env = "IS_LIVE")]
    live: bool,

    /// Wipe queues and round bookkeeping on bootstrap
    #[arg(long, env = "DO_CLEAN")]
    clean: bool,

    /// Minimum round interval in seconds (0 keeps the built-in default)
    #[arg(long, env = "ROUND_PERIOD_SECONDS", default_value = "0")]
    round_period_seconds: u64,

    /// Maximum scores per batch job
    #[arg(long, env = "SCORES_PER_BATCH", default_value = "420")]
    scores_per_batch: usize,

    /// Queue consumer count
    #[arg(long, env = "QUEUE_WORKERS", default_value = "4")]
    workers: usize,

    /// Round bookkeeping database path (unset keeps bookkeeping in memory)
    #[arg(long, env = "ROUNDS_DB_PATH")]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ControllerConfig {
        coordination: CoordinationConfig {
            addr: args.consul_addr.clone(),
            service_name: Some(args.service_name),
            token: args.consul_token,
        },
        local_leader: args.local_leader,
        is_live: args.live,
        do_clean: args.clean,
        scores_per_batch: args.scores_per_batch,
        workers: args.workers,
        db_path: args.db_path,
        ..Default::default()
    }
    .with_round_period(args.round_period_seconds);

    let store: Option<Arc<dyn CoordinationStore>> = match &config.coordination.addr {
        Some(addr) => Some(Arc::new(ConsulStore::new(
            addr,
            config.coordination.token.clone(),
        ))),
        None => None,
    };

    let rounds: Arc<dyn RoundStore> = match &config.db_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Opening round bookkeeping database");
            Arc::new(RedbRoundStore::open(path)?)
        }
        None => {
            tracing::warn!("No database path configured, round bookkeeping is in-memory");
            Arc::new(MemoryRoundStore::new())
        }
    };

    let backend: Arc<dyn RewardsBackend> = Arc::new(DryRunBackend::default());

    let controller = Controller::new(&config, store, rounds, backend)?;
    let cancel = install_shutdown_handler();

    tracing::info!(
        live = config.is_live,
        local_leader = config.local_leader,
        round_period_s = config.min_round_length.as_secs(),
        "Starting rewards controller"
    );
    controller.run(cancel).await?;
    tracing::info!("Rewards controller stopped");
    Ok(())
}

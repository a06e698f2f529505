use clap::Parser;
use log::info;
use server::slot::RestartPolicy;
use server::supervisor::{Supervisor, SupervisorConfig};
use server::worker::{self, WorkerEnv};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of worker processes (defaults to CPU cores minus one)
    #[arg(short = 'w', long, env = "CLUSTER_WORKERS")]
    workers: Option<usize>,

    /// Port every worker binds
    #[arg(short = 'p', long, default_value = "8080", env = "CLUSTER_PORT")]
    port: u16,

    /// Address workers bind on
    #[arg(short = 'H', long, default_value = "0.0.0.0", env = "CLUSTER_HOST")]
    host: String,

    /// Restarts allowed per slot inside the restart window
    #[arg(long, default_value = "5", env = "CLUSTER_MAX_RESTARTS")]
    max_restarts: u32,

    /// Restart window in seconds
    #[arg(long, default_value = "60", env = "CLUSTER_RESTART_WINDOW_SECS")]
    restart_window_secs: u64,

    /// Delay before a crashed worker is respawned, in milliseconds
    #[arg(long, default_value = "1000", env = "CLUSTER_RESTART_DELAY_MS")]
    restart_delay_ms: u64,

    /// How long to wait for a readiness signal before assuming a worker runs
    #[arg(long, default_value = "1000", env = "CLUSTER_READINESS_TIMEOUT_MS")]
    readiness_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL on shutdown
    #[arg(long, default_value = "5000", env = "CLUSTER_FORCE_KILL_TIMEOUT_MS")]
    force_kill_timeout_ms: u64,

    /// Pause between consecutive worker spawns at startup
    #[arg(long, default_value = "50", env = "CLUSTER_STAGGER_MS")]
    stagger_ms: u64,

    /// Connections accepted per worker
    #[arg(long, default_value_t = worker::DEFAULT_MAX_CLIENTS, env = "CLUSTER_MAX_CLIENTS")]
    max_clients: usize,
}

fn init_logging(worker_mode: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if worker_mode {
        // Stdout is forwarded line by line by the supervisor.
        builder.target(env_logger::Target::Stdout);
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if WorkerEnv::is_worker_mode() {
        init_logging(true);
        let env = WorkerEnv::from_env()?;
        worker::run(env, args.max_clients).await?;
        return Ok(());
    }

    init_logging(false);

    let program = std::env::current_exe()?;
    let mut config = SupervisorConfig::new(program, args.port);
    config.args = vec!["--max-clients".to_string(), args.max_clients.to_string()];
    config.worker_count = args.workers;
    config.host = args.host;
    config.policy = RestartPolicy {
        max_restarts: args.max_restarts,
        restart_window: Duration::from_secs(args.restart_window_secs),
    };
    config.restart_delay = Duration::from_millis(args.restart_delay_ms);
    config.readiness_timeout = Duration::from_millis(args.readiness_timeout_ms);
    config.force_kill_timeout = Duration::from_millis(args.force_kill_timeout_ms);
    config.stagger = Duration::from_millis(args.stagger_ms);

    let mut supervisor = Supervisor::new(config);
    supervisor.start().await?;
    supervisor.run().await?;

    let stats = supervisor.stats();
    info!(
        "Supervisor exiting: {} slots stopped, {} restarts in total",
        stats.stopped, stats.total_restarts
    );

    Ok(())
}

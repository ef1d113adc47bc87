use std::{net::SocketAddr, sync::Arc};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use redis_metrics::{
    client::TcpConnector,
    config::{FileSource, Source},
    controller::{self, Controller},
    registry::Exposition,
    reload,
    server::{self, Server},
};
use redis_metrics_signal::RegisterError;
use tokio::{
    runtime::Builder,
    signal,
    task::JoinSet,
    time::{self, Duration},
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Controller returned an error: {0}")]
    Controller(#[from] controller::Error),
    #[error("HTTP server returned an error: {0}")]
    Server(#[from] server::Error),
    #[error("Failed to install telemetry recorder: {0}")]
    Recorder(#[from] metrics_exporter_prometheus::BuildError),
    #[error(transparent)]
    Signal(#[from] RegisterError),
    #[error("Could not join a spawned task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

const DEFAULT_CONFIG_PATH: &str = "/etc/redis-metrics.yaml";
const DEFAULT_COLLECTOR_INTERVAL: u64 = 60;

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    args: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file and exit
    ConfigCheck,
}

#[derive(Args)]
struct RunArgs {
    /// log at debug level unless RUST_LOG says otherwise
    #[clap(long, env = "DEBUG")]
    debug: bool,
    #[clap(long, env = "DEBUG_MODE", hide = true)]
    debug_mode: bool,
    /// address to serve metrics on, a bare :port listens on every interface
    #[clap(short, long, env = "SERVER_ADDR", default_value = "0.0.0.0:8000")]
    server_addr: String,
    /// path on disk to the configuration file [default: /etc/redis-metrics.yaml]
    #[clap(short, long, visible_alias = "config", env = "CONFIG_FILE")]
    config_path: Option<String>,
    #[clap(long = "config-env", env = "CONFIG", hide = true)]
    config_env: Option<String>,
    /// seconds between scrapes of each node, clamped to 20..=600 [default: 60]
    #[clap(short = 'i', long, env = "COLLECTOR_INTERVAL")]
    collector_interval: Option<u64>,
    #[clap(long, env = "COLLECTOR_INTERVAL_SECONDS", hide = true)]
    collector_interval_seconds: Option<u64>,
    /// maximum number of concurrent HTTP connections
    #[clap(long, default_value_t = 100)]
    max_connections: usize,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

impl RunArgs {
    // The hidden arguments carry older environment names. The primary flag or
    // variable wins when both are given.

    fn debug(&self) -> bool {
        self.debug || self.debug_mode
    }

    fn config_path(&self) -> &str {
        self.config_path
            .as_deref()
            .or(self.config_env.as_deref())
            .unwrap_or(DEFAULT_CONFIG_PATH)
    }

    fn collector_interval(&self) -> u64 {
        self.collector_interval
            .or(self.collector_interval_seconds)
            .unwrap_or(DEFAULT_COLLECTOR_INTERVAL)
    }
}

async fn inner_main(args: RunArgs, addr: SocketAddr) -> Result<(), Error> {
    let telemetry = PrometheusBuilder::new().install_recorder()?;
    let exposition = Arc::new(Exposition::new());
    let (trigger, reloads) = reload::channel();
    let (shutdown_watcher, shutdown_broadcast) = redis_metrics_signal::signal();

    let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();

    let controller = Controller::new(
        FileSource::new(args.config_path()),
        TcpConnector,
        controller::clamp_interval(args.collector_interval()),
        Arc::clone(&exposition),
    );
    let controller_watcher = shutdown_watcher.register()?;
    tasks.spawn(async move {
        controller
            .run(reloads, controller_watcher)
            .await
            .map_err(Error::from)
    });

    let server = Server::new(
        args.max_connections,
        exposition,
        trigger,
        Some(telemetry.clone()),
        shutdown_watcher.register()?,
    );
    tasks.spawn(async move { server.run(addr).await.map_err(Error::from) });

    // Every task holds its own watcher now. Keeping this one would hold up
    // `signal_and_wait` below forever.
    drop(shutdown_watcher);

    let mut upkeep = time::interval(Duration::from_secs(5));
    let res = loop {
        tokio::select! {
            _ = upkeep.tick() => {
                telemetry.run_upkeep();
            },
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break Ok(());
            },
            Some(res) = tasks.join_next() => {
                match res {
                    Ok(Ok(())) => {
                        info!("Task exited before shutdown was requested");
                        break Ok(());
                    }
                    Ok(Err(err)) => {
                        error!("Shutting down: {err}");
                        break Err(err);
                    }
                    Err(err) => break Err(Error::Join(err)),
                }
            },
        }
    };

    shutdown_broadcast.signal_and_wait().await;
    let mut res = res;
    while let Some(next) = tasks.join_next().await {
        let next = next.map_err(Error::from).and_then(|r| r);
        if let Err(err) = next {
            error!("Task failed during shutdown: {err}");
            if res.is_ok() {
                res = Err(err);
            }
        }
    }
    res
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    let level = if cli.args.debug() { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_ansi(false)
        .finish()
        .init();

    if let Some(Commands::ConfigCheck) = cli.command {
        match FileSource::new(cli.args.config_path()).load() {
            Ok(config) => {
                info!(nodes = config.len(), "Configuration file is valid");
                std::process::exit(0)
            }
            Err(err) => {
                error!("Configuration validation failed: {err}");
                std::process::exit(1)
            }
        }
    }

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting redis-metrics {version}.");

    let addr = server::parse_addr(&cli.args.server_addr)?;
    let max_shutdown_delay = Duration::from_secs(cli.args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(cli.args, addr));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}

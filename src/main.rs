//! proxylog - byte-counting TCP relay with live throughput telemetry

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use proxylog::{
    config::{CliOverrides, Config, ConfigManager, DestinationMode},
    connection::Observers,
    counter::{ByteObserver, Direction, Tee},
    protocol::UserIdMode,
    telemetry::{
        open_log_file, EmitPolicy, LogSink, RelayMetrics, Sampler, TelemetryServer,
        TelemetryState,
    },
    ByteCounter, ConnectionManager, ShutdownCoordinator,
};

/// CLI arguments for proxylog
#[derive(Parser, Debug)]
#[command(name = "proxylog")]
#[command(about = "TCP relay that logs and streams the bytes it forwards")]
#[command(version)]
#[command(long_about = "
proxylog - byte-counting TCP relay

Accepts TCP connections, resolves each one's destination with a SOCKS4
CONNECT handshake (or uses --to), relays both directions and publishes
the number of bytes relayed each second at GET /data on the telemetry port.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  PROXYLOG_BIND_ADDR        - Relay listen address (e.g., 0.0.0.0:4567)
  PROXYLOG_TELEMETRY_ADDR   - Telemetry listen address (e.g., 0.0.0.0:9050)
  PROXYLOG_DESTINATION      - Fixed destination, disables SOCKS4 (host:port)
  PROXYLOG_BUFFER_SIZE      - Copy buffer size in bytes
  PROXYLOG_CONNECT_TIMEOUT  - Dial timeout (e.g., 10s)
  PROXYLOG_LOG_FILE         - Append per-second byte counts to this file
  PROXYLOG_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "proxylog.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Relay bind address (overrides config file)
    #[arg(short, long, help = "Relay bind address (e.g., 0.0.0.0:4567)")]
    pub bind: Option<String>,

    /// Telemetry bind address (overrides config file)
    #[arg(long, help = "Telemetry bind address (e.g., 0.0.0.0:9050)")]
    pub telemetry_bind: Option<String>,

    /// Relay every connection to this address instead of reading SOCKS4
    #[arg(long, value_name = "HOST:PORT", help = "Fixed destination, skips the SOCKS4 handshake")]
    pub to: Option<String>,

    /// How the SOCKS4 user id is read
    #[arg(long, value_name = "fixed|null_terminated", help = "SOCKS4 user id convention")]
    pub user_id_mode: Option<UserIdMode>,

    /// Which telemetry ticks are pushed
    #[arg(long, value_name = "non_zero|always", help = "Telemetry emit policy")]
    pub emit: Option<EmitPolicy>,

    /// Append per-second byte counts to this file
    #[arg(long = "log-file", value_name = "PATH", help = "Persist byte counts to a file")]
    pub log_file: Option<PathBuf>,

    /// Log file given positionally
    #[arg(value_name = "LOG_FILE", conflicts_with = "log_file")]
    pub log_file_positional: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Buffer size in bytes
    #[arg(long, help = "Copy buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            bind: self.bind.clone(),
            telemetry_bind: self.telemetry_bind.clone(),
            to: self.to.clone(),
            user_id_mode: self.user_id_mode,
            emit: self.emit,
            log_file: self
                .log_file
                .clone()
                .or_else(|| self.log_file_positional.clone()),
            log_level: self.log_level.clone(),
            buffer_size: self.buffer_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Initialize tracing before loading config so its messages are kept
    let log_filter = init_tracing(&args)?;

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    // Apply CLI argument overrides (highest priority)
    config.merge_with_cli_args(&args.overrides())?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    apply_config_level(&args, &config, &log_filter)?;

    run(args, config).await
}

async fn run(args: CliArgs, config: Config) -> Result<()> {
    info!("Starting proxylog v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }

    log_summary(&config);

    let shutdown = ShutdownCoordinator::new();
    let token = shutdown.token();

    // Signal handling lives outside the task group: it never finishes on its own.
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                error!("Error setting up signal handlers: {:#}", e);
            }
        }
    });

    let counter = Arc::new(ByteCounter::new());
    let metrics = Arc::new(RelayMetrics::new()?);
    let observers = Observers::new(
        global_observer(&counter, &metrics, Direction::Up),
        global_observer(&counter, &metrics, Direction::Down),
    );

    let sampler = Sampler::new(Arc::clone(&counter), config.telemetry.interval);
    let feed = sampler.feed();

    // All fatal setup happens before any task starts.
    let log_sink = match &config.telemetry.log_file {
        Some(path) => {
            let file = open_log_file(path).await?;
            info!("Appending byte counts to {}", path.display());
            Some((LogSink::new(file), sampler.subscribe()))
        }
        None => None,
    };

    let telemetry_server = if config.telemetry.enabled {
        let state = TelemetryState {
            feed,
            emit: config.telemetry.emit,
            metrics: Arc::clone(&metrics),
            shutdown: token.clone(),
        };
        Some(TelemetryServer::bind(config.telemetry.bind_addr, state).await?)
    } else {
        info!("Telemetry server disabled");
        None
    };

    let connection_manager =
        ConnectionManager::bind(&config, observers, Arc::clone(&metrics), token.clone()).await?;

    let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

    tasks.spawn({
        let token = token.clone();
        async move {
            sampler.run(token).await;
            ("sampler", Ok(()))
        }
    });

    if let Some((sink, snapshots)) = log_sink {
        let token = token.clone();
        tasks.spawn(async move { ("log sink", sink.run(snapshots, token).await.map(drop)) });
    }

    if let Some(server) = telemetry_server {
        tasks.spawn(async move { ("telemetry server", server.run().await) });
    }

    tasks.spawn(async move { ("relay listener", connection_manager.run().await) });

    info!("proxylog started, press Ctrl+C or send SIGTERM/SIGINT to shut down");

    let result = supervise(&mut tasks, &token).await;

    info!("Shutdown complete");
    result
}

/// Wait for every task; the first genuine failure cancels the rest and
/// becomes the process result.
async fn supervise(
    tasks: &mut JoinSet<(&'static str, Result<()>)>,
    token: &CancellationToken,
) -> Result<()> {
    let mut first_error = None;

    while let Some(joined) = tasks.join_next().await {
        let (name, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => ("task", Err(anyhow::Error::new(e).context("task panicked"))),
        };

        match result {
            Ok(()) => debug!("{} finished", name),
            Err(e) if token.is_cancelled() => {
                debug!("{} failed during shutdown: {:#}", name, e);
            }
            Err(e) => {
                info!("{} failed, shutting down", name);
                first_error = Some(e.context(format!("{} failed", name)));
                token.cancel();
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}

fn global_observer(
    counter: &Arc<ByteCounter>,
    metrics: &RelayMetrics,
    direction: Direction,
) -> Arc<dyn ByteObserver> {
    Arc::new(Tee::new(vec![
        Arc::clone(counter) as Arc<dyn ByteObserver>,
        metrics.observer(direction),
    ]))
}

fn log_summary(config: &Config) {
    info!("Relay address: {}", config.server.bind_addr);
    match &config.destination {
        DestinationMode::Static { addr } => info!("Destination: {} (static)", addr),
        DestinationMode::Socks4 { user_id } => {
            info!("Destination: SOCKS4 CONNECT (user id: {})", user_id)
        }
    }
    if config.telemetry.enabled {
        info!(
            "Telemetry: http://{} (interval: {:?}, emit: {})",
            config.telemetry.bind_addr, config.telemetry.interval, config.telemetry.emit
        );
    }
    if let Some(path) = &config.telemetry.log_file {
        info!("Telemetry log file: {}", path.display());
    }
    info!("Buffer size: {} bytes", config.server.buffer_size);
}

type LogFilter = reload::Handle<EnvFilter, Registry>;

/// Initialize tracing/logging from the command line.
///
/// The filter is reloadable so the configured level can take over once the
/// config file has been read.
fn init_tracing(args: &CliArgs) -> Result<LogFilter> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or("info")
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let (filter, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .init();

    Ok(handle)
}

/// Switch to the configured level unless `RUST_LOG`, `--log-level` or
/// `--verbose` already chose one
fn apply_config_level(args: &CliArgs, config: &Config, handle: &LogFilter) -> Result<()> {
    let level_chosen = args.verbose
        || args.log_level.is_some()
        || std::env::var_os(EnvFilter::DEFAULT_ENV).is_some();
    if level_chosen {
        return Ok(());
    }

    handle
        .reload(EnvFilter::new(&config.logging.level))
        .context("apply configured log level")
}

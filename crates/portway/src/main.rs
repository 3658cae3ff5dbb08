use anyhow::Context;
use clap::{Parser, ValueEnum};
use portway::admin_api::AdminApiServer;
use portway::config::{Config, SeedRule};
use portway::forward::{RuleStore, StatsCollector, Supervisor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "portway", version, about = "TCP/UDP port forwarding daemon")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "PORTWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Admin API bind host (overrides the configuration file)
    #[arg(long, env = "PORTWAY_HOST")]
    host: Option<String>,

    /// Admin API port (overrides the configuration file)
    #[arg(short, long, env = "PORTWAY_PORT")]
    port: Option<u16>,

    /// Log level, RUST_LOG takes precedence
    #[arg(long, env = "PORTWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "PORTWAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_logging(level: &str, format: LogFormat) -> Result<(), anyhow::Error> {
    // Build filter with level and allow RUST_LOG override
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("portway={level},hyper=warn"))
            .with_context(|| format!("Invalid log level '{level}'"))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

fn load_config(args: &Args) -> Result<Config, anyhow::Error> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(host) = &args.host {
        config.admin.host = host.clone();
    }
    if let Some(port) = args.port {
        config.admin.port = port;
    }
    config.validate()?;
    Ok(config)
}

/// Create the configured seed rules, starting those marked `autostart`.
/// Failures are logged and do not abort startup.
async fn seed_rules(supervisor: &Supervisor, seeds: &[SeedRule]) {
    for seed in seeds {
        let rule = match supervisor.create(seed.config()) {
            Ok(rule) => rule,
            Err(e) => {
                warn!("Skipping seed rule '{}': {}", seed.name, e);
                continue;
            }
        };
        if seed.autostart {
            if let Err(e) = supervisor.start(rule.id).await {
                warn!(rule_id = rule.id, "Failed to autostart '{}': {}", seed.name, e);
            }
        }
    }
}

async fn run(config: Config) -> Result<(), anyhow::Error> {
    let supervisor = Supervisor::new(
        Arc::new(RuleStore::new()),
        Arc::new(StatsCollector::new()),
        config.engine.settings(),
    );

    seed_rules(&supervisor, &config.rules).await;

    let server = AdminApiServer::bind(config.admin.socket_addr()?, Arc::clone(&supervisor)).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Admin API stopped: {}", e);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        }
    }

    supervisor.shutdown().await;
    info!("Portway stopped");
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_format)?;

    let config = load_config(&args)?;
    info!(
        "Starting portway v{} with {} seed rule(s)",
        env!("CARGO_PKG_VERSION"),
        config.rules.len()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.admin.worker_threads())
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

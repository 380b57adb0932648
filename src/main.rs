//! Warren consumer - process entry point

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, Level};
use warren::config::{Config, ConfigError};
use warren::dispatch::{HandlerFault, HandlerOutcome, MessageHandler};
use warren::observability::logging::{parse_level, LogFormat};
use warren::observability::{
    init_default_logging, init_logging, spawn_status_reporter, HealthServer,
};
use warren::transport::amqp::AmqpConnector;
use warren::transport::MessageProperties;
use warren::{Supervisor, TlsContext, WarrenError, WarrenResult};

/// Self-healing TLS consumer for durable AMQP queues
#[derive(Parser)]
#[command(name = "warren")]
#[command(about = "Self-healing TLS consumer for durable AMQP queues")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "WARREN_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume until SIGINT or SIGTERM
    Run {
        /// Queue to consume, overriding `queue.name`
        #[arg(short, long)]
        queue: Option<String>,
    },
    /// Validate configuration and TLS material
    Config {
        /// Print the merged configuration with the password redacted
        #[arg(long)]
        show: bool,
    },
}

/// Default handler: acknowledge every decodable payload
struct AckAll;

#[async_trait]
impl MessageHandler for AckAll {
    async fn handle(
        &self,
        payload: &Value,
        properties: &MessageProperties,
    ) -> Result<HandlerOutcome, HandlerFault> {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("untyped");
        info!(
            message_type = kind,
            routing_key = %properties.routing_key,
            "Acknowledging message"
        );
        Ok(HandlerOutcome::Accept)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format(), false),
        _ => init_logging(Level::TRACE, log_format(), true),
    };

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            process::exit(WarrenError::from(e).exit_code());
        }
    };

    let result = match cli.command {
        Commands::Run { queue } => run_consumer(config, queue).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(fatal = e.is_fatal(), "Command failed: {e}");
        process::exit(e.exit_code());
    }
}

fn log_format() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
}

fn load_configuration(path: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Config::load_from_file(path);
    }

    for candidate in ["warren.toml", "config/warren.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Config::load_from_file(path);
        }
    }

    Err(ConfigError::FileRead(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no configuration file found; pass -c/--config or create warren.toml",
    )))
}

async fn run_consumer(config: Config, queue: Option<String>) -> WarrenResult<()> {
    let queue = queue
        .or_else(|| config.queue.name.clone())
        .ok_or(ConfigError::MissingField("queue.name"))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        level = ?parse_level(&std::env::var("LOG_LEVEL").unwrap_or_default()),
        "Starting warren"
    );

    let status_interval = Duration::from_secs(config.supervisor.status_interval);
    let health = config.health.clone();

    let mut supervisor =
        Supervisor::new(config, Arc::new(AmqpConnector::new())).with_handler(Arc::new(AckAll));
    let reporter = spawn_status_reporter(
        supervisor.metrics(),
        status_interval,
        supervisor.subscribe_shutdown(),
    );
    let health_server = health.enabled.then(|| {
        let server = HealthServer::new(health.port, supervisor.metrics());
        tokio::spawn(server.run(supervisor.subscribe_shutdown()))
    });

    supervisor.start(&queue);

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(|e| WarrenError::internal(format!("SIGINT handler setup failed: {e}")))?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| WarrenError::internal(format!("SIGTERM handler setup failed: {e}")))?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }

    supervisor.stop().await;
    let _ = reporter.await;
    if let Some(handle) = health_server {
        let _ = handle.await;
    }

    info!(status = ?supervisor.status(), "Shutdown complete");
    Ok(())
}

fn handle_config_command(config: &Config, show: bool) -> WarrenResult<()> {
    if config.tls.enabled {
        let context = TlsContext::build(&config.tls)?;
        info!(
            min_version = ?context.min_version(),
            mutual_tls = context.is_mutual(),
            "TLS material valid"
        );
    }

    if show {
        let rendered = toml::to_string_pretty(&config.redacted()).map_err(ConfigError::from)?;
        println!("{rendered}");
    }

    info!(endpoint = %config.display_endpoint(), "Configuration valid");
    Ok(())
}

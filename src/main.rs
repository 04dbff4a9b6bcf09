//! pushgate - legacy APNs binary gateway sender
//!
//! Sends one notification payload to a list of device tokens over the
//! persistent-TLS binary gateway, resuming after the gateway's delayed error
//! reports and rotating connections every chunk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod error;
mod metrics;
mod push;
mod shutdown;

#[cfg(test)]
mod test_gateway;

use config::AppConfig;
use metrics::Metrics;
use push::payload::{DEFAULT_SOUND, parse_custom};
use push::{Batch, DeliveryDispatcher, DispatchOptions, PayloadBuilder, TlsGatewayConnector};
use shutdown::ShutdownHandler;

/// pushgate - legacy APNs binary gateway sender
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.toml", global = true)]
    config: String,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Send one notification to every token in a file
    Send(SendArgs),
}

#[derive(clap::Args, Debug)]
struct SendArgs {
    /// File with one hex device token per line
    #[arg(long)]
    tokens: PathBuf,

    /// Alert text
    #[arg(long)]
    alert: String,

    /// Badge number (0 for none)
    #[arg(long, default_value_t = 0)]
    badge: u32,

    /// Sound name (empty for none)
    #[arg(long, default_value = DEFAULT_SOUND)]
    sound: String,

    /// Set content-available
    #[arg(long)]
    content_available: bool,

    /// Custom top-level payload keys as a JSON object
    #[arg(long)]
    custom: Option<String>,

    /// Localized action button key
    #[arg(long)]
    action_loc_key: Option<String>,

    /// Localized alert message key
    #[arg(long)]
    loc_key: Option<String>,

    /// Localized alert argument (repeatable)
    #[arg(long = "loc-arg")]
    loc_args: Vec<String>,

    /// Use the sandbox gateway
    #[arg(long)]
    sandbox: bool,

    /// Expiry in epoch seconds (overrides dispatch.expiry)
    #[arg(long)]
    expiry: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if Path::new(&args.config).exists() {
        AppConfig::load(&args.config)
            .with_context(|| format!("Failed to load config from {}", args.config))?
    } else {
        AppConfig::from_env().context("Failed to load config from environment")?
    };

    init_logging(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %args.config,
        "Starting pushgate"
    );

    match args.command {
        Command::Send(send) => {
            if send.sandbox {
                config.gateway.use_sandbox();
            }
            run_send(&config, send).await
        }
    }
}

async fn run_send(config: &AppConfig, args: SendArgs) -> Result<()> {
    let contents = tokio::fs::read_to_string(&args.tokens)
        .await
        .with_context(|| format!("Failed to read token file {}", args.tokens.display()))?;
    let tokens = parse_token_list(&contents);

    let mut builder = PayloadBuilder::new(args.alert)
        .badge(args.badge)
        .sound(args.sound)
        .content_available(args.content_available)
        .loc_args(args.loc_args);
    if let Some(key) = args.action_loc_key {
        builder = builder.action_loc_key(key);
    }
    if let Some(key) = args.loc_key {
        builder = builder.loc_key(key);
    }
    if let Some(custom) = args.custom {
        builder = builder.custom(parse_custom(&custom).context("Invalid --custom payload")?);
    }
    let payload = builder.build().context("Failed to build payload")?;
    debug!(bytes = payload.len(), "Payload built");

    let expiry = args.expiry.unwrap_or(config.dispatch.expiry);
    let batch = Batch::new(tokens, payload, expiry);
    if batch.is_empty() {
        warn!(path = %args.tokens.display(), "Token file has no tokens");
    }

    let metrics = Arc::new(Metrics::new().context("Failed to create metrics")?);
    metrics.init_build_info(env!("CARGO_PKG_VERSION"));

    let connector = TlsGatewayConnector::from_config(&config.gateway)
        .await
        .context("Failed to set up gateway TLS")?;
    let mut dispatcher = DeliveryDispatcher::new(connector, DispatchOptions::from(&config.dispatch))
        .context("Invalid dispatch configuration")?;
    if config.metrics.enabled {
        dispatcher = dispatcher.with_metrics(metrics.clone());
    }

    info!(
        host = config.gateway.host(),
        port = config.gateway.port,
        production = config.gateway.is_production(),
        notifications = batch.len(),
        "Sending batch"
    );

    let shutdown = Arc::new(ShutdownHandler::new());
    let mut shutdown_rx = shutdown.subscribe();
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    // Dropping the submit future stops its listeners.
    let outcome = tokio::select! {
        result = dispatcher.submit(&batch) => Some(result),
        _ = shutdown_rx.changed() => None,
    };

    if config.metrics.enabled {
        write_metrics(config, &metrics).await;
    }

    match outcome {
        Some(result) => {
            let report = result.context("Batch failed")?;
            info!(
                frames_sent = report.frames_sent,
                skipped = report.skipped.len(),
                errors = report.error_count(),
                "Batch delivered"
            );
            Ok(())
        }
        None => anyhow::bail!("Batch cancelled by signal"),
    }
}

/// Device tokens from a token file: one per line, blank lines and `#`
/// comments ignored.
fn parse_token_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

async fn write_metrics(config: &AppConfig, metrics: &Metrics) {
    let path = &config.metrics.textfile_path;
    if path.is_empty() {
        return;
    }

    let rendered = match metrics.render() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            return;
        }
    };

    match tokio::fs::write(path, rendered).await {
        Ok(()) => debug!(path = %path, "Metrics written"),
        Err(e) => warn!(path = %path, error = %e, "Failed to write metrics"),
    }
}

/// Initialize the tracing subscriber based on configuration.
fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
        "off" => {}
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .init();
        }
    }

    Ok(())
}

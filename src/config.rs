//! Configuration loading and management.
//!
//! Supports TOML configuration files with environment variable overrides.
//! Environment variables follow the pattern: `PUSHGATE_<SECTION>__<KEY>`,
//! with a double underscore so keys like `chunk_size` keep theirs.

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::Deserialize;

use crate::error::Result;

/// Production gateway host.
pub const LIVE_GATEWAY_HOST: &str = "gateway.push.apple.com";

/// Sandbox gateway host.
pub const SANDBOX_GATEWAY_HOST: &str = "gateway.sandbox.push.apple.com";

/// Gateway port for both environments.
pub const GATEWAY_PORT: u16 = 2195;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Gateway connection configuration.
    pub gateway: GatewayConfig,

    /// Dispatch loop tuning.
    pub dispatch: DispatchConfig,

    /// Metrics configuration.
    pub metrics: MetricsConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Gateway connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Gateway environment: "production" or "sandbox".
    #[serde(default = "default_gateway_environment")]
    pub environment: String,

    /// Host override. Empty selects the host for `environment`.
    #[serde(default)]
    pub host: String,

    /// Gateway port.
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// PEM file with the client certificate chain.
    #[serde(default)]
    pub certificate_path: String,

    /// PEM file with the client private key.
    #[serde(default)]
    pub private_key_path: String,

    /// Optional PEM bundle of extra trust roots.
    #[serde(default)]
    pub ca_path: String,

    /// Allowed TLS version: "1.2", "1.3" or "any".
    #[serde(default = "default_tls_version")]
    pub tls_version: String,

    /// TCP connect plus TLS handshake timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_gateway_environment() -> String {
    "production".to_string()
}

fn default_gateway_port() -> u16 {
    GATEWAY_PORT
}

fn default_tls_version() -> String {
    "any".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

/// Dispatch loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Notifications sent on one connection before it is rotated.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Wait after the last notification for a trailing error response.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Delay between reads when the gateway has nothing to say.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive transport failures tolerated before the batch aborts.
    #[serde(default = "default_max_transport_retries")]
    pub max_transport_retries: u32,

    /// First transport retry backoff (doubles with each retry).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Expiry applied to every notification (epoch seconds, 0 = none).
    #[serde(default)]
    pub expiry: u32,
}

fn default_chunk_size() -> usize {
    100
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_transport_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are collected.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Where to write the text exposition after a batch. Empty disables.
    #[serde(default)]
    pub textfile_path: String,
}

fn default_metrics_enabled() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error", "off".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json", "pretty" or "compact".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn environment() -> Environment {
    Environment::with_prefix("PUSHGATE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl AppConfig {
    /// Load configuration from a file path with environment variable overrides.
    ///
    /// Environment variables follow the pattern: `PUSHGATE_<SECTION>__<KEY>`
    /// For example: `PUSHGATE_DISPATCH__CHUNK_SIZE`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_sources(Some(path.as_ref()), environment())
    }

    /// Load configuration from environment variables only (no config file).
    pub fn from_env() -> Result<Self> {
        Self::from_sources(None, environment())
    }

    fn from_sources(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Self::with_defaults()?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder.add_source(env).build()?;

        Ok(config.try_deserialize()?)
    }

    fn with_defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(Config::builder()
            .set_default("gateway.environment", "production")?
            .set_default("gateway.host", "")?
            .set_default("gateway.port", i64::from(GATEWAY_PORT))?
            .set_default("gateway.certificate_path", "")?
            .set_default("gateway.private_key_path", "")?
            .set_default("gateway.ca_path", "")?
            .set_default("gateway.tls_version", "any")?
            .set_default("gateway.connect_timeout_secs", 10)?
            .set_default("dispatch.chunk_size", 100)?
            .set_default("dispatch.grace_period_ms", 2000)?
            .set_default("dispatch.poll_interval_ms", 100)?
            .set_default("dispatch.max_transport_retries", 3)?
            .set_default("dispatch.initial_backoff_ms", 100)?
            .set_default("dispatch.expiry", 0)?
            .set_default("metrics.enabled", true)?
            .set_default("metrics.textfile_path", "")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?)
    }
}

impl GatewayConfig {
    /// Returns true if targeting the production gateway.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Switch to the sandbox gateway.
    pub fn use_sandbox(&mut self) {
        self.environment = "sandbox".to_string();
    }

    /// Gateway host for the configured environment, unless overridden.
    #[must_use]
    pub fn host(&self) -> &str {
        if !self.host.is_empty() {
            &self.host
        } else if self.is_production() {
            LIVE_GATEWAY_HOST
        } else {
            SANDBOX_GATEWAY_HOST
        }
    }

    /// Connect plus handshake timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

//! Configuration loader for the `sensorflow-live` client.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Rolling-average window used when `AVERAGE_WINDOW` is not set.
pub const DEFAULT_AVERAGE_WINDOW: u32 = 100;

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// REST base URL, e.g. `http://localhost:5000/api/v1`.
    pub api_url: String,

    /// Push stream URL (server-sent events).
    pub hub_url: String,

    /// Number of readings the backend averages over.
    pub average_window: u32,

    /// Per-request timeout for REST calls.
    pub request_timeout: Duration,

    /// How often the runner recomputes rolling averages.
    pub average_refresh: Duration,

    /// How often the runner logs the live table.
    pub snapshot_log: Duration,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `SENSOR_API_URL` – REST base URL
///
/// Optional:
/// - `SENSOR_HUB_URL` – push stream URL (default: `${SENSOR_API_URL}/sensorHub/stream`)
/// - `AVERAGE_WINDOW` – rolling average window (default: 100)
/// - `REQUEST_TIMEOUT_MS` – REST request timeout (default: 10000)
/// - `AVERAGE_REFRESH_SECS` – average recomputation period (default: 30)
/// - `SNAPSHOT_LOG_SECS` – snapshot logging period (default: 5)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let api_url = require_env!("SENSOR_API_URL");
    let api_url = api_url.trim_end_matches('/').to_string();
    let hub_url = env::var("SENSOR_HUB_URL").unwrap_or_else(|_| default_hub_url(&api_url));

    let average_window = parse_env_u32!("AVERAGE_WINDOW", DEFAULT_AVERAGE_WINDOW);
    if average_window == 0 {
        return Err(anyhow!("Invalid AVERAGE_WINDOW: must be at least 1"));
    }
    let request_timeout_ms = parse_env_u32!("REQUEST_TIMEOUT_MS", 10_000);
    let average_refresh_secs = parse_env_u32!("AVERAGE_REFRESH_SECS", 30);
    let snapshot_log_secs = parse_env_u32!("SNAPSHOT_LOG_SECS", 5);

    Ok(Config {
        api_url,
        hub_url,
        average_window,
        request_timeout: Duration::from_millis(u64::from(request_timeout_ms)),
        average_refresh: Duration::from_secs(u64::from(average_refresh_secs.max(1))),
        snapshot_log: Duration::from_secs(u64::from(snapshot_log_secs.max(1))),
    })
}

fn default_hub_url(api_url: &str) -> String {
    format!("{}/sensorHub/stream", api_url)
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  SENSOR_API_URL       : {}", self.api_url);
        tracing::info!("  SENSOR_HUB_URL       : {}", self.hub_url);
        tracing::info!("  AVERAGE_WINDOW       : {}", self.average_window);
        tracing::info!("  REQUEST_TIMEOUT_MS   : {}", self.request_timeout.as_millis());
        tracing::info!("  AVERAGE_REFRESH_SECS : {}", self.average_refresh.as_secs());
        tracing::info!("  SNAPSHOT_LOG_SECS    : {}", self.snapshot_log.as_secs());
    }
}

//! Application entry point for the `sensorflow-live` dashboard runner.
//!
//! This binary is the composition root for the live telemetry client:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Building the REST client and the push transport
//! - Seeding the live stats table from the REST baseline
//! - Subscribing the table to the push channel and starting it
//! - Periodically refreshing rolling averages and logging the table
//! - Stopping the channel and disposing the table on Ctrl-C
//!
//! # Environment Variables
//! - `SENSOR_API_URL` (**required**) – REST base URL
//! - `SENSOR_HUB_URL` (optional) – push stream URL
//! - `SENSORFLOW_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `SENSORFLOW_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the remaining tuning knobs.
use std::{env, sync::Arc};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tokio::time::{interval_at, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use sensorflow_live::{
    config, ConnectionManager, HttpSensorApi, SensorApi, SseTransport, StatsReconciler,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let api: Arc<dyn SensorApi> = Arc::new(
        HttpSensorApi::new(&cfg.api_url, cfg.request_timeout)
            .context("Failed to build REST client")?,
    );
    let manager = ConnectionManager::new(Arc::new(SseTransport::new(&cfg.hub_url)));
    let stats = StatsReconciler::with_window(Arc::clone(&api), cfg.average_window);

    let instances = match api.sensor_instances(None).await {
        Ok(instances) => instances,
        Err(e) => {
            error!("Failed to list sensor instances: {}", e);
            Vec::new()
        }
    };
    info!("Loading baseline for {} sensor instances", instances.len());
    let report = stats.load_baseline(&instances).await;
    if report.failed > 0 {
        warn!(
            "{} of {} instances have no baseline yet",
            report.failed,
            instances.len()
        );
    }

    let subscription = stats
        .attach(&manager)
        .context("Failed to subscribe the stats table")?;

    // One immediate retry on first start; after that the dashboard keeps
    // serving REST data and shows the channel as disconnected.
    if let Err(e) = manager.start().await {
        warn!("Push channel unavailable ({}), retrying once", e);
        if let Err(e) = manager.start().await {
            error!("Push channel unavailable: {}. Live updates are off.", e);
        }
    }

    let mut refresh = interval_at(Instant::now() + cfg.average_refresh, cfg.average_refresh);
    let mut snapshot_tick = interval_at(Instant::now() + cfg.snapshot_log, cfg.snapshot_log);
    let mut state_rx = manager.watch_state();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            _ = refresh.tick() => {
                let failed = stats.refresh_averages().await;
                if failed > 0 {
                    warn!("Average refresh failed for {} instances", failed);
                }
            }
            _ = snapshot_tick.tick() => log_snapshot(&stats, &manager),
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                info!(state = %state, "Connection state changed");
            }
        }
    }

    subscription.unsubscribe();
    manager.stop().await;
    stats.dispose();

    Ok(())
}

// ---

fn log_snapshot(stats: &StatsReconciler, manager: &ConnectionManager) {
    // ---
    let snapshot = stats.snapshot();
    info!(
        "[{}] {} live sensors",
        manager.current_state(),
        snapshot.len()
    );
    for stat in snapshot {
        info!(
            "  {:<20} {:>10.2} {:<6} avg {:>10.2}  updated {}",
            stat.instance_id,
            stat.latest_value,
            stat.unit,
            stat.average_value,
            stat.last_updated.format("%H:%M:%S")
        );
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `SENSORFLOW_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `SENSORFLOW_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("SENSORFLOW_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to SENSORFLOW_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("SENSORFLOW_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},hyper=warn,reqwest=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}

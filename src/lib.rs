//! Live telemetry client for IoT sensor dashboards.
//!
//! Three cooperating pieces, built bottom-up:
//! - [`ConnectionManager`] keeps one auto-recovering subscription to the
//!   push channel and fans readings out to subscribers;
//! - [`StatsReconciler`] merges REST baselines and pushed readings into the
//!   live per-instance table;
//! - [`align_series`] folds a window of readings from many instances into
//!   sparse, chart-ready rows.
//!
//! The REST backend is reached through [`SensorApi`]; the push transport
//! through [`PushTransport`]. Both are injected, so the composition root
//! owns every lifecycle explicitly.

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod models;
pub mod series;
pub mod stats;

pub use api::{fetch_window, HttpSensorApi, SensorApi};
pub use channel::{
    retry_delay, ConnectionManager, ConnectionState, PushSession, PushTransport, SseTransport,
    Subscription, TransportEvent,
};
pub use config::Config;
pub use error::{ApiError, AverageRefreshError, BaselineFetchError, ConnectionError, PayloadError};
pub use models::{
    series_key, AverageReading, ChartRow, LiveStat, PagedResponse, RawReading, Reading,
    ReadingFilter, SeriesSummary,
};
pub use series::{align_series, series_ids, summarize_series, Granularity};
pub use stats::{ApplyOutcome, BaselineReport, StatsReconciler};

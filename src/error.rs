//! Error taxonomy for the live telemetry client.
//!
//! Errors are split by the boundary that contains them:
//! - [`ConnectionError`] is surfaced by `ConnectionManager::start` and shown
//!   as a connectivity banner; it is never fatal to the process.
//! - [`PayloadError`] rejects loosely typed wire payloads before they become
//!   a [`Reading`](crate::Reading).
//! - [`ApiError`] covers a single REST call.
//! - [`BaselineFetchError`] and [`AverageRefreshError`] are per instance and
//!   are logged or counted by the reconciler, never propagated as a global
//!   failure.

use thiserror::Error;

// ---

/// The push channel could not be opened, or was closed underneath us.
#[derive(Debug, Error)]
pub enum ConnectionError {
    // ---
    #[error("failed to open push channel: {0}")]
    Connect(String),

    #[error("push stream error: {0}")]
    Stream(String),

    #[error("push channel closed by server: {0}")]
    ClosedByServer(String),

    #[error("connection manager was stopped")]
    Stopped,

    #[error("no Tokio runtime to deliver readings on")]
    NoRuntime,
}

impl From<reqwest::Error> for ConnectionError {
    fn from(e: reqwest::Error) -> Self {
        ConnectionError::Connect(e.to_string())
    }
}

/// A wire payload could not be turned into a strict `Reading`.
#[derive(Debug, Error)]
pub enum PayloadError {
    // ---
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is missing field '{0}'")]
    MissingField(&'static str),

    #[error("payload field '{field}' is invalid: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("payload timestamp '{0}' is not RFC 3339")]
    InvalidTimestamp(String),
}

/// A single REST request failed.
#[derive(Debug, Error)]
pub enum ApiError {
    // ---
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("invalid base URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// The initial stats for one instance could not be loaded.
#[derive(Debug, Error)]
pub enum BaselineFetchError {
    // ---
    #[error("baseline fetch for '{instance_id}' failed: {source}")]
    Api {
        instance_id: String,
        #[source]
        source: ApiError,
    },

    #[error("baseline fetch for '{0}' returned no readings")]
    NoReadings(String),
}

/// The rolling average for one instance could not be refreshed.
#[derive(Debug, Error)]
#[error("average refresh for '{instance_id}' failed: {source}")]
pub struct AverageRefreshError {
    pub instance_id: String,
    #[source]
    pub source: ApiError,
}

use std::fmt;
use std::time::Duration;

// ---

/// Reason recorded when the owner calls `stop()`.
pub const CLIENT_REQUESTED: &str = "client-requested";

/// Connectivity of the push channel, as shown by the dashboard indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed(String),
}

impl ConnectionState {
    // ---
    /// The manager owns a session or is working on getting one back.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Closed(reason) => write!(f, "Closed({})", reason),
        }
    }
}

/// Wait before reconnect attempt number `attempt` (1-based consecutive
/// failure count). Fixed schedule; attempts past the fourth stay at the
/// 30 second ceiling forever.
pub fn retry_delay(attempt: u32) -> Duration {
    // ---
    match attempt {
        0 | 1 => Duration::ZERO,
        2 => Duration::from_millis(2_000),
        3 => Duration::from_millis(10_000),
        _ => Duration::from_millis(30_000),
    }
}

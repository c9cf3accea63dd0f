use async_trait::async_trait;

use crate::error::{ConnectionError, PayloadError};
use crate::models::{RawReading, Reading};

// ---

/// Name of the server event that carries one sensor reading.
pub const SENSOR_READING_EVENT: &str = "ReceiveSensorReading";

/// What a session hands back on each read.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A named server event with its raw payload.
    Message { event: String, data: String },
    /// The server closed the channel for good (protocol error, auth revoked).
    Closed { cause: String },
}

/// Opens push sessions. Transport negotiation (socket, server push, polling)
/// is the implementor's concern; the manager only needs in-order delivery on
/// one session at a time.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushSession>, ConnectionError>;
}

/// One open subscription to the push channel.
#[async_trait]
pub trait PushSession: Send {
    /// Identifier of this session, for logs.
    fn session_id(&self) -> &str;

    /// Next event in server-send order. `None` means the transport dropped
    /// and the manager should reconnect.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Tear the session down.
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Decode a "sensor reading" payload into a strict `Reading`.
pub fn decode_reading(data: &str) -> Result<Reading, PayloadError> {
    // ---
    let raw: RawReading = serde_json::from_str(data)?;
    raw.to_reading()
}

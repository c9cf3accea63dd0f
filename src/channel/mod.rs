//! Connection Manager for the push channel.
//!
//! Internal to this gateway: the reconnect state machine (`manager`), the
//! state and backoff schedule (`state`), the transport seam (`transport`)
//! and the server-push-over-HTTP transport (`sse`). Everything the rest of
//! the crate needs is re-exported here.

mod manager;
mod sse;
mod state;
mod transport;

pub use manager::{ConnectionManager, Subscription};
pub use sse::SseTransport;
pub use state::{retry_delay, ConnectionState, CLIENT_REQUESTED};
pub use transport::{decode_reading, PushSession, PushTransport, TransportEvent, SENSOR_READING_EVENT};

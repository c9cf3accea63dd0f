//! Server-push-over-HTTP transport.
//!
//! Reads a `text/event-stream` body chunk by chunk and turns each
//! blank-line-terminated frame into a [`TransportEvent`]. A body that ends
//! is a transport drop (the manager reconnects); an `event: close` frame is
//! the server closing the channel for good.

use std::collections::VecDeque;

use async_trait::async_trait;
use reqwest::{header, Client, Response};
use tracing::{debug, warn};
use uuid::Uuid;

use super::transport::{PushSession, PushTransport, TransportEvent};
use crate::error::ConnectionError;

// ---

const CLOSE_EVENT: &str = "close";

/// Most bytes held for one unfinished frame before the stream is dropped.
const MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct SseTransport {
    http: Client,
    url: String,
}

impl SseTransport {
    // ---
    /// The client must not carry a whole-request timeout: the body is a
    /// stream that stays open for the lifetime of the session.
    pub fn new(url: &str) -> Self {
        Self::with_client(Client::new(), url)
    }

    pub fn with_client(http: Client, url: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl PushTransport for SseTransport {
    // ---
    async fn connect(&self) -> Result<Box<dyn PushSession>, ConnectionError> {
        // ---
        let resp = self
            .http
            .get(&self.url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ConnectionError::Connect(format!(
                "{} returned {}",
                self.url, status
            )));
        }

        let session = SseSession {
            id: Uuid::new_v4().to_string(),
            response: Some(resp),
            buffer: Vec::new(),
            after_cr: false,
            pending: VecDeque::new(),
        };
        debug!(session_id = %session.id, "Opened event stream {}", self.url);
        Ok(Box::new(session))
    }
}

struct SseSession {
    id: String,
    response: Option<Response>,
    buffer: Vec<u8>,
    /// Last byte fed was a CR, so a leading LF in the next chunk is its pair.
    after_cr: bool,
    pending: VecDeque<TransportEvent>,
}

impl SseSession {
    // ---
    /// Append body bytes with CRLF and bare CR folded to LF, then parse what
    /// is complete. Returns false once an unfinished frame outgrows
    /// `MAX_FRAME_BYTES`.
    fn feed(&mut self, bytes: &[u8]) -> bool {
        // ---
        for &b in bytes {
            match b {
                b'\r' => {
                    self.buffer.push(b'\n');
                    self.after_cr = true;
                }
                b'\n' if self.after_cr => self.after_cr = false,
                _ => {
                    self.buffer.push(b);
                    self.after_cr = false;
                }
            }
        }
        self.drain_frames();
        self.buffer.len() <= MAX_FRAME_BYTES
    }

    /// Move every complete frame out of the byte buffer.
    fn drain_frames(&mut self) {
        // ---
        while let Some(end) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&frame[..end]);
            if let Some(event) = parse_frame(&text) {
                self.pending.push_back(event);
            }
        }
    }
}

#[async_trait]
impl PushSession for SseSession {
    // ---
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        // ---
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let resp = self.response.as_mut()?;
            match resp.chunk().await {
                Ok(Some(bytes)) => {
                    if !self.feed(&bytes) {
                        warn!(
                            session_id = %self.id,
                            "Event stream frame exceeds {} bytes, dropping stream",
                            MAX_FRAME_BYTES
                        );
                        self.response = None;
                        self.buffer.clear();
                    }
                }
                Ok(None) => {
                    debug!(session_id = %self.id, "Event stream ended");
                    self.response = None;
                    return None;
                }
                Err(e) => {
                    warn!(session_id = %self.id, "Event stream read failed: {}", e);
                    self.response = None;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        // ---
        self.response = None;
        self.pending.clear();
        Ok(())
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Parse one event-stream frame (without its terminating blank line).
fn parse_frame(frame: &str) -> Option<TransportEvent> {
    // ---
    let mut event: Option<String> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }

    let event = event.unwrap_or_else(|| "message".to_string());
    let data = data.join("\n");
    if event == CLOSE_EVENT {
        let cause = if data.is_empty() {
            "server closed the event stream".to_string()
        } else {
            data
        };
        return Some(TransportEvent::Closed { cause });
    }
    Some(TransportEvent::Message { event, data })
}

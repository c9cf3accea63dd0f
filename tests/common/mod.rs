//! In-process fakes shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use sensorflow_live::channel::SENSOR_READING_EVENT;
use sensorflow_live::{
    ApiError, AverageReading, ConnectionError, PagedResponse, PushSession, PushTransport, Reading,
    ReadingFilter, TransportEvent,
};

// ---

pub fn ts(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 26, 18, 0, second).unwrap()
}

pub fn reading(id: &str, value: f64, second: u32) -> Reading {
    // ---
    Reading {
        sensor_type: "temperature".to_string(),
        sensor_instance_id: id.to_string(),
        value,
        unit: "°C".to_string(),
        timestamp: ts(second),
    }
}

pub fn reading_event(id: &str, value: f64, second: u32) -> TransportEvent {
    // ---
    TransportEvent::Message {
        event: SENSOR_READING_EVENT.to_string(),
        data: serde_json::to_string(&reading(id, value, second)).unwrap(),
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    // ---
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---

enum Plan {
    Session {
        rx: mpsc::UnboundedReceiver<TransportEvent>,
        close_fails: bool,
    },
    Fail,
    Refuse(String),
}

/// Push transport driven by a script of connect outcomes.
///
/// Each scripted session is fed through the sender returned when it was
/// queued; dropping that sender looks like a transport drop.
#[derive(Default)]
pub struct FakeTransport {
    plan: Mutex<VecDeque<Plan>>,
    connects: Mutex<Vec<Instant>>,
    sessions: AtomicUsize,
    hold: Mutex<Option<oneshot::Receiver<()>>>,
    close_attempts: Arc<AtomicUsize>,
}

impl FakeTransport {
    // ---
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_session(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.queue_session(false)
    }

    /// Like `push_session`, but closing the session reports an error.
    pub fn push_session_failing_close(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.queue_session(true)
    }

    fn queue_session(&self, close_fails: bool) -> mpsc::UnboundedSender<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.plan.lock().unwrap().push_back(Plan::Session { rx, close_fails });
        tx
    }

    /// Hold the next connect attempt open until the returned sender fires.
    pub fn hold_next_connect(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.hold.lock().unwrap() = Some(rx);
        tx
    }

    pub fn close_attempts(&self) -> usize {
        self.close_attempts.load(Ordering::SeqCst)
    }

    pub fn push_failures(&self, n: usize) {
        let mut plan = self.plan.lock().unwrap();
        for _ in 0..n {
            plan.push_back(Plan::Fail);
        }
    }

    pub fn push_refusal(&self, cause: &str) {
        self.plan.lock().unwrap().push_back(Plan::Refuse(cause.to_string()));
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    // ---
    async fn connect(&self) -> Result<Box<dyn PushSession>, ConnectionError> {
        // ---
        self.connects.lock().unwrap().push(Instant::now());
        let hold = self.hold.lock().unwrap().take();
        if let Some(rx) = hold {
            let _ = rx.await;
        }

        let next = self.plan.lock().unwrap().pop_front();
        match next {
            Some(Plan::Session { rx, close_fails }) => {
                let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Box::new(FakeSession {
                    id: format!("session-{}", n),
                    rx,
                    close_fails,
                    close_attempts: Arc::clone(&self.close_attempts),
                }))
            }
            Some(Plan::Refuse(cause)) => Err(ConnectionError::ClosedByServer(cause)),
            Some(Plan::Fail) | None => Err(ConnectionError::Connect("connection refused".to_string())),
        }
    }
}

struct FakeSession {
    id: String,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    close_fails: bool,
    close_attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl PushSession for FakeSession {
    // ---
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        // ---
        self.close_attempts.fetch_add(1, Ordering::SeqCst);
        self.rx.close();
        if self.close_fails {
            return Err(ConnectionError::Stream("socket already reset".to_string()));
        }
        Ok(())
    }
}

// ---

/// REST collaborator backed by in-memory maps.
#[derive(Default)]
pub struct FakeApi {
    pub latest: Mutex<HashMap<String, Reading>>,
    pub averages: Mutex<HashMap<String, f64>>,
    pub failing: Mutex<HashSet<String>>,
    pub window: Mutex<Vec<Reading>>,
    gates: Mutex<HashMap<String, oneshot::Receiver<f64>>>,
    pub average_calls: AtomicUsize,
}

impl FakeApi {
    // ---
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latest(&self, reading: Reading) {
        self.latest
            .lock()
            .unwrap()
            .insert(reading.sensor_instance_id.clone(), reading);
    }

    pub fn with_average(&self, id: &str, average: f64) {
        self.averages.lock().unwrap().insert(id.to_string(), average);
    }

    pub fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    /// Hold the next average request for `id` until the returned sender fires.
    pub fn gate_average(&self, id: &str) -> oneshot::Sender<f64> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(id.to_string(), rx);
        tx
    }

    pub fn average_calls(&self) -> usize {
        self.average_calls.load(Ordering::SeqCst)
    }

    fn status(code: u16, id: &str) -> ApiError {
        ApiError::Status {
            status: code,
            url: format!("fake://sensors/{}", id),
        }
    }
}

#[async_trait]
impl sensorflow_live::SensorApi for FakeApi {
    // ---
    async fn latest_readings(&self, instance_id: &str, count: u32) -> Result<Vec<Reading>, ApiError> {
        // ---
        if self.failing.lock().unwrap().contains(instance_id) {
            return Err(Self::status(500, instance_id));
        }
        let latest = self.latest.lock().unwrap().get(instance_id).cloned();
        Ok(latest.into_iter().take(count as usize).collect())
    }

    async fn rolling_average(&self, instance_id: &str, count: u32) -> Result<AverageReading, ApiError> {
        // ---
        self.average_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(instance_id) {
            return Err(Self::status(500, instance_id));
        }

        let gate = self.gates.lock().unwrap().remove(instance_id);
        if let Some(rx) = gate {
            let average = rx.await.map_err(|_| Self::status(504, instance_id))?;
            return Ok(AverageReading {
                sensor_instance_id: instance_id.to_string(),
                average,
                count,
            });
        }

        let average = self.averages.lock().unwrap().get(instance_id).copied();
        let average = average.ok_or_else(|| Self::status(404, instance_id))?;
        Ok(AverageReading {
            sensor_instance_id: instance_id.to_string(),
            average,
            count,
        })
    }

    async fn sensor_instances(&self, sensor_type: Option<&str>) -> Result<Vec<String>, ApiError> {
        // ---
        let latest = self.latest.lock().unwrap();
        let mut ids: Vec<String> = latest
            .values()
            .filter(|r| sensor_type.map_or(true, |t| r.sensor_type == t))
            .map(|r| r.sensor_instance_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn sensor_types(&self) -> Result<Vec<String>, ApiError> {
        // ---
        let mut types: Vec<String> = self
            .latest
            .lock()
            .unwrap()
            .values()
            .map(|r| r.sensor_type.clone())
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    async fn readings(&self, filter: &ReadingFilter) -> Result<PagedResponse<Reading>, ApiError> {
        // ---
        let matching: Vec<Reading> = self
            .window
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                filter
                    .sensor_instance_id
                    .as_ref()
                    .map_or(true, |id| &r.sensor_instance_id == id)
            })
            .cloned()
            .collect();

        let page_number = filter.page_number.unwrap_or(1);
        let page_size = filter.page_size.unwrap_or(10);
        let data = matching
            .iter()
            .skip(((page_number - 1) * page_size) as usize)
            .take(page_size as usize)
            .cloned()
            .collect();

        Ok(PagedResponse {
            data,
            page_number,
            page_size,
            total_records: matching.len() as u64,
        })
    }
}

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::{retry_delay, ConnectionState, CLIENT_REQUESTED};
use super::transport::{decode_reading, PushSession, PushTransport, TransportEvent, SENSOR_READING_EVENT};
use crate::error::ConnectionError;
use crate::models::Reading;

// ---

/// Owns one logical subscription to the push channel and fans readings out
/// to any number of subscribers.
///
/// Cloning is cheap and every clone drives the same subscription. Call
/// [`stop`](Self::stop) to release the session; dropping the last clone does
/// not stop a running pump.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn PushTransport>,
    state: watch::Sender<ConnectionState>,
    /// Bumped by `stop()`. Anything tagged with an older epoch is stale.
    epoch: Arc<AtomicU64>,
    failures: AtomicU32,
    malformed: AtomicU64,
    next_subscriber: AtomicU64,
    subscribers: Mutex<Vec<Slot>>,
    /// Lifecycle lock: state transitions and pump ownership change together.
    pump: Mutex<Option<Pump>>,
}

struct Slot {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Delivery {
    epoch: u64,
    reading: Reading,
}

struct Pump {
    // Dropping the sender also shuts the pump down.
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Handle returned by [`ConnectionManager::subscribe`].
///
/// `unsubscribe` may be called any number of times, including from inside
/// the subscriber's own callback.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    inner: Weak<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    // ---
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        // ---
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                state,
                epoch: Arc::new(AtomicU64::new(0)),
                failures: AtomicU32::new(0),
                malformed: AtomicU64::new(0),
                next_subscriber: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Open the push channel.
    ///
    /// A no-op success while a session is being opened, is open, or is being
    /// recovered. On failure the state becomes `Disconnected` and the error
    /// is returned; the caller decides whether to try again.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        // ---
        let claimed = {
            let _guard = lock(&self.inner.pump);
            if self.inner.state.borrow().is_active() {
                None
            } else {
                self.inner.state.send_replace(ConnectionState::Connecting);
                Some(self.inner.epoch.load(Ordering::SeqCst))
            }
        };
        let Some(epoch) = claimed else {
            debug!(state = %self.current_state(), "start() ignored, channel already active");
            return Ok(());
        };
        info!("Connecting push channel");

        match self.inner.transport.connect().await {
            Ok(session) => {
                let session_id = session.session_id().to_string();
                if let Err(mut stale) = Inner::install_pump(&self.inner, session, epoch) {
                    // stop() ran while we were connecting
                    close_quietly(stale.as_mut()).await;
                    return Err(ConnectionError::Stopped);
                }
                info!(session_id = %session_id, "Push channel connected");
                Ok(())
            }
            Err(e) => {
                self.inner.transition(epoch, ConnectionState::Disconnected);
                warn!("Failed to open push channel: {}", e);
                Err(e)
            }
        }
    }

    /// Tear the channel down and move to `Closed("client-requested")`.
    ///
    /// Cancels any pending reconnect timer. Readings already queued for
    /// subscribers are discarded. Teardown errors are logged, never returned.
    pub async fn stop(&self) {
        // ---
        let pump = {
            let mut guard = lock(&self.inner.pump);
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            self.inner
                .state
                .send_replace(ConnectionState::Closed(CLIENT_REQUESTED.to_string()));
            guard.take()
        };

        if let Some(pump) = pump {
            let _ = pump.shutdown.send(());
            if let Err(e) = pump.task.await {
                warn!("Push pump ended abnormally during stop: {}", e);
            }
        }
        info!("Push channel stopped");
    }

    /// Register `callback` for every inbound reading.
    ///
    /// Readings are delivered in arrival order from a dedicated task, so a
    /// subscriber's callback is never invoked concurrently with itself.
    /// Fails with [`ConnectionError::NoRuntime`] outside a Tokio runtime.
    pub fn subscribe<F>(&self, mut callback: F) -> Result<Subscription, ConnectionError>
    where
        F: FnMut(Reading) + Send + 'static,
    {
        // ---
        let Ok(runtime) = Handle::try_current() else {
            warn!("subscribe() called outside a Tokio runtime");
            return Err(ConnectionError::NoRuntime);
        };

        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

        let epoch = Arc::clone(&self.inner.epoch);
        let flag = Arc::clone(&active);
        runtime.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                if delivery.epoch != epoch.load(Ordering::SeqCst) {
                    continue;
                }
                callback(delivery.reading);
            }
        });

        lock(&self.inner.subscribers).push(Slot { id, tx });
        debug!(subscriber = id, "Subscriber registered");

        Ok(Subscription {
            id,
            active,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Current connectivity. Never blocks on I/O.
    pub fn current_state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
    }

    /// Consecutive failed reconnect attempts since the last good session.
    pub fn failure_count(&self) -> u32 {
        self.inner.failures.load(Ordering::SeqCst)
    }

    /// Sensor reading payloads rejected as malformed since construction.
    pub fn malformed_count(&self) -> u64 {
        self.inner.malformed.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }
}

impl Subscription {
    // ---
    pub fn unsubscribe(&self) {
        // ---
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.subscribers).retain(|slot| slot.id != self.id);
            debug!(subscriber = self.id, "Subscriber removed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Inner {
    // ---
    /// Apply `state` unless `stop()` has moved on to a newer epoch.
    fn transition(&self, epoch: u64, state: ConnectionState) -> bool {
        // ---
        let _guard = lock(&self.pump);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    /// Mark the session live and hand it to a fresh pump task. Gives the
    /// session back if the epoch is stale.
    fn install_pump(
        this: &Arc<Inner>,
        session: Box<dyn PushSession>,
        epoch: u64,
    ) -> Result<(), Box<dyn PushSession>> {
        // ---
        let mut guard = lock(&this.pump);
        if this.epoch.load(Ordering::SeqCst) != epoch {
            return Err(session);
        }
        this.failures.store(0, Ordering::SeqCst);
        this.state.send_replace(ConnectionState::Connected);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_pump(Arc::clone(this), session, epoch, shutdown_rx));
        if let Some(old) = guard.replace(Pump { shutdown, task }) {
            old.task.abort();
        }
        Ok(())
    }

    /// Route one server event. Only sensor readings reach subscribers.
    fn dispatch(&self, epoch: u64, event: &str, data: &str) {
        // ---
        if event != SENSOR_READING_EVENT {
            debug!(event, "Ignoring unrelated push event");
            return;
        }
        let reading = match decode_reading(data) {
            Ok(reading) => reading,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed sensor reading: {} - Raw payload: {}", e, data);
                return;
            }
        };

        lock(&self.subscribers).retain(|slot| {
            slot.tx
                .send(Delivery {
                    epoch,
                    reading: reading.clone(),
                })
                .is_ok()
        });
    }
}

enum Step {
    Shutdown,
    Event(Option<TransportEvent>),
}

async fn run_pump(
    inner: Arc<Inner>,
    mut session: Box<dyn PushSession>,
    epoch: u64,
    mut shutdown: oneshot::Receiver<()>,
) {
    // ---
    loop {
        let step = tokio::select! {
            _ = &mut shutdown => Step::Shutdown,
            event = session.next_event() => Step::Event(event),
        };

        match step {
            Step::Shutdown => {
                close_quietly(session.as_mut()).await;
                return;
            }
            Step::Event(Some(TransportEvent::Message { event, data })) => {
                inner.dispatch(epoch, &event, &data);
            }
            Step::Event(Some(TransportEvent::Closed { cause })) => {
                warn!(session_id = %session.session_id(), "Push channel closed by server: {}", cause);
                close_quietly(session.as_mut()).await;
                inner.transition(epoch, ConnectionState::Closed(cause));
                return;
            }
            Step::Event(None) => {
                warn!(session_id = %session.session_id(), "Push channel lost, reconnecting");
                close_quietly(session.as_mut()).await;
                if !inner.transition(epoch, ConnectionState::Reconnecting) {
                    return;
                }
                match reconnect(&inner, epoch, &mut shutdown).await {
                    Some(fresh) => session = fresh,
                    None => return,
                }
            }
        }
    }
}

/// Retry per the fixed backoff schedule until a session opens, the owner
/// stops the manager, or the transport reports the channel closed for good.
async fn reconnect(
    inner: &Arc<Inner>,
    epoch: u64,
    shutdown: &mut oneshot::Receiver<()>,
) -> Option<Box<dyn PushSession>> {
    // ---
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let delay = retry_delay(attempt);
        if !delay.is_zero() {
            info!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect attempt");
        }

        let cancelled = tokio::select! {
            _ = &mut *shutdown => true,
            _ = tokio::time::sleep(delay) => false,
        };
        if cancelled {
            return None;
        }

        let outcome = tokio::select! {
            _ = &mut *shutdown => None,
            result = inner.transport.connect() => Some(result),
        };

        match outcome {
            None => return None,
            Some(Ok(mut session)) => {
                let live = {
                    let _guard = lock(&inner.pump);
                    let live = inner.epoch.load(Ordering::SeqCst) == epoch;
                    if live {
                        inner.failures.store(0, Ordering::SeqCst);
                        inner.state.send_replace(ConnectionState::Connected);
                    }
                    live
                };
                if !live {
                    close_quietly(session.as_mut()).await;
                    return None;
                }
                info!(session_id = %session.session_id(), attempt, "Push channel reconnected");
                return Some(session);
            }
            Some(Err(ConnectionError::ClosedByServer(cause))) => {
                warn!(attempt, "Push channel refused reconnect: {}", cause);
                inner.transition(epoch, ConnectionState::Closed(cause));
                return None;
            }
            Some(Err(e)) => {
                inner.failures.store(attempt, Ordering::SeqCst);
                warn!(attempt, "Reconnect attempt failed: {}", e);
            }
        }
    }
}

async fn close_quietly(session: &mut dyn PushSession) {
    // ---
    if let Err(e) = session.close().await {
        warn!(session_id = %session.session_id(), "Error closing push session: {}", e);
    }
}

//! Invalidation transports
//!
//! A [`Transport`] carries invalidation events between cooperating service
//! instances. Every implementation follows the same lifecycle:
//!
//! - `connect()` establishes a session and is a no-op while one is live
//! - `disconnect()` stops the session's background tasks and waits for them
//!   for a bounded time
//! - `broadcast()` never blocks on I/O; it hands the event to the session
//! - runtime failures are logged and reported as [`TransportEvent::Disconnected`];
//!   the owner decides when to connect again
//!
//! Events flow to the owner through a [`TransportEvents`] handle given at
//! construction.

mod frame;
mod in_process;
mod redis_topic;
mod relay;
mod relay_leaf;

pub use frame::{MAX_FRAME_LEN, MessageReader, RelayMessage, socket_addr, write_message};
pub use in_process::{InProcessBus, InProcessTransport};
pub use redis_topic::RedisTopic;
pub use relay::{RelayBroker, RelayEndpoints};
pub use relay_leaf::RelayLeaf;

use async_trait::async_trait;
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    CacheError, EventType, InvalidationEvent, Region,
    config::{TransportConfig, TransportKind, TransportSettings},
};

/// Topic used when none is configured
pub const DEFAULT_TOPIC: &str = "TridionCacheChannel";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notification raised by a transport to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// The session failed. Not raised for an explicit `disconnect()`.
    Disconnected,
    /// An invalidation event arrived on the bus
    Cache(InvalidationEvent),
}

/// Where a transport delivers its [`TransportEvent`]s.
///
/// A detached handle has no listener: events are logged and dropped.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    tx: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl TransportEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn is_attached(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub(crate) fn emit(&self, source: &str, event: TransportEvent) {
        match &self.tx {
            Some(tx) => {
                if let Err(e) = tx.send(event) {
                    debug!("{}: listener is gone, dropping {:?}", source, e.0);
                }
            }
            None => debug!("{}: no listener attached, dropping {:?}", source, event),
        }
    }
}

/// Lifecycle and broadcast contract shared by all transports
#[async_trait]
pub trait Transport: Send + Sync {
    /// Process-unique name of this participant, used for diagnostics
    fn identifier(&self) -> &str;

    fn state(&self) -> TransportState;

    /// Establish the session. Calling it while connected does nothing.
    async fn connect(&self);

    /// Stop the session and release its resources. Safe to call at any time.
    async fn disconnect(&self);

    /// Send an event to every participant on the bus, this one included.
    fn broadcast(&self, region: Region, key: &str, event_type: EventType);

    fn broadcast_numeric(&self, region: Region, key: i64, event_type: EventType) {
        self.broadcast(region, &key.to_string(), event_type);
    }

    /// Whether cached values can be trusted to be invalidated through this transport
    fn allows_caching(&self) -> bool {
        true
    }
}

/// Build the transport selected by `config`.
///
/// Missing or invalid settings fail here, before anything is connected.
pub fn from_config(
    config: &TransportConfig,
    events: TransportEvents,
) -> Result<Arc<dyn Transport>, CacheError> {
    let transport: Arc<dyn Transport> = match config.kind {
        TransportKind::None => Arc::new(NullTransport::new()),
        TransportKind::InProcess => Arc::new(InProcessTransport::new(
            InProcessBus::global(),
            &config.settings,
            events,
        )?),
        TransportKind::RelayLeaf => Arc::new(RelayLeaf::new(&config.settings, events)?),
        TransportKind::RelayBroker => Arc::new(RelayBroker::new(&config.settings, events)?),
        TransportKind::RedisTopic => Arc::new(RedisTopic::new(&config.settings, events)?),
    };
    info!(
        "Cache transport {} ({:?}) configured.",
        transport.identifier(),
        config.kind
    );
    Ok(transport)
}

/// Transport used when nothing is configured. Broadcasts go nowhere and
/// cached values are never trusted.
#[derive(Debug)]
pub struct NullTransport {
    identifier: String,
}

impl NullTransport {
    pub fn new() -> Self {
        Self {
            identifier: format!("Null-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl Default for NullTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for NullTransport {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn state(&self) -> TransportState {
        TransportState::Disconnected
    }

    async fn connect(&self) {}

    async fn disconnect(&self) {}

    fn broadcast(&self, region: Region, key: &str, event_type: EventType) {
        debug!(
            "{}: dropping {} for region {} key \"{}\"",
            self.identifier, event_type, region, key
        );
    }

    fn allows_caching(&self) -> bool {
        false
    }
}

/// Timing knobs shared by the background-task transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerOptions {
    pub poll_interval: Duration,
    pub join_timeout: Duration,
    pub queue_capacity: usize,
}

impl WorkerOptions {
    pub fn from_settings(component: &str, settings: &TransportSettings) -> Result<Self, CacheError> {
        let queue_capacity = settings
            .get_parsed::<usize>(component, "queueCapacity")?
            .unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            return Err(CacheError::configuration(component, "queueCapacity must be positive."));
        }
        Ok(Self {
            poll_interval: settings.duration_ms(component, "pollIntervalMs", DEFAULT_POLL_INTERVAL)?,
            join_timeout: settings.duration_ms(component, "joinTimeoutMs", DEFAULT_JOIN_TIMEOUT)?,
            queue_capacity,
        })
    }
}

/// Current [`TransportState`], readable from any task
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn get(&self) -> TransportState {
        match self.0.load(Ordering::SeqCst) {
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            _ => TransportState::Disconnected,
        }
    }

    pub fn set(&self, state: TransportState) {
        let raw = match state {
            TransportState::Disconnected => 0,
            TransportState::Connecting => 1,
            TransportState::Connected => 2,
        };
        self.0.store(raw, Ordering::SeqCst);
    }
}

/// What a background task needs to observe shutdown and report faults
#[derive(Clone)]
pub(crate) struct SessionHandle {
    component: Arc<str>,
    shutdown: Arc<AtomicBool>,
    state: Arc<StateCell>,
    events: TransportEvents,
}

impl SessionHandle {
    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(&self.component, event);
    }

    /// Stop the session after a runtime failure. Only the first fault of a
    /// session is reported, and none after an explicit stop.
    pub fn fault(&self, reason: impl std::fmt::Display) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("{}: {}", self.component, reason);
        self.state.set(TransportState::Disconnected);
        self.emit(TransportEvent::Disconnected);
    }
}

/// One connected session: its stop flag plus the tasks it spawned
pub(crate) struct Session {
    handle: SessionHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task));
    }

    fn is_live(&self) -> bool {
        !self.handle.is_stopped()
    }

    /// Signal the tasks to stop and wait up to `join_timeout` for them,
    /// aborting whatever is still running afterwards.
    async fn stop(self, join_timeout: Duration) {
        self.handle.shutdown.store(true, Ordering::SeqCst);
        let component = Arc::clone(&self.handle.component);
        let mut tasks = self.tasks;
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();

        let joined = tokio::time::timeout(join_timeout, async {
            for task in tasks.iter_mut() {
                if let Err(e) = task.await
                    && e.is_panic()
                {
                    error!("{}: background task panicked: {}", component, e);
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                "{}: background tasks did not stop within {:?}; aborting them",
                component, join_timeout
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// Session bookkeeping shared by the background-task transports
pub(crate) struct Lifecycle {
    component: Arc<str>,
    state: Arc<StateCell>,
    events: TransportEvents,
    join_timeout: Duration,
    session: AsyncMutex<Option<Session>>,
}

impl Lifecycle {
    pub fn new(component: &str, events: TransportEvents, join_timeout: Duration) -> Self {
        Self {
            component: Arc::from(component),
            state: Arc::new(StateCell::new()),
            events,
            join_timeout,
            session: AsyncMutex::new(None),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state.get()
    }

    /// Run `start` unless a live session exists. A session that stopped on
    /// a fault is cleaned up first. `start` populates the new session or
    /// returns an error, which is logged and reported as `Disconnected`.
    pub async fn connect<F, Fut>(&self, start: F)
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<Session, CacheError>>,
    {
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(Session::is_live) {
            debug!("{}: already connected", self.component);
            return;
        }
        if let Some(stale) = slot.take() {
            stale.stop(self.join_timeout).await;
        }

        self.state.set(TransportState::Connecting);
        let session = Session {
            handle: SessionHandle {
                component: Arc::clone(&self.component),
                shutdown: Arc::new(AtomicBool::new(false)),
                state: Arc::clone(&self.state),
                events: self.events.clone(),
            },
            tasks: Vec::new(),
        };
        let handle = session.handle();

        match start(session).await {
            Ok(session) => {
                // A task may already have faulted the session.
                if session.is_live() {
                    self.state.set(TransportState::Connected);
                    info!("{}: connected", self.component);
                    handle.emit(TransportEvent::Connected);
                }
                *slot = Some(session);
            }
            Err(e) => handle.fault(format!("connect failed: {}", e)),
        }
    }

    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.stop(self.join_timeout).await;
            info!("{}: disconnected", self.component);
        }
        self.state.set(TransportState::Disconnected);
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(&self.component, event);
    }
}

/// Bounded outbound queue between `broadcast()` callers and a sender task.
///
/// The receiver outlives sessions so messages queued while disconnected are
/// sent after the next connect.
pub(crate) struct OutboundQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<AsyncMutex<mpsc::Receiver<T>>>,
}

impl<T: Send + 'static> OutboundQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }

    /// Queue without waiting; a full queue drops the message with a warning.
    pub fn push(&self, component: &str, item: T) {
        if let Err(e) = self.tx.try_send(item) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("{}: outbound queue is full; dropping message", component)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("{}: outbound queue is closed; dropping message", component)
                }
            }
        }
    }

    pub fn receiver(&self) -> Arc<AsyncMutex<mpsc::Receiver<T>>> {
        Arc::clone(&self.rx)
    }
}

/// Encode the events for `region` into wire payloads, logging failures.
pub(crate) fn encode_events(
    component: &str,
    region: Region,
    key: &str,
    event_type: EventType,
) -> Vec<String> {
    InvalidationEvent::for_region(region, key, event_type)
        .into_iter()
        .filter_map(|event| match event.encode() {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!("{}: failed to encode {}: {}", component, event, e);
                None
            }
        })
        .collect()
}

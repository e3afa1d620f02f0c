//! Relay broker
//!
//! A rendezvous point for processes with no native many-to-many channel.
//! Leaves push messages to the collector endpoint (`submissionUri`); every
//! message is queued and republished to every subscriber connected to the
//! publisher endpoint (`subscriptionUri`), whatever its topic. Receivers
//! filter on topic themselves.
//!
//! The broker is also a participant: messages on its own topic raise cache
//! events locally, and its own broadcasts are both republished and applied.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex as AsyncMutex, mpsc},
    task::{AbortHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use super::{
    DEFAULT_TOPIC, Lifecycle, MessageReader, OutboundQueue, RelayMessage, SessionHandle,
    Transport, TransportEvent, TransportEvents, TransportState, WorkerOptions, encode_events,
    socket_addr, write_message,
};
use crate::{CacheError, EventType, InvalidationEvent, Region, config::TransportSettings};

const COMPONENT: &str = "RelayBroker";

/// State shared between the broker handle and its connection tasks
struct Relay {
    identifier: String,
    topic: String,
    queue: OutboundQueue<RelayMessage>,
}

impl Relay {
    /// Queue `message` for republishing and raise it locally when it is on our topic.
    fn ingest(&self, session: &SessionHandle, message: RelayMessage) {
        debug!(
            "{}: received topic \"{}\" from {}",
            self.identifier, message.topic, message.origin
        );
        let local = if message.topic.eq_ignore_ascii_case(&self.topic) {
            InvalidationEvent::decode(&message.payload)
        } else {
            None
        };
        self.queue.push(&self.identifier, message);
        if let Some(event) = local {
            session.emit(TransportEvent::Cache(event));
        }
    }
}

/// Addresses the broker is listening on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayEndpoints {
    pub subscription: SocketAddr,
    pub submission: SocketAddr,
}

/// Standalone fan-out relay that also participates as a node
pub struct RelayBroker {
    relay: Arc<Relay>,
    subscription_addr: String,
    submission_addr: String,
    options: WorkerOptions,
    endpoints: Mutex<Option<RelayEndpoints>>,
    lifecycle: Lifecycle,
}

impl RelayBroker {
    /// Requires `subscriptionUri` and `submissionUri` (bind addresses);
    /// `topic` defaults to [`DEFAULT_TOPIC`].
    pub fn new(settings: &TransportSettings, events: TransportEvents) -> Result<Self, CacheError> {
        let subscription_addr =
            socket_addr(COMPONENT, settings.require(COMPONENT, "subscriptionUri")?)?;
        let submission_addr = socket_addr(COMPONENT, settings.require(COMPONENT, "submissionUri")?)?;
        let options = WorkerOptions::from_settings(COMPONENT, settings)?;
        let topic = match settings.get("topic") {
            Some(topic) => topic.to_owned(),
            None => {
                info!("{}: no topic configured, defaulting to \"{}\"", COMPONENT, DEFAULT_TOPIC);
                DEFAULT_TOPIC.to_owned()
            }
        };
        let identifier = format!("{}-{}", COMPONENT, uuid::Uuid::new_v4());

        Ok(Self {
            relay: Arc::new(Relay {
                identifier: identifier.clone(),
                topic,
                queue: OutboundQueue::new(options.queue_capacity),
            }),
            subscription_addr,
            submission_addr,
            endpoints: Mutex::new(None),
            lifecycle: Lifecycle::new(&identifier, events, options.join_timeout),
            options,
        })
    }

    pub fn topic(&self) -> &str {
        &self.relay.topic
    }

    /// Bound addresses of the current session, useful when binding port 0.
    pub fn endpoints(&self) -> Option<RelayEndpoints> {
        *self.endpoints.lock()
    }
}

#[async_trait]
impl Transport for RelayBroker {
    fn identifier(&self) -> &str {
        &self.relay.identifier
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    async fn connect(&self) {
        self.lifecycle
            .connect(|mut session| async move {
                let publisher = TcpListener::bind(&self.subscription_addr).await?;
                let collector = TcpListener::bind(&self.submission_addr).await?;
                let endpoints = RelayEndpoints {
                    subscription: publisher.local_addr()?,
                    submission: collector.local_addr()?,
                };
                info!(
                    "{}: bound subscription {} and submission {}",
                    self.relay.identifier, endpoints.subscription, endpoints.submission
                );
                *self.endpoints.lock() = Some(endpoints);

                let handle = session.handle();
                session.spawn(run_publisher(
                    handle.clone(),
                    publisher,
                    self.relay.queue.receiver(),
                    self.options,
                ));
                session.spawn(run_collector(
                    handle,
                    collector,
                    Arc::clone(&self.relay),
                    self.options.poll_interval,
                ));
                Ok(session)
            })
            .await;
    }

    async fn disconnect(&self) {
        self.lifecycle.disconnect().await;
        *self.endpoints.lock() = None;
    }

    /// Republish to every subscriber and apply locally.
    fn broadcast(&self, region: Region, key: &str, event_type: EventType) {
        for payload in encode_events(&self.relay.identifier, region, key, event_type) {
            let message = RelayMessage::new(&self.relay.topic, &self.relay.identifier, payload);
            if let Some(event) = InvalidationEvent::decode(&message.payload) {
                self.lifecycle.emit(TransportEvent::Cache(event));
            }
            self.relay.queue.push(&self.relay.identifier, message);
        }
    }
}

/// Accept subscribers and hand every queued message to each subscriber's
/// writer. A subscriber whose backlog is full is dropped, so one slow reader
/// never holds up the others.
async fn run_publisher(
    session: SessionHandle,
    listener: TcpListener,
    queue: Arc<AsyncMutex<mpsc::Receiver<RelayMessage>>>,
    options: WorkerOptions,
) {
    let mut queue = queue.lock().await;
    let mut subscribers: Vec<Subscriber> = Vec::new();
    let mut writers = JoinSet::new();

    while !session.is_stopped() {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("{}: set_nodelay failed for {}: {}", session.component(), peer, e);
                    }
                    info!("{}: subscriber {} connected", session.component(), peer);
                    let (tx, rx) = mpsc::channel(options.queue_capacity);
                    let writer = writers.spawn(run_subscriber(
                        session.clone(),
                        stream,
                        peer,
                        rx,
                        options.poll_interval,
                    ));
                    subscribers.push(Subscriber { peer, tx, writer });
                }
                Err(e) => warn!("{}: accept on publisher failed: {}", session.component(), e),
            },
            message = queue.recv() => match message {
                Some(message) => publish(&session, &mut subscribers, message),
                None => break,
            },
            _ = tokio::time::sleep(options.poll_interval) => {}
        }
        while writers.try_join_next().is_some() {}
    }
    writers.shutdown().await;
    debug!(
        "{}: publisher stopped with {} subscribers",
        session.component(),
        subscribers.len()
    );
}

struct Subscriber {
    peer: SocketAddr,
    tx: mpsc::Sender<Arc<RelayMessage>>,
    writer: AbortHandle,
}

fn publish(session: &SessionHandle, subscribers: &mut Vec<Subscriber>, message: RelayMessage) {
    debug!(
        "{}: relaying topic \"{}\" from {} to {} subscribers",
        session.component(),
        message.topic,
        message.origin,
        subscribers.len()
    );
    let message = Arc::new(message);
    subscribers.retain(|subscriber| match subscriber.tx.try_send(Arc::clone(&message)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(
                "{}: subscriber {} is not keeping up; dropping it",
                session.component(),
                subscriber.peer
            );
            subscriber.writer.abort();
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// Write one subscriber's backlog to its socket. A write that does not finish
/// within `poll_interval` closes the subscription.
async fn run_subscriber(
    session: SessionHandle,
    mut stream: TcpStream,
    peer: SocketAddr,
    mut backlog: mpsc::Receiver<Arc<RelayMessage>>,
    poll_interval: Duration,
) {
    while !session.is_stopped() {
        let message = match timeout(poll_interval, backlog.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => continue,
        };
        match timeout(poll_interval, write_message(&mut stream, &message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                info!("{}: dropping subscriber {}: {}", session.component(), peer, e);
                break;
            }
            Err(_) => {
                warn!(
                    "{}: subscriber {} stopped reading; dropping it",
                    session.component(),
                    peer
                );
                break;
            }
        }
    }
}

/// Accept pushing clients and feed their messages into the relay.
async fn run_collector(
    session: SessionHandle,
    listener: TcpListener,
    relay: Arc<Relay>,
    poll_interval: Duration,
) {
    let mut readers = JoinSet::new();
    while !session.is_stopped() {
        match timeout(poll_interval, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("{}: submitter {} connected", session.component(), peer);
                readers.spawn(run_submitter(
                    session.clone(),
                    stream,
                    peer,
                    Arc::clone(&relay),
                    poll_interval,
                ));
            }
            Ok(Err(e)) => warn!("{}: accept on collector failed: {}", session.component(), e),
            Err(_) => {}
        }
        // Reap finished connections.
        while readers.try_join_next().is_some() {}
    }
    readers.shutdown().await;
    debug!("{}: collector stopped", session.component());
}

/// Read one submitter's messages until it disconnects. Framing errors close
/// only this connection.
async fn run_submitter(
    session: SessionHandle,
    stream: TcpStream,
    peer: SocketAddr,
    relay: Arc<Relay>,
    poll_interval: Duration,
) {
    let mut reader = MessageReader::new(stream);
    while !session.is_stopped() {
        match timeout(poll_interval, reader.read_message()).await {
            Ok(Ok(Some(message))) => relay.ingest(&session, message),
            Ok(Ok(None)) => {
                debug!("{}: submitter {} disconnected", session.component(), peer);
                break;
            }
            Ok(Err(e)) => {
                warn!("{}: dropping submitter {}: {}", session.component(), peer, e);
                break;
            }
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn loopback(topic: Option<&str>) -> TransportSettings {
        let settings = TransportSettings::new()
            .with("subscriptionUri", "tcp://127.0.0.1:0")
            .with("submissionUri", "tcp://127.0.0.1:0")
            .with("pollIntervalMs", "50")
            .with("joinTimeoutMs", "1000");
        match topic {
            Some(topic) => settings.with("topic", topic),
            None => settings,
        }
    }

    async fn connected_broker(
        topic: Option<&str>,
    ) -> (
        RelayBroker,
        RelayEndpoints,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (events, mut rx) = TransportEvents::channel();
        let broker = RelayBroker::new(&loopback(topic), events).unwrap();
        broker.connect().await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        let endpoints = broker.endpoints().unwrap();
        (broker, endpoints, rx)
    }

    fn payload(key: &str) -> String {
        InvalidationEvent::new("/com.tridion.storage.ItemMeta", key, EventType::Invalidate)
            .encode()
            .unwrap()
    }

    #[test]
    fn requires_both_endpoints() {
        let settings = TransportSettings::new().with("subscriptionUri", "tcp://*:5556");
        assert!(matches!(
            RelayBroker::new(&settings, TransportEvents::detached()),
            Err(CacheError::Configuration(msg)) if msg == "RelayBroker: submissionUri is unconfigured."
        ));
    }

    #[tokio::test]
    async fn relays_every_topic_and_raises_only_its_own() {
        let (broker, endpoints, mut rx) = connected_broker(None).await;
        let subscriber = TcpStream::connect(endpoints.subscription).await.unwrap();
        let mut subscriber = MessageReader::new(subscriber);
        // Let the publisher accept the subscriber before anything is relayed.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut submitter = TcpStream::connect(endpoints.submission).await.unwrap();
        let foreign = RelayMessage::new("OtherChannel", "leaf-a", payload("1"));
        let ours = RelayMessage::new(DEFAULT_TOPIC, "leaf-b", payload("2"));
        write_message(&mut submitter, &foreign).await.unwrap();
        write_message(&mut submitter, &ours).await.unwrap();

        assert_eq!(subscriber.read_message().await.unwrap(), Some(foreign));
        assert_eq!(subscriber.read_message().await.unwrap(), Some(ours));

        match rx.recv().await {
            Some(TransportEvent::Cache(event)) => assert_eq!(event.key(), "2"),
            other => panic!("unexpected event {:?}", other),
        }
        broker.disconnect().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn own_broadcast_is_applied_and_republished() {
        let (broker, endpoints, mut rx) = connected_broker(Some("Staging")).await;
        let subscriber = TcpStream::connect(endpoints.subscription).await.unwrap();
        let mut subscriber = MessageReader::new(subscriber);
        tokio::time::sleep(Duration::from_millis(150)).await;

        broker.broadcast(Region::COMPONENT_PRESENTATION, "233:685281", EventType::Invalidate);

        match rx.recv().await {
            Some(TransportEvent::Cache(event)) => {
                assert_eq!(event.region(), Region::COMPONENT_PRESENTATION);
                assert_eq!(event.key(), "233:685281");
            }
            other => panic!("unexpected event {:?}", other),
        }
        let relayed = subscriber.read_message().await.unwrap().unwrap();
        assert_eq!(relayed.topic, "Staging");
        assert_eq!(relayed.origin, broker.identifier());
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn bad_frame_closes_only_that_submitter() {
        let (broker, endpoints, mut rx) = connected_broker(None).await;

        let mut bad = TcpStream::connect(endpoints.submission).await.unwrap();
        bad.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let mut good = TcpStream::connect(endpoints.submission).await.unwrap();
        write_message(&mut good, &RelayMessage::new(DEFAULT_TOPIC, "leaf", payload("9")))
            .await
            .unwrap();

        match rx.recv().await {
            Some(TransportEvent::Cache(event)) => assert_eq!(event.key(), "9"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(broker.state(), TransportState::Connected);
        broker.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_subscriber_does_not_hold_up_the_others() {
        let (broker, endpoints, rx) = connected_broker(None).await;
        drop(rx);
        let _stalled = TcpStream::connect(endpoints.subscription).await.unwrap();
        let healthy = TcpStream::connect(endpoints.subscription).await.unwrap();
        let mut healthy = MessageReader::new(healthy);

        // Subscribers are accepted in order, so once the healthy one hears
        // anything the stalled one is attached too.
        let mut attached = false;
        for _ in 0..50 {
            broker.broadcast(Region::ITEM_META, "warmup", EventType::Flush);
            if let Ok(message) = timeout(Duration::from_millis(100), healthy.read_message()).await {
                assert!(message.unwrap().is_some());
                attached = true;
                break;
            }
        }
        assert!(attached);

        let big_key = "k".repeat(200_000);
        for i in 0..200 {
            broker.broadcast(Region::ITEM_META, &format!("{}{}", big_key, i), EventType::Invalidate);
        }

        let mut received = 0;
        while received < 200 {
            let message = timeout(Duration::from_secs(10), healthy.read_message())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if message.payload.len() > 100_000 {
                received += 1;
            }
        }
        assert_eq!(received, 200);

        let started = std::time::Instant::now();
        broker.disconnect().await;
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn disconnect_is_bounded_and_idempotent() {
        let (broker, endpoints, _rx) = connected_broker(None).await;
        let _subscriber = TcpStream::connect(endpoints.subscription).await.unwrap();
        let _submitter = TcpStream::connect(endpoints.submission).await.unwrap();

        let started = std::time::Instant::now();
        broker.disconnect().await;
        broker.disconnect().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(broker.state(), TransportState::Disconnected);
        assert!(broker.endpoints().is_none());

        broker.connect().await;
        assert_eq!(broker.state(), TransportState::Connected);
        broker.disconnect().await;
    }
}

//! Relay client
//!
//! Pushes locally originated events to a [`RelayBroker`](super::RelayBroker)'s
//! submission endpoint and listens on its subscription endpoint, keeping only
//! messages for the configured topic.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex as AsyncMutex, mpsc},
    time::timeout,
};
use tracing::{debug, info, warn};

use super::{
    DEFAULT_TOPIC, Lifecycle, MessageReader, OutboundQueue, RelayMessage, SessionHandle,
    Transport, TransportEvent, TransportEvents, TransportState, WorkerOptions, encode_events,
    socket_addr, write_message,
};
use crate::{CacheError, EventType, InvalidationEvent, Region, config::TransportSettings};

const COMPONENT: &str = "RelayLeaf";

/// Client-side participant of a relay
pub struct RelayLeaf {
    identifier: String,
    topic: String,
    subscription_addr: String,
    submission_addr: String,
    options: WorkerOptions,
    queue: OutboundQueue<RelayMessage>,
    lifecycle: Lifecycle,
}

impl RelayLeaf {
    /// Requires `subscriptionUri` and `submissionUri`; `topic` defaults to
    /// [`DEFAULT_TOPIC`].
    pub fn new(settings: &TransportSettings, events: TransportEvents) -> Result<Self, CacheError> {
        let subscription_addr =
            socket_addr(COMPONENT, settings.require(COMPONENT, "subscriptionUri")?)?;
        let submission_addr = socket_addr(COMPONENT, settings.require(COMPONENT, "submissionUri")?)?;
        let options = WorkerOptions::from_settings(COMPONENT, settings)?;
        let identifier = format!("{}-{}", COMPONENT, uuid::Uuid::new_v4());

        Ok(Self {
            topic: settings.get_or("topic", DEFAULT_TOPIC).to_owned(),
            subscription_addr,
            submission_addr,
            queue: OutboundQueue::new(options.queue_capacity),
            lifecycle: Lifecycle::new(&identifier, events, options.join_timeout),
            options,
            identifier,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Transport for RelayLeaf {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    async fn connect(&self) {
        self.lifecycle
            .connect(|mut session| async move {
                info!(
                    "{}: connecting to relay (subscribe {}, submit {}, topic \"{}\")",
                    self.identifier, self.subscription_addr, self.submission_addr, self.topic
                );
                let subscriber = dial(&self.subscription_addr).await?;
                let (subscriber, _) = subscriber.into_split();
                let (_, pusher) = dial(&self.submission_addr).await?.into_split();

                let handle = session.handle();
                session.spawn(run_sender(
                    handle.clone(),
                    self.queue.receiver(),
                    Some(pusher),
                    self.submission_addr.clone(),
                    self.options.poll_interval,
                ));
                session.spawn(run_receiver(
                    handle,
                    subscriber,
                    self.topic.clone(),
                    self.options.poll_interval,
                ));
                Ok(session)
            })
            .await;
    }

    async fn disconnect(&self) {
        self.lifecycle.disconnect().await;
    }

    fn broadcast(&self, region: Region, key: &str, event_type: EventType) {
        for payload in encode_events(&self.identifier, region, key, event_type) {
            debug!("{}: queueing {}", self.identifier, payload);
            self.queue.push(
                &self.identifier,
                RelayMessage::new(&self.topic, &self.identifier, payload),
            );
        }
    }
}

async fn dial(addr: &str) -> Result<TcpStream, CacheError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Drain the outbound queue into the submission socket. Write failures and
/// writes that stall past `poll_interval` are logged, and the socket is dialed
/// again for the next message.
async fn run_sender(
    session: SessionHandle,
    queue: Arc<AsyncMutex<mpsc::Receiver<RelayMessage>>>,
    mut pusher: Option<OwnedWriteHalf>,
    submission_addr: String,
    poll_interval: Duration,
) {
    let mut queue = queue.lock().await;
    while !session.is_stopped() {
        let message = match timeout(poll_interval, queue.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => continue,
        };

        if pusher.is_none() {
            match dial(&submission_addr).await {
                Ok(stream) => pusher = Some(stream.into_split().1),
                Err(e) => {
                    warn!(
                        "{}: cannot reach relay at {}; dropping message: {}",
                        session.component(),
                        submission_addr,
                        e
                    );
                    continue;
                }
            }
        }
        if let Some(stream) = pusher.as_mut() {
            match timeout(poll_interval, write_message(stream, &message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("{}: failed to send message to relay: {}", session.component(), e);
                    pusher = None;
                }
                Err(_) => {
                    warn!(
                        "{}: relay at {} is not accepting messages; reconnecting",
                        session.component(),
                        submission_addr
                    );
                    pusher = None;
                }
            }
        }
    }
    debug!("{}: sender stopped", session.component());
}

/// Read relayed messages, raising a cache event for each one on `topic`.
async fn run_receiver(
    session: SessionHandle,
    subscriber: OwnedReadHalf,
    topic: String,
    poll_interval: Duration,
) {
    let mut reader = MessageReader::new(subscriber);
    while !session.is_stopped() {
        match timeout(poll_interval, reader.read_message()).await {
            Ok(Ok(Some(message))) => {
                if !message.topic.eq_ignore_ascii_case(&topic) {
                    continue;
                }
                debug!(
                    "{}: received message from {}",
                    session.component(),
                    message.origin
                );
                if let Some(event) = InvalidationEvent::decode(&message.payload) {
                    session.emit(TransportEvent::Cache(event));
                }
            }
            Ok(Ok(None)) => {
                session.fault("relay closed the subscription");
                break;
            }
            Ok(Err(e)) => {
                session.fault(format!("subscription failed: {}", e));
                break;
            }
            Err(_) => {}
        }
    }
    debug!("{}: receiver stopped", session.component());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn settings(sub: &str, push: &str) -> TransportSettings {
        TransportSettings::new()
            .with("subscriptionUri", sub)
            .with("submissionUri", push)
            .with("pollIntervalMs", "50")
            .with("joinTimeoutMs", "1000")
    }

    #[test]
    fn requires_both_endpoints() {
        let missing = TransportSettings::new().with("submissionUri", "tcp://localhost:1");
        assert!(matches!(
            RelayLeaf::new(&missing, TransportEvents::detached()),
            Err(CacheError::Configuration(msg)) if msg.contains("subscriptionUri")
        ));

        let leaf = RelayLeaf::new(
            &settings("tcp://localhost:5556", "tcp://localhost:5557"),
            TransportEvents::detached(),
        )
        .unwrap();
        assert_eq!(leaf.topic(), DEFAULT_TOPIC);
        assert!(leaf.identifier().starts_with("RelayLeaf-"));
        assert_eq!(leaf.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn unreachable_relay_reports_disconnected() {
        // Bind and drop to get a port nothing listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let uri = format!("tcp://127.0.0.1:{}", port);
        let (events, mut rx) = TransportEvents::channel();
        let leaf = RelayLeaf::new(&settings(&uri, &uri), events).unwrap();

        leaf.connect().await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected));
        assert_eq!(leaf.state(), TransportState::Disconnected);
        leaf.disconnect().await;
    }

    #[tokio::test]
    async fn filters_topic_and_pushes_queued_messages() {
        let publisher = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let collector = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events, mut rx) = TransportEvents::channel();
        let leaf = RelayLeaf::new(
            &settings(
                &format!("tcp://{}", publisher.local_addr().unwrap()),
                &format!("tcp://{}", collector.local_addr().unwrap()),
            ),
            events,
        )
        .unwrap();

        // Queued before connect, sent once the session starts.
        leaf.broadcast(Region::ITEM_META, "1:2", EventType::Invalidate);
        leaf.connect().await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));

        let (mut sub_stream, _) = publisher.accept().await.unwrap();
        let (push_stream, _) = collector.accept().await.unwrap();
        let mut pushed = MessageReader::new(push_stream);
        let message = pushed.read_message().await.unwrap().unwrap();
        assert_eq!(message.topic, DEFAULT_TOPIC);
        assert_eq!(message.origin, leaf.identifier());

        let foreign = RelayMessage::new("OtherChannel", "x", message.payload.clone());
        write_message(&mut sub_stream, &foreign).await.unwrap();
        let ours = RelayMessage::new("tridioncachechannel", "x", message.payload.clone());
        write_message(&mut sub_stream, &ours).await.unwrap();

        let expected = InvalidationEvent::new(
            "/com.tridion.storage.ItemMeta",
            "1:2",
            EventType::Invalidate,
        );
        assert_eq!(rx.recv().await, Some(TransportEvent::Cache(expected)));

        drop(sub_stream);
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected));
        leaf.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_relay_does_not_block_disconnect() {
        let publisher = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let collector = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events, mut rx) = TransportEvents::channel();
        let leaf = RelayLeaf::new(
            &settings(
                &format!("tcp://{}", publisher.local_addr().unwrap()),
                &format!("tcp://{}", collector.local_addr().unwrap()),
            ),
            events,
        )
        .unwrap();
        leaf.connect().await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        let (_sub_stream, _) = publisher.accept().await.unwrap();
        // Accepted but never read.
        let (_push_stream, _) = collector.accept().await.unwrap();

        let big_key = "k".repeat(500_000);
        for i in 0..50 {
            leaf.broadcast(Region::ITEM_META, &format!("{}{}", big_key, i), EventType::Invalidate);
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = std::time::Instant::now();
        leaf.disconnect().await;
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(leaf.state(), TransportState::Disconnected);
    }
}

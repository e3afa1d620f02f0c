//! Broker topic transport over Redis pub/sub
//!
//! Every participant publishes encoded events to one channel and subscribes
//! to it on a dedicated pub/sub connection, so the publisher hears its own
//! events like everyone else.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    time::timeout,
};
use tracing::{debug, info, warn};

use super::{
    Lifecycle, OutboundQueue, SessionHandle, Transport, TransportEvent, TransportEvents,
    TransportState, WorkerOptions, encode_events,
};
use crate::{CacheError, EventType, InvalidationEvent, Region, config::TransportSettings};

const COMPONENT: &str = "RedisTopic";

pub struct RedisTopic {
    identifier: String,
    topic: String,
    client: redis::Client,
    options: WorkerOptions,
    queue: OutboundQueue<String>,
    lifecycle: Lifecycle,
}

impl RedisTopic {
    /// Requires `brokerUrl` and `topic`. Optional `username` and `password`
    /// are added to the URL.
    pub fn new(settings: &TransportSettings, events: TransportEvents) -> Result<Self, CacheError> {
        let broker_url = settings.require(COMPONENT, "brokerUrl")?;
        let topic = settings.require(COMPONENT, "topic")?.to_owned();
        let url = with_credentials(broker_url, settings.get("username"), settings.get("password"));
        let client = redis::Client::open(url.as_str())
            .map_err(|e| CacheError::configuration(COMPONENT, format!("invalid brokerUrl: {}", e)))?;
        let options = WorkerOptions::from_settings(COMPONENT, settings)?;
        let identifier = format!("{}-{}", COMPONENT, uuid::Uuid::new_v4());

        Ok(Self {
            topic,
            client,
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

/// Insert `username`/`password` as URL user info, replacing any already present.
fn with_credentials(url: &str, username: Option<&str>, password: Option<&str>) -> String {
    if username.is_none() && password.is_none() {
        return url.to_owned();
    }
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_owned();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let rest = match rest[..authority_end].rfind('@') {
        Some(at) => &rest[at + 1..],
        None => rest,
    };
    let user_info = match password {
        Some(password) => format!("{}:{}", username.unwrap_or_default(), password),
        None => username.unwrap_or_default().to_owned(),
    };
    format!("{}://{}@{}", scheme, user_info, rest)
}

#[async_trait]
impl Transport for RedisTopic {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    async fn connect(&self) {
        self.lifecycle
            .connect(|mut session| async move {
                let publisher = redis::aio::ConnectionManager::new(self.client.clone()).await?;
                let mut pubsub = self.client.get_async_pubsub().await?;
                pubsub.subscribe(&self.topic).await?;
                info!("{}: subscribed to channel {}", self.identifier, self.topic);

                let handle = session.handle();
                session.spawn(run_sender(
                    handle.clone(),
                    self.queue.receiver(),
                    publisher,
                    self.topic.clone(),
                    self.options.poll_interval,
                ));
                session.spawn(run_receiver(handle, pubsub, self.options.poll_interval));
                Ok(session)
            })
            .await;
    }

    async fn disconnect(&self) {
        self.lifecycle.disconnect().await;
    }

    fn broadcast(&self, region: Region, key: &str, event_type: EventType) {
        for payload in encode_events(&self.identifier, region, key, event_type) {
            self.queue.push(&self.identifier, payload);
        }
    }
}

async fn run_sender(
    session: SessionHandle,
    queue: Arc<AsyncMutex<mpsc::Receiver<String>>>,
    mut publisher: redis::aio::ConnectionManager,
    topic: String,
    poll_interval: Duration,
) {
    let mut queue = queue.lock().await;
    while !session.is_stopped() {
        let payload = match timeout(poll_interval, queue.recv()).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(_) => continue,
        };
        match publisher.publish::<_, _, ()>(&topic, &payload).await {
            Ok(()) => debug!("{}: published on {}: {}", session.component(), topic, payload),
            Err(e) => warn!(
                "{}: PUBLISH on channel {} failed: {}. Continuing.",
                session.component(),
                topic,
                e
            ),
        }
    }
}

async fn run_receiver(session: SessionHandle, pubsub: redis::aio::PubSub, poll_interval: Duration) {
    let messages = pubsub.into_on_message();
    tokio::pin!(messages);
    while !session.is_stopped() {
        match timeout(poll_interval, messages.next()).await {
            Ok(Some(message)) => match message.get_payload::<String>() {
                Ok(payload) => {
                    if let Some(event) = InvalidationEvent::decode(&payload) {
                        session.emit(TransportEvent::Cache(event));
                    }
                }
                Err(e) => warn!(
                    "{}: failed to decode pub/sub payload: {}",
                    session.component(),
                    e
                ),
            },
            Ok(None) => {
                session.fault("pub/sub connection closed");
                break;
            }
            Err(_) => {}
        }
    }
}

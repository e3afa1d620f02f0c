//! In-process push channel
//!
//! Participants attached to the same [`InProcessBus`] receive every event
//! broadcast on it, their own included. Events travel as values, so nothing
//! is encoded.

use async_trait::async_trait;
use std::{sync::OnceLock, time::Duration};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::timeout,
};
use tracing::{debug, warn};

use super::{
    Lifecycle, SessionHandle, Transport, TransportEvent, TransportEvents, TransportState,
    WorkerOptions,
};
use crate::{CacheError, EventType, InvalidationEvent, Region, config::TransportSettings};

const COMPONENT: &str = "InProcess";
const BUS_CAPACITY: usize = 1024;

/// Shared fan-out channel for [`InProcessTransport`]s
#[derive(Debug, Clone)]
pub struct InProcessBus {
    tx: broadcast::Sender<InvalidationEvent>,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// The process-wide bus used by configured in-process transports.
    pub fn global() -> Self {
        static BUS: OnceLock<InProcessBus> = OnceLock::new();
        BUS.get_or_init(|| InProcessBus::new(BUS_CAPACITY)).clone()
    }

    /// Number of connected participants
    pub fn participants(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, event: InvalidationEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("{}: no participants connected, dropping {}", COMPONENT, e.0);
        }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

pub struct InProcessTransport {
    identifier: String,
    bus: InProcessBus,
    poll_interval: Duration,
    lifecycle: Lifecycle,
}

impl InProcessTransport {
    pub fn new(
        bus: InProcessBus,
        settings: &TransportSettings,
        events: TransportEvents,
    ) -> Result<Self, CacheError> {
        let options = WorkerOptions::from_settings(COMPONENT, settings)?;
        let identifier = format!("{}-{}", COMPONENT, uuid::Uuid::new_v4());
        Ok(Self {
            lifecycle: Lifecycle::new(&identifier, events, options.join_timeout),
            identifier,
            bus,
            poll_interval: options.poll_interval,
        })
    }

    pub fn bus(&self) -> &InProcessBus {
        &self.bus
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    async fn connect(&self) {
        self.lifecycle
            .connect(|mut session| async move {
                let rx = self.bus.tx.subscribe();
                session.spawn(run_receiver(session.handle(), rx, self.poll_interval));
                Ok(session)
            })
            .await;
    }

    async fn disconnect(&self) {
        self.lifecycle.disconnect().await;
    }

    fn broadcast(&self, region: Region, key: &str, event_type: EventType) {
        for event in InvalidationEvent::for_region(region, key, event_type) {
            self.bus.publish(event);
        }
    }
}

async fn run_receiver(
    session: SessionHandle,
    mut rx: broadcast::Receiver<InvalidationEvent>,
    poll_interval: Duration,
) {
    while !session.is_stopped() {
        match timeout(poll_interval, rx.recv()).await {
            Ok(Ok(event)) => session.emit(TransportEvent::Cache(event)),
            Ok(Err(RecvError::Lagged(missed))) => {
                warn!("{}: missed {} events", session.component(), missed);
            }
            Ok(Err(RecvError::Closed)) => {
                session.fault("bus closed");
                break;
            }
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn participant(
        bus: &InProcessBus,
    ) -> (Arc<InProcessTransport>, UnboundedReceiver<TransportEvent>) {
        let (events, mut rx) = TransportEvents::channel();
        let settings = TransportSettings::new().with("pollIntervalMs", "20");
        let transport = Arc::new(InProcessTransport::new(bus.clone(), &settings, events).unwrap());
        transport.connect().await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        (transport, rx)
    }

    #[tokio::test]
    async fn every_participant_receives_including_sender() {
        let bus = InProcessBus::new(16);
        let (a, mut a_rx) = participant(&bus).await;
        let (_b, mut b_rx) = participant(&bus).await;
        assert_eq!(bus.participants(), 2);

        a.broadcast(Region::ITEM_META | Region::PAGE_META, "5:6", EventType::Invalidate);

        for rx in [&mut a_rx, &mut b_rx] {
            let mut paths = Vec::new();
            for _ in 0..2 {
                match rx.recv().await {
                    Some(TransportEvent::Cache(event)) => paths.push(event.region()),
                    other => panic!("unexpected event {:?}", other),
                }
            }
            assert_eq!(paths, vec![Region::ITEM_META, Region::PAGE_META]);
        }
    }

    #[tokio::test]
    async fn disconnected_participant_stops_receiving() {
        let bus = InProcessBus::new(16);
        let (a, _a_rx) = participant(&bus).await;
        let (b, mut b_rx) = participant(&bus).await;

        b.disconnect().await;
        assert_eq!(b.state(), TransportState::Disconnected);
        a.broadcast(Region::ITEM_META, "1", EventType::Flush);
        assert!(b_rx.try_recv().is_err());
        assert_eq!(bus.participants(), 1);
    }

    #[tokio::test]
    async fn broadcast_without_participants_is_harmless() {
        let bus = InProcessBus::new(4);
        let transport =
            InProcessTransport::new(bus, &TransportSettings::new(), TransportEvents::detached())
                .unwrap();
        transport.broadcast(Region::ITEM_META, "1", EventType::Flush);
        assert_eq!(transport.bus().participants(), 0);
    }
}

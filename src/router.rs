//! Invalidation router
//!
//! Consumes the active transport's events: cache events drive the
//! dependency graph, and a failed session is reconnected after a delay.

use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    dependency::DependencyGraph,
    transport::{Transport, TransportEvent},
};

pub struct InvalidationRouter {
    graph: Arc<DependencyGraph>,
    transport: Arc<dyn Transport>,
    reconnect_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl InvalidationRouter {
    pub fn new(
        graph: Arc<DependencyGraph>,
        transport: Arc<dyn Transport>,
        reconnect_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            graph,
            transport,
            reconnect_delay,
            shutdown,
        }
    }

    pub fn spawn(self, events: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    /// Process events until shutdown is signalled or every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = self.shutdown.changed() => None,
            };
            match event {
                Some(event) => self.handle(event).await,
                None => break,
            }
            if self.is_shutting_down() {
                break;
            }
        }
        debug!("Invalidation router stopped");
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!("Cache transport {} connected", self.transport.identifier());
            }
            TransportEvent::Disconnected => {
                warn!(
                    "Cache transport {} disconnected; reconnecting in {:?}",
                    self.transport.identifier(),
                    self.reconnect_delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.reconnect_delay) => {}
                    _ = self.shutdown.changed() => return,
                }
                if !self.is_shutting_down() {
                    self.transport.connect().await;
                }
            }
            TransportEvent::Cache(event) => {
                let triggered = self.graph.apply(&event);
                debug!("Cache event {} triggered {} dependencies", event, triggered);
            }
        }
    }
}

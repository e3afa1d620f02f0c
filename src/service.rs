//! Cache service
//!
//! Owns one transport, the dependency graph, the local cache and the router
//! task that connects them.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    CacheConfig, CacheError, EventType, Expiry, Region,
    config::ServiceConfig,
    dependency::DependencyGraph,
    local_cache::LocalCache,
    router::InvalidationRouter,
    transport::{self, Transport, TransportEvents},
};

pub struct CacheService<V> {
    transport: Arc<dyn Transport>,
    cache: LocalCache<V>,
    shutdown_tx: watch::Sender<bool>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Send + Sync + 'static> CacheService<V> {
    /// Build the configured transport, connect it and start routing its events.
    pub async fn start(config: &ServiceConfig) -> Result<Self, CacheError> {
        let transport_config = config.transport.clone();
        Self::with_transport(config.cache_config()?, move |events| {
            transport::from_config(&transport_config, events)
        })
        .await
    }

    /// Like [`CacheService::start`] with a caller-supplied transport factory.
    pub async fn with_transport<F>(config: CacheConfig, build: F) -> Result<Self, CacheError>
    where
        F: FnOnce(TransportEvents) -> Result<Arc<dyn Transport>, CacheError>,
    {
        config.expiry.validate()?;
        let (events, rx) = TransportEvents::channel();
        let transport = build(events)?;

        let mut config = config;
        if !transport.allows_caching() {
            info!(
                "Cache transport {} cannot invalidate; caching is disabled",
                transport.identifier()
            );
            config.expiry = Expiry::Disabled;
        }

        let graph = Arc::new(DependencyGraph::new());
        let cache = LocalCache::new(&config, Arc::clone(&graph))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = InvalidationRouter::new(
            graph,
            Arc::clone(&transport),
            config.reconnect_delay,
            shutdown_rx,
        )
        .spawn(rx);

        transport.connect().await;
        Ok(Self {
            transport,
            cache,
            shutdown_tx,
            router: Mutex::new(Some(router)),
        })
    }

    pub fn cache(&self) -> &LocalCache<V> {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Announce an upstream change to every instance on the bus.
    pub fn broadcast_event(&self, region: Region, key: &str, event_type: EventType) {
        info!(
            "Broadcasting {} for region {} key \"{}\"",
            event_type, region, key
        );
        self.transport.broadcast(region, key, event_type);
    }

    /// Stop the router and disconnect the transport.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let router = self.router.lock().take();
        if let Some(router) = router
            && let Err(e) = router.await
            && e.is_panic()
        {
            warn!("Invalidation router panicked: {}", e);
        }
        self.transport.disconnect().await;
        info!("Cache service stopped");
    }
}

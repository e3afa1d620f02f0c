//! Local in-process cache
//!
//! A moka-backed key/value store with a fixed expiration. Entries populated
//! under a known region are tied to a [`Dependency`] in the shared
//! [`DependencyGraph`] so an invalidation event can evict them before they
//! expire. Concurrent misses on the same key share a single populate call.

use moka::{notification::RemovalCause, ops::compute::Op, sync::Cache};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::{
    CacheConfig, CacheError, EventType, Expiry, Region,
    dependency::{Dependency, DependencyGraph},
};

/// Error type accepted from populate functions
pub type PopulateError = Box<dyn std::error::Error + Send + Sync>;

/// One stored value with its absolute expiry and optional dependency
pub struct CacheRecord<V> {
    value: Arc<V>,
    expires_at: Instant,
    dependency: Option<Arc<Dependency>>,
    id: u64,
}

impl<V> CacheRecord<V> {
    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    pub fn dependency(&self) -> Option<&Arc<Dependency>> {
        self.dependency.as_ref()
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type FetchOutcome<V> = Option<Result<Option<Arc<V>>, String>>;
type InFlightMap<V> = Arc<Mutex<HashMap<String, watch::Receiver<FetchOutcome<V>>>>>;

/// Removes the in-flight entry when dropped and wakes waiters with an error
/// if the populate call never completed.
struct InFlightGuard<V> {
    key: String,
    in_flight: InFlightMap<V>,
    tx: Option<watch::Sender<FetchOutcome<V>>>,
}

impl<V> InFlightGuard<V> {
    fn new(key: String, in_flight: InFlightMap<V>, tx: watch::Sender<FetchOutcome<V>>) -> Self {
        Self {
            key,
            in_flight,
            tx: Some(tx),
        }
    }

    fn complete(mut self, result: Result<Option<Arc<V>>, String>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err("Populate was cancelled or panicked".to_owned())));
        }
        self.in_flight.lock().remove(&self.key);
    }
}

struct LocalCacheInner<V> {
    store: Cache<String, Arc<CacheRecord<V>>>,
    graph: Arc<DependencyGraph>,
    expiry: Expiry,
    in_flight: InFlightMap<V>,
    next_id: AtomicU64,
}

impl<V: Send + Sync + 'static> LocalCacheInner<V> {
    /// Remove `key` only while it still holds the record `id`.
    fn evict_record(&self, key: &str, id: u64) {
        self.store
            .entry(key.to_owned())
            .and_compute_with(|current| match current {
                Some(entry) if entry.value().id == id => Op::Remove,
                _ => Op::Nop,
            });
    }
}

/// Thread-safe local cache with dependency-driven eviction
pub struct LocalCache<V> {
    inner: Arc<LocalCacheInner<V>>,
}

impl<V> Clone for LocalCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + Sync + 'static> LocalCache<V> {
    /// Build an empty cache. Fails when the expiry is out of range.
    pub fn new(config: &CacheConfig, graph: Arc<DependencyGraph>) -> Result<Self, CacheError> {
        config.expiry.validate()?;
        let mut builder = Cache::builder()
            .max_capacity(config.max_capacity)
            .eviction_listener(
                |_key: Arc<String>, record: Arc<CacheRecord<V>>, _cause: RemovalCause| {
                    if let Some(dependency) = &record.dependency {
                        dependency.unregister(record.id);
                    }
                },
            );
        if let Expiry::After(ttl) = config.expiry
            && ttl > Duration::ZERO
        {
            builder = builder.time_to_live(ttl);
        }

        Ok(Self {
            inner: Arc::new(LocalCacheInner {
                store: builder.build(),
                graph,
                expiry: config.expiry,
                in_flight: Arc::new(Mutex::new(HashMap::new())),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// The graph this cache registers its dependencies with.
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.inner.graph
    }

    pub fn expiry(&self) -> Expiry {
        self.inner.expiry
    }

    /// Return the live value for `key`, populating it on a miss.
    ///
    /// A populated value is stored with the configured expiration. When
    /// `region` is known the record is tied to `(region, dependency_key)`
    /// so a matching invalidation event evicts it; records under
    /// [`Region::UNKNOWN`] only ever expire. `None` from `populate` is
    /// returned but not stored. With caching disabled `populate` runs on
    /// every call.
    pub async fn get<F, Fut, E>(
        &self,
        key: &str,
        region: Region,
        dependency_key: &str,
        populate: F,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
        E: Into<PopulateError>,
    {
        if self.inner.expiry.is_disabled() {
            return match populate().await {
                Ok(value) => Ok(value.map(Arc::new)),
                Err(e) => Err(CacheError::Backend(e.into())),
            };
        }

        if let Some(value) = self.lookup(key) {
            debug!("Cache hit for key: {}", key);
            return Ok(Some(value));
        }
        debug!("Cache miss for key: {}", key);

        let (tx, rx) = watch::channel(None);
        let existing = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(key) {
                Some(existing) => Some(existing.clone()),
                None => {
                    in_flight.insert(key.to_owned(), rx);
                    None
                }
            }
        };
        if let Some(existing) = existing {
            debug!("Waiting for in-flight populate for key: {}", key);
            return wait_for(existing).await;
        }
        let guard = InFlightGuard::new(key.to_owned(), Arc::clone(&self.inner.in_flight), tx);

        let result = match populate().await {
            Ok(Some(value)) => {
                let value = Arc::new(value);
                self.store(key, region, dependency_key, Arc::clone(&value));
                Ok(Some(value))
            }
            Ok(None) => {
                debug!("Nothing to cache for key: {}", key);
                Ok(None)
            }
            Err(e) => {
                let e: PopulateError = e.into();
                error!("Populate failed for key {}: {}", key, e);
                Err(CacheError::Backend(e))
            }
        };

        guard.complete(match &result {
            Ok(v) => Ok(v.clone()),
            Err(e) => Err(e.to_string()),
        });
        result
    }

    fn lookup(&self, key: &str) -> Option<Arc<V>> {
        let record = self.inner.store.get(key)?;
        if record.is_expired(Instant::now()) {
            self.inner.evict_record(key, record.id);
            return None;
        }
        Some(Arc::clone(&record.value))
    }

    fn store(&self, key: &str, region: Region, dependency_key: &str, value: Arc<V>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let ttl = match self.inner.expiry {
            Expiry::After(ttl) => ttl,
            Expiry::Disabled => return,
        };

        let dependency = if region.is_unknown() {
            None
        } else {
            Some(self.inner.graph.get_or_insert(region, dependency_key))
        };

        if let Some(dependency) = &dependency {
            let weak: Weak<LocalCacheInner<V>> = Arc::downgrade(&self.inner);
            let cache_key = key.to_owned();
            dependency.register(
                id,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        debug!("Evicting cache entry {} on dependency change.", cache_key);
                        inner.evict_record(&cache_key, id);
                    }
                }),
            );
        }

        self.inner.store.insert(
            key.to_owned(),
            Arc::new(CacheRecord {
                value,
                expires_at: Instant::now() + ttl,
                dependency: dependency.clone(),
                id,
            }),
        );

        // An event may have fired between registering and inserting.
        if let Some(dependency) = dependency
            && !dependency.is_registered(id)
        {
            self.inner.evict_record(key, id);
        }
    }

    /// Whether a live (non-expired) value is stored for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .store
            .get(key)
            .is_some_and(|record| !record.is_expired(Instant::now()))
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.store.invalidate(key);
    }

    pub fn invalidate_all(&self) {
        self.inner.store.invalidate_all();
    }

    /// Number of stored entries after pending maintenance has run.
    pub fn entry_count(&self) -> u64 {
        self.inner.store.run_pending_tasks();
        self.inner.store.entry_count()
    }

    /// Apply an invalidation instruction to this cache's dependency graph.
    pub fn on_event(&self, region: Region, key: &str, event_type: EventType) -> usize {
        self.inner.graph.on_event(region, key, event_type)
    }
}

async fn wait_for<V>(
    mut rx: watch::Receiver<FetchOutcome<V>>,
) -> Result<Option<Arc<V>>, CacheError> {
    loop {
        let current = rx.borrow().clone();
        if let Some(result) = current {
            return result.map_err(|e| CacheError::Backend(e.into()));
        }
        if rx.changed().await.is_err() {
            return Err(CacheError::Backend("In-flight populate was cancelled".into()));
        }
    }
}

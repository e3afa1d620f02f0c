//! Dependency graph
//!
//! Maps `(region, key)` identities to [`Dependency`] entries. Cached records
//! register an eviction callback against the entry they were populated under;
//! an invalidation event triggers every matching entry, which fires (and
//! drains) those callbacks. Entries themselves are never removed so later
//! populations reattach to the same entry.

use std::{collections::HashMap, fmt, sync::Arc};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{EventType, InvalidationEvent, Region};

/// Callback fired once when the dependency it is registered with triggers
pub type EvictionCallback = Box<dyn FnOnce() + Send + 'static>;

/// One `(region, key)` identity that cached records can depend on
pub struct Dependency {
    region: Region,
    key: String,
    registrations: Mutex<HashMap<u64, EvictionCallback>>,
}

impl Dependency {
    fn new(region: Region, key: String) -> Self {
        Self {
            region,
            key,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attach an eviction callback under `id`, replacing any previous one with the same id.
    pub fn register(&self, id: u64, callback: EvictionCallback) {
        self.registrations.lock().insert(id, callback);
    }

    /// Detach the callback for `id`. Returns whether it was still registered.
    pub fn unregister(&self, id: u64) -> bool {
        self.registrations.lock().remove(&id).is_some()
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.registrations.lock().contains_key(&id)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Whether an event for `region`/`key` applies to this entry.
    ///
    /// Regions match on any shared bit. A flush matches every entry of the
    /// region; an invalidate matches entries whose key starts with the event
    /// key, ignoring ASCII case, so `"233"` reaches `"233:685281"`.
    pub fn matches(&self, region: Region, key: &str, event_type: EventType) -> bool {
        if !self.region.intersects(region) {
            return false;
        }
        match event_type {
            EventType::Flush => true,
            EventType::Invalidate => starts_with_ignore_ascii_case(&self.key, key),
        }
    }

    /// Fire and drain every registered callback. Returns how many fired.
    pub fn trigger(&self) -> usize {
        info!(
            "Triggering cache dependency for region \"{}\", key \"{}\".",
            self.region, self.key
        );
        // Callbacks run outside the lock; they may call back into unregister.
        let callbacks: Vec<EvictionCallback> = {
            let mut registrations = self.registrations.lock();
            registrations.drain().map(|(_, cb)| cb).collect()
        };
        let fired = callbacks.len();
        for callback in callbacks {
            callback();
        }
        fired
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("region", &self.region)
            .field("key", &self.key)
            .field("registrations", &self.registration_count())
            .finish()
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.region, self.key)
    }
}

fn starts_with_ignore_ascii_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.is_char_boundary(prefix.len())
        && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Concurrent, append-only arena of dependencies keyed by `(region, key)`
#[derive(Default)]
pub struct DependencyGraph {
    entries: DashMap<(Region, String), Arc<Dependency>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the dependency for `(region, key)`, creating it on first use.
    pub fn get_or_insert(&self, region: Region, key: &str) -> Arc<Dependency> {
        if let Some(existing) = self.entries.get(&(region, key.to_owned())) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .entries
            .entry((region, key.to_owned()))
            .or_insert_with(|| Arc::new(Dependency::new(region, key.to_owned())));
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply an invalidation instruction. Returns the number of dependencies triggered.
    pub fn on_event(&self, region: Region, key: &str, event_type: EventType) -> usize {
        debug!(
            "Processing cache event: region \"{}\", key \"{}\", type \"{}\".",
            region, key, event_type
        );
        if region.is_unknown() {
            debug!("Cache event for unknown region ignored (key \"{}\").", key);
            return 0;
        }

        // Snapshot matches first so no shard lock is held while callbacks run.
        let matched: Vec<Arc<Dependency>> = self
            .entries
            .iter()
            .filter(|entry| entry.value().matches(region, key, event_type))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for dependency in &matched {
            debug!("\tDependency: {}", dependency);
            dependency.trigger();
        }
        matched.len()
    }

    /// Apply a decoded invalidation event.
    pub fn apply(&self, event: &InvalidationEvent) -> usize {
        self.on_event(event.region(), event.key(), event.event_type())
    }
}

impl fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("entries", &self.entries.len())
            .finish()
    }
}

//! cdcache - Distributed cache invalidation for content delivery
//!
//! This library keeps expensive content lookups in a local cache and evicts
//! them when the content store changes:
//! - Regions classify cached content as a bitmask
//! - Cached entries depend on a `(region, key)` identity in a shared graph
//! - Invalidation events (region-wide flush or key-prefix invalidate) travel
//!   between service instances over a pluggable transport
//!
//! Transports:
//! - In-process push channel
//! - TCP relay broker and its leaf clients
//! - Redis pub/sub topic

pub mod config;
pub mod content;
pub mod dependency;
mod error;
mod event;
mod item_uri;
pub mod local_cache;
mod region;
pub mod router;
pub mod service;
pub mod transport;

pub use config::{CacheConfig, Expiry, ServiceConfig};
pub use content::{ContentCache, ContentKind, ContentResolver};
pub use dependency::{Dependency, DependencyGraph};
pub use error::CacheError;
pub use event::{EventType, InvalidationEvent};
pub use item_uri::{InvalidItemUri, ItemUri};
pub use local_cache::LocalCache;
pub use region::{Region, known_regions};
pub use router::InvalidationRouter;
pub use service::CacheService;
pub use transport::{Transport, TransportEvent, TransportEvents, TransportState};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

//! Cache module - real-time aware caching of domain records.
//!
//! ## Architecture
//!
//! - `CacheManager` - TTL cache with priority+recency eviction, background
//!   prefetch and tag-driven invalidation
//! - `BoundedStore` - capacity-limited map underneath the manager
//! - `TagExtractor` - pluggable key → tags policy
//! - `InflightSet` - Moka-backed markers for running prefetches
//!
//! ## Usage
//!
//! ```rust,ignore
//! let cache: CacheManager<Property> = CacheManager::builder()
//!     .event_bus(bus.clone())
//!     .build();
//! cache.init();
//!
//! let property = cache
//!     .get_or_fetch("property:42", move || load_property(42), None)
//!     .await;
//!
//! // A `property_updated` event on the bus now invalidates the entry.
//! cache.shutdown().await;
//! ```

mod config;
mod entry;
mod inflight;
mod manager;
mod metrics;
mod store;
mod tags;

pub use config::{CacheConfig, Priority};
pub use entry::CacheEntry;
pub use inflight::InflightSet;
pub use manager::{
    CacheAction, CacheBroadcast, CacheManager, CacheManagerBuilder, DEFAULT_SIZE_ESTIMATE, FREQUENT_ACCESS_THRESHOLD,
    Invalidation, estimate_size,
};
pub use metrics::CacheStats;
pub use store::BoundedStore;
pub use tags::{DEFAULT_DOMAIN_NOUNS, DomainTagExtractor, TagExtractor, TagIndex};

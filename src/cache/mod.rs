//! Query Result Cache
//!
//! Caches the results of database queries in two tiers:
//!
//! - **Local tier**: in-process LRU map bounded by entry count and bytes
//! - **Remote tier**: shared key-value store (Redis) that owns expiry
//!
//! Entries are keyed by a fingerprint of the normalized query text and its
//! parameters, and tagged with the tables they read so that a write to a
//! table invalidates every dependent result.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! default_ttl_secs = 300
//! max_entries = 10000
//! invalidation_strategy = "batched"
//! # ... see config.rs for all options
//! ```

mod config;
mod engine;
mod entry;
mod events;
mod eviction;
pub mod fingerprint;
mod invalidation;
mod lock;
mod notify;
mod registry;
mod remote;
mod stats;
mod store;
pub mod tables;
mod warming;

pub use config::{CacheConfig, DEFAULT_KEY_PREFIX, InvalidationStrategy, MAX_TTL_SECS};
pub use engine::{QueryCache, SetOptions};
pub use entry::{CacheEntry, EntryParts};
pub use events::{CacheEvent, Epoch, EventBus, EventKind, Tier};
pub use eviction::{CleanupReport, EvictionManager};
pub use invalidation::InvalidationCoordinator;
pub use notify::{TableChange, TableOperation};
pub use registry::CacheRegistry;
pub use remote::{MemoryTier, RemoteError, RemoteTier};
pub use stats::{CacheStatistics, StatisticsSnapshot};
pub use store::{Lookup, TieredStore};
pub use warming::{Refresher, WarmReport, WarmingScheduler};

pub(crate) mod metric_names {
    pub(crate) use super::eviction::METRIC_CLEANUP_MS;
    pub(crate) use super::invalidation::METRIC_INVALIDATION_FLUSH_MS;
    pub(crate) use super::stats::{
        METRIC_DELETE_TOTAL, METRIC_EVICT_TOTAL, METRIC_HIT_TOTAL, METRIC_LOCAL_BYTES,
        METRIC_MISS_TOTAL, METRIC_SET_TOTAL,
    };
    pub(crate) use super::warming::METRIC_WARM_MS;
}

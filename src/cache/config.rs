//! Engine configuration.
//!
//! Loaded from the `[cache]` table of `querycache.toml` (see `crate::config`)
//! or built directly by embedding applications.

use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use time::Duration;

const DEFAULT_TTL_SECS: i64 = 300;
const DEFAULT_MAX_MEMORY_SIZE: usize = 100 * 1024 * 1024;
const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_WARMING_THRESHOLD: u64 = 10;
const DEFAULT_WARMING_INTERVAL_MS: u64 = 30_000;
const DEFAULT_WARMING_BATCH_SIZE: usize = 20;
const DEFAULT_WARMING_CONCURRENCY: usize = 5;
const DEFAULT_INVALIDATION_BATCH_SIZE: usize = 100;
const DEFAULT_INVALIDATION_BATCH_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_EVENT_CAPACITY: usize = 1_024;
pub const DEFAULT_KEY_PREFIX: &str = "query_cache:";
/// Longest TTL an entry can carry (100 years); longer TTLs are clamped.
pub const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// How table-change notifications turn into deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationStrategy {
    /// Delete affected entries as soon as the notification arrives.
    #[default]
    Immediate,
    /// Coalesce notifications and delete in one bulk flush.
    Batched,
    /// Reserved. Currently handled like `Immediate`.
    Lazy,
}

impl InvalidationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Batched => "batched",
            Self::Lazy => "lazy",
        }
    }
}

impl fmt::Display for InvalidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without one, in seconds.
    pub default_ttl_secs: i64,
    /// Byte budget of the local tier.
    pub max_memory_size: usize,
    /// Entry budget of the local tier.
    pub max_entries: usize,
    /// Cleanup loop period (ms).
    pub cleanup_interval_ms: u64,
    /// Emit `metrics` counters, gauges and histograms.
    pub enable_metrics: bool,
    /// Run the warming loop.
    pub warming_enabled: bool,
    /// Access count at which an entry becomes a warming candidate.
    pub warming_threshold: u64,
    /// Warming loop period (ms).
    pub warming_interval_ms: u64,
    /// Maximum entries popped per warming cycle.
    pub warming_batch_size: usize,
    /// Maximum concurrent warms inside one cycle.
    pub warming_concurrency: usize,
    pub invalidation_strategy: InvalidationStrategy,
    /// Pending key count that forces a batched flush.
    pub invalidation_batch_size: usize,
    /// Quiet period after the last notification before a batched flush (ms).
    pub invalidation_batch_timeout_ms: u64,
    /// Namespace prepended to every fingerprint.
    pub key_prefix: String,
    /// Buffered lifecycle events per subscriber.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_TTL_SECS,
            max_memory_size: DEFAULT_MAX_MEMORY_SIZE,
            max_entries: DEFAULT_MAX_ENTRIES,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            enable_metrics: true,
            warming_enabled: true,
            warming_threshold: DEFAULT_WARMING_THRESHOLD,
            warming_interval_ms: DEFAULT_WARMING_INTERVAL_MS,
            warming_batch_size: DEFAULT_WARMING_BATCH_SIZE,
            warming_concurrency: DEFAULT_WARMING_CONCURRENCY,
            invalidation_strategy: InvalidationStrategy::Immediate,
            invalidation_batch_size: DEFAULT_INVALIDATION_BATCH_SIZE,
            invalidation_batch_timeout_ms: DEFAULT_INVALIDATION_BATCH_TIMEOUT_MS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::seconds(self.default_ttl_secs)
    }

    /// Cleanup period, clamped to at least one millisecond.
    pub fn cleanup_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.cleanup_interval_ms.max(1))
    }

    /// Warming period, clamped to at least one millisecond.
    pub fn warming_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.warming_interval_ms.max(1))
    }

    pub fn invalidation_batch_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.invalidation_batch_timeout_ms)
    }

    /// Returns the warming concurrency, clamping to 1 if zero.
    pub fn warming_concurrency_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.warming_concurrency).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the event channel capacity, clamping to 1 if zero.
    pub fn event_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.event_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Strategy actually applied to notifications.
    ///
    /// `Lazy` has no defined behavior yet and degrades to `Immediate`.
    pub fn effective_strategy(&self) -> InvalidationStrategy {
        match self.invalidation_strategy {
            InvalidationStrategy::Lazy => InvalidationStrategy::Immediate,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl_secs, 300);
        assert_eq!(config.max_memory_size, 100 * 1024 * 1024);
        assert_eq!(config.max_entries, 10_000);
        assert_eq!(config.cleanup_interval_ms, 60_000);
        assert!(config.enable_metrics);
        assert!(config.warming_enabled);
        assert_eq!(config.warming_concurrency, 5);
        assert_eq!(config.invalidation_strategy, InvalidationStrategy::Immediate);
        assert_eq!(config.key_prefix, "query_cache:");
    }

    #[test]
    fn lazy_strategy_degrades_to_immediate() {
        let config = CacheConfig {
            invalidation_strategy: InvalidationStrategy::Lazy,
            ..Default::default()
        };
        assert_eq!(config.effective_strategy(), InvalidationStrategy::Immediate);
    }

    #[test]
    fn batched_strategy_is_kept() {
        let config = CacheConfig {
            invalidation_strategy: InvalidationStrategy::Batched,
            ..Default::default()
        };
        assert_eq!(config.effective_strategy(), InvalidationStrategy::Batched);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            warming_concurrency: 0,
            event_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.warming_concurrency_non_zero().get(), 1);
        assert_eq!(config.event_capacity_non_zero().get(), 1);
    }

    #[test]
    fn strategy_deserializes_lowercase() {
        let strategy: InvalidationStrategy =
            serde_json::from_str("\"batched\"").expect("strategy should parse");
        assert_eq!(strategy, InvalidationStrategy::Batched);
    }
}

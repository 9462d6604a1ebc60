//! Aggregate cache counters.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use serde::Serialize;
use time::OffsetDateTime;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::stats";

pub(crate) const METRIC_HIT_TOTAL: &str = "querycache_hit_total";
pub(crate) const METRIC_MISS_TOTAL: &str = "querycache_miss_total";
pub(crate) const METRIC_SET_TOTAL: &str = "querycache_set_total";
pub(crate) const METRIC_DELETE_TOTAL: &str = "querycache_delete_total";
pub(crate) const METRIC_EVICT_TOTAL: &str = "querycache_evict_total";
pub(crate) const METRIC_LOCAL_BYTES: &str = "querycache_local_bytes";

/// Running counters shared by every component of one engine.
///
/// Counters only grow until [`CacheStatistics::reset`] (called by `clear()`).
#[derive(Debug, Default)]
pub struct CacheStatistics {
    metrics_enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    bounds: Mutex<Option<EntryBounds>>,
}

#[derive(Debug, Clone, Copy)]
struct EntryBounds {
    oldest: OffsetDateTime,
    newest: OffsetDateTime,
}

/// Point-in-time copy of the statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    /// Bytes currently held by the local tier.
    pub total_size: usize,
    /// Entries currently held by the local tier.
    pub entries: usize,
    pub hit_ratio: f64,
    pub oldest_entry: Option<OffsetDateTime>,
    pub newest_entry: Option<OffsetDateTime>,
}

impl CacheStatistics {
    pub fn new(metrics_enabled: bool) -> Self {
        Self {
            metrics_enabled,
            ..Self::default()
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if self.metrics_enabled {
            counter!(METRIC_HIT_TOTAL).increment(1);
        }
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if self.metrics_enabled {
            counter!(METRIC_MISS_TOTAL).increment(1);
        }
    }

    /// Count a `set` created at `created_at` and widen the observed bounds.
    pub fn record_set(&self, created_at: OffsetDateTime) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        if self.metrics_enabled {
            counter!(METRIC_SET_TOTAL).increment(1);
        }

        let mut bounds = mutex_lock(&self.bounds, SOURCE, "record_set");
        *bounds = Some(match *bounds {
            Some(current) => EntryBounds {
                oldest: current.oldest.min(created_at),
                newest: current.newest.max(created_at),
            },
            None => EntryBounds {
                oldest: created_at,
                newest: created_at,
            },
        });
    }

    pub fn record_deletes(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.deletes.fetch_add(count, Ordering::Relaxed);
        if self.metrics_enabled {
            counter!(METRIC_DELETE_TOTAL).increment(count);
        }
    }

    pub fn record_evictions(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.evictions.fetch_add(count, Ordering::Relaxed);
        if self.metrics_enabled {
            counter!(METRIC_EVICT_TOTAL).increment(count);
        }
    }

    /// Publish the local tier footprint as a gauge.
    pub fn observe_local_size(&self, bytes: usize) {
        if self.metrics_enabled {
            gauge!(METRIC_LOCAL_BYTES).set(bytes as f64);
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// `hits / (hits + misses)`, or 0 before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        hit_ratio(self.hits(), self.misses())
    }

    pub fn snapshot(&self, total_size: usize, entries: usize) -> StatisticsSnapshot {
        let bounds = *mutex_lock(&self.bounds, SOURCE, "snapshot");
        let hits = self.hits();
        let misses = self.misses();

        StatisticsSnapshot {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions(),
            total_size,
            entries,
            hit_ratio: hit_ratio(hits, misses),
            oldest_entry: bounds.map(|b| b.oldest),
            newest_entry: bounds.map(|b| b.newest),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        *mutex_lock(&self.bounds, SOURCE, "reset") = None;
    }
}

fn hit_ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

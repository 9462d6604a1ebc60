//! Periodic cleanup of the local tier.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::registry::CacheRegistry;
use super::store::TieredStore;

pub(crate) const METRIC_CLEANUP_MS: &str = "querycache_cleanup_ms";

/// Outcome of one cleanup cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Local entries dropped because they expired.
    pub expired: usize,
    /// Local entries dropped to get back under budget.
    pub evicted: usize,
    /// Registry keys forgotten because their remote copy has expired.
    pub pruned: usize,
}

pub struct EvictionManager {
    store: Arc<TieredStore>,
    registry: Arc<CacheRegistry>,
    interval: Duration,
    metrics_enabled: bool,
}

impl EvictionManager {
    pub fn new(
        store: Arc<TieredStore>,
        registry: Arc<CacheRegistry>,
        interval: Duration,
        metrics_enabled: bool,
    ) -> Self {
        Self {
            store,
            registry,
            interval,
            metrics_enabled,
        }
    }

    /// Expire, prune, then enforce the local budgets.
    pub fn run_cycle(&self) -> CleanupReport {
        let started_at = Instant::now();
        let now = OffsetDateTime::now_utc();

        let expired = self.store.sweep_expired(now).len();
        let pruned = self.registry.prune_expired(now).len();
        let evicted = self.store.enforce_limits().len();

        let report = CleanupReport {
            expired,
            evicted,
            pruned,
        };

        if expired + evicted + pruned > 0 {
            info!(
                expired,
                evicted,
                pruned,
                entries = self.store.local_len(),
                total_size = self.store.total_size(),
                "Cache cleanup complete"
            );
        } else {
            debug!("Cache cleanup found nothing to remove");
        }

        if self.metrics_enabled {
            histogram!(METRIC_CLEANUP_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        }
        report
    }

    /// Run [`EvictionManager::run_cycle`] every interval until the handle is
    /// aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                self.run_cycle();
            }
        })
    }
}

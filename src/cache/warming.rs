//! Warming of frequently read entries.
//!
//! Entries whose access count reaches the configured threshold are queued by
//! priority. Each cycle takes the hottest keys and either re-executes their
//! query through a [`Refresher`] or, without one, touches the local copy so
//! it stays at the front of the LRU order.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use metrics::histogram;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::events::{EventBus, EventKind};
use super::lock::mutex_lock;
use super::registry::CacheRegistry;
use super::stats::CacheStatistics;
use super::store::TieredStore;

const SOURCE: &str = "cache::warming";

pub(crate) const METRIC_WARM_MS: &str = "querycache_warm_ms";

/// The queue holds at most this many batches worth of keys.
const QUEUE_BATCHES: usize = 16;

/// Re-executes a cached query to obtain fresh data.
#[async_trait]
pub trait Refresher: Send + Sync {
    /// Fresh result for `query` with `params`, or `None` to keep the current
    /// entry as it is.
    async fn refresh(&self, query: &str, params: &[Value]) -> Option<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WarmOutcome {
    Refreshed,
    Touched,
    Missing,
}

/// Outcome of one warming cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmReport {
    /// Keys taken from the queue.
    pub warmed: usize,
    /// Keys whose data was replaced through the refresher.
    pub refreshed: usize,
    /// Keys that no longer existed in either tier.
    pub missing: usize,
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct WarmingScheduler {
    enabled: bool,
    threshold: u64,
    batch_size: usize,
    concurrency: NonZeroUsize,
    interval: Duration,
    metrics_enabled: bool,
    store: Arc<TieredStore>,
    registry: Arc<CacheRegistry>,
    stats: Arc<CacheStatistics>,
    events: Arc<EventBus>,
    refresher: Option<Arc<dyn Refresher>>,
    queue: Mutex<HashMap<String, u64>>,
    running: AtomicBool,
}

impl WarmingScheduler {
    pub fn new(
        config: &CacheConfig,
        store: Arc<TieredStore>,
        registry: Arc<CacheRegistry>,
        stats: Arc<CacheStatistics>,
        events: Arc<EventBus>,
        refresher: Option<Arc<dyn Refresher>>,
    ) -> Self {
        Self {
            enabled: config.warming_enabled,
            threshold: config.warming_threshold,
            batch_size: config.warming_batch_size.max(1),
            concurrency: config.warming_concurrency_non_zero(),
            interval: config.warming_interval(),
            metrics_enabled: config.enable_metrics,
            store,
            registry,
            stats,
            events,
            refresher,
            queue: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    fn lock_queue(&self, op: &'static str) -> MutexGuard<'_, HashMap<String, u64>> {
        mutex_lock(&self.queue, SOURCE, op)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Queue `entry` once its access count reaches the threshold.
    ///
    /// A queued key keeps the highest priority it was offered with. When the
    /// queue is full the coldest key makes room, or the offer is dropped if
    /// nothing queued is colder.
    pub fn consider(&self, entry: &CacheEntry) {
        if !self.enabled || entry.access_count < self.threshold {
            return;
        }

        let mut queue = self.lock_queue("consider");
        if let Some(priority) = queue.get_mut(&entry.key) {
            *priority = (*priority).max(entry.access_count);
            return;
        }

        if queue.len() >= self.capacity() {
            let coldest = queue
                .iter()
                .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
                .map(|(key, priority)| (key.clone(), *priority));
            match coldest {
                Some((key, priority)) if priority < entry.access_count => {
                    queue.remove(&key);
                }
                _ => return,
            }
        }
        queue.insert(entry.key.clone(), entry.access_count);
    }

    /// Drop `keys` from the queue, e.g. after they were deleted.
    pub fn forget(&self, keys: &[String]) {
        let mut queue = self.lock_queue("forget");
        for key in keys {
            queue.remove(key);
        }
    }

    fn capacity(&self) -> usize {
        self.batch_size.saturating_mul(QUEUE_BATCHES)
    }

    pub fn queued(&self) -> usize {
        self.lock_queue("queued").len()
    }

    pub fn priority_of(&self, key: &str) -> Option<u64> {
        self.lock_queue("priority_of").get(key).copied()
    }

    pub fn clear_queue(&self) {
        self.lock_queue("clear_queue").clear();
    }

    /// Warm the hottest queued keys.
    ///
    /// Returns `None` when another cycle is already running.
    pub async fn run_cycle(&self) -> Option<WarmReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Warming cycle skipped: previous cycle still running");
            return None;
        }
        let _guard = CycleGuard(&self.running);

        let batch = self.take_batch();
        if batch.is_empty() {
            return Some(WarmReport::default());
        }

        let started_at = Instant::now();
        let outcomes: Vec<WarmOutcome> = futures::stream::iter(batch)
            .map(|key| self.warm_one(key))
            .buffer_unordered(self.concurrency.get())
            .collect()
            .await;

        let report = WarmReport {
            warmed: outcomes.len(),
            refreshed: count(&outcomes, WarmOutcome::Refreshed),
            missing: count(&outcomes, WarmOutcome::Missing),
        };
        let elapsed = started_at.elapsed();

        info!(
            warmed = report.warmed,
            refreshed = report.refreshed,
            touched = count(&outcomes, WarmOutcome::Touched),
            missing = report.missing,
            elapsed_ms = elapsed.as_millis() as u64,
            "Cache warming cycle complete"
        );

        if self.metrics_enabled {
            histogram!(METRIC_WARM_MS).record(elapsed.as_secs_f64() * 1000.0);
        }
        self.events.publish(EventKind::Warm {
            warmed: report.warmed,
            refreshed: report.refreshed,
            elapsed,
        });

        Some(report)
    }

    /// Run [`WarmingScheduler::run_cycle`] every interval until the handle is
    /// aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                self.run_cycle().await;
            }
        })
    }

    fn take_batch(&self) -> Vec<String> {
        let mut queue = self.lock_queue("take_batch");
        let mut ranked: Vec<(String, u64)> = queue
            .iter()
            .map(|(key, priority)| (key.clone(), *priority))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.batch_size);

        for (key, _) in &ranked {
            queue.remove(key);
        }
        ranked.into_iter().map(|(key, _)| key).collect()
    }

    async fn warm_one(&self, key: String) -> WarmOutcome {
        let now = OffsetDateTime::now_utc();

        let Some(refresher) = &self.refresher else {
            return self.touch(&key, now);
        };

        let current = match self.store.peek_local(&key) {
            Some(entry) => Some(entry),
            None => self.store.fetch_remote(&key).await,
        };
        let Some(current) = current else {
            return WarmOutcome::Missing;
        };

        match refresher.refresh(&current.query, &current.params).await {
            Some(data) => {
                let entry = current.refreshed(data, OffsetDateTime::now_utc());
                self.registry
                    .register(&entry.key, entry.tables.iter(), entry.expires_at);
                self.stats.record_set(entry.created_at);
                self.store.set(entry).await;
                WarmOutcome::Refreshed
            }
            None => {
                warn!(key = %key, "Refresher returned no data; touching entry instead");
                self.touch(&key, now)
            }
        }
    }

    fn touch(&self, key: &str, now: OffsetDateTime) -> WarmOutcome {
        match self.store.touch_local(key, now) {
            Some(_) => WarmOutcome::Touched,
            None => WarmOutcome::Missing,
        }
    }
}

fn count(outcomes: &[WarmOutcome], wanted: WarmOutcome) -> usize {
    outcomes.iter().filter(|outcome| **outcome == wanted).count()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::cache::entry::tests::sample_entry;
    use crate::cache::remote::MemoryTier;

    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Refresher for CountingRefresher {
        async fn refresh(&self, _query: &str, _params: &[Value]) -> Option<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Some(json!({ "refreshed": call }))
        }
    }

    fn build(
        config: CacheConfig,
        refresher: Option<Arc<dyn Refresher>>,
    ) -> (WarmingScheduler, Arc<TieredStore>) {
        let stats = Arc::new(CacheStatistics::new(false));
        let store = Arc::new(TieredStore::new(
            &config,
            Arc::new(MemoryTier::new()),
            stats.clone(),
        ));
        let scheduler = WarmingScheduler::new(
            &config,
            store.clone(),
            Arc::new(CacheRegistry::new()),
            stats,
            Arc::new(EventBus::new(16)),
            refresher,
        );
        (scheduler, store)
    }

    fn hot_entry(key: &str, access_count: u64) -> CacheEntry {
        let mut entry = sample_entry(key, &["users"], 60);
        entry.access_count = access_count;
        entry
    }

    #[test]
    fn threshold_gates_the_queue() {
        let config = CacheConfig {
            warming_threshold: 3,
            ..Default::default()
        };
        let (scheduler, _) = build(config, None);

        scheduler.consider(&hot_entry("cold", 2));
        scheduler.consider(&hot_entry("hot", 3));
        assert_eq!(scheduler.queued(), 1);
        assert_eq!(scheduler.priority_of("hot"), Some(3));

        scheduler.consider(&hot_entry("hot", 7));
        assert_eq!(scheduler.priority_of("hot"), Some(7));
    }

    #[test]
    fn full_queue_keeps_the_hottest_keys() {
        let config = CacheConfig {
            warming_threshold: 1,
            warming_batch_size: 1,
            ..Default::default()
        };
        let (scheduler, _) = build(config, None);

        for index in 0..QUEUE_BATCHES as u64 {
            scheduler.consider(&hot_entry(&format!("k{index}"), index + 2));
        }
        assert_eq!(scheduler.queued(), QUEUE_BATCHES);

        scheduler.consider(&hot_entry("colder", 1));
        assert_eq!(scheduler.priority_of("colder"), None);

        scheduler.consider(&hot_entry("hottest", 1_000));
        assert_eq!(scheduler.queued(), QUEUE_BATCHES);
        assert_eq!(scheduler.priority_of("hottest"), Some(1_000));
        assert_eq!(scheduler.priority_of("k0"), None);
    }

    #[test]
    fn forgotten_keys_leave_the_queue() {
        let config = CacheConfig {
            warming_threshold: 1,
            ..Default::default()
        };
        let (scheduler, _) = build(config, None);
        scheduler.consider(&hot_entry("a", 4));
        scheduler.consider(&hot_entry("b", 4));

        scheduler.forget(&["a".to_string(), "missing".to_string()]);
        assert_eq!(scheduler.priority_of("a"), None);
        assert_eq!(scheduler.queued(), 1);
    }

    #[test]
    fn disabled_scheduler_queues_nothing() {
        let config = CacheConfig {
            warming_enabled: false,
            warming_threshold: 0,
            ..Default::default()
        };
        let (scheduler, _) = build(config, None);
        scheduler.consider(&hot_entry("k", 100));
        assert_eq!(scheduler.queued(), 0);
    }

    #[tokio::test]
    async fn cycle_takes_highest_priority_first() {
        let config = CacheConfig {
            warming_threshold: 1,
            warming_batch_size: 2,
            ..Default::default()
        };
        let (scheduler, _) = build(config, None);
        scheduler.consider(&hot_entry("low", 1));
        scheduler.consider(&hot_entry("mid", 5));
        scheduler.consider(&hot_entry("high", 9));

        let report = scheduler.run_cycle().await.expect("cycle runs");
        assert_eq!(report.warmed, 2);
        assert_eq!(report.missing, 2);
        assert_eq!(scheduler.priority_of("low"), Some(1));
        assert_eq!(scheduler.queued(), 1);
    }

    #[tokio::test]
    async fn touch_fallback_keeps_expiry() {
        let config = CacheConfig {
            warming_threshold: 1,
            ..Default::default()
        };
        let (scheduler, store) = build(config, None);
        let entry = hot_entry("k", 1);
        store.set(entry.clone()).await;
        scheduler.consider(&entry);

        let report = scheduler.run_cycle().await.expect("cycle runs");
        assert_eq!(report.warmed, 1);
        assert_eq!(report.refreshed, 0);

        let touched = store.peek_local("k").expect("entry kept");
        assert_eq!(touched.expires_at, entry.expires_at);
        assert_eq!(touched.access_count, entry.access_count + 1);
    }

    #[tokio::test]
    async fn refresher_replaces_data() {
        let config = CacheConfig {
            warming_threshold: 1,
            ..Default::default()
        };
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        let (scheduler, store) = build(config, Some(refresher.clone() as Arc<dyn Refresher>));
        let entry = hot_entry("k", 4);
        store.set(entry.clone()).await;
        scheduler.consider(&entry);

        let report = scheduler.run_cycle().await.expect("cycle runs");
        assert_eq!(report.refreshed, 1);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        let refreshed = store.peek_local("k").expect("entry kept");
        assert_eq!(refreshed.data, json!({ "refreshed": 0 }));
        assert_eq!(refreshed.access_count, 4);
        assert!(refreshed.expires_at >= entry.expires_at);
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let (scheduler, _) = build(CacheConfig::default(), None);
        assert_eq!(scheduler.run_cycle().await, Some(WarmReport::default()));
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let (scheduler, _) = build(CacheConfig::default(), None);
        scheduler.running.store(true, Ordering::SeqCst);
        assert_eq!(scheduler.run_cycle().await, None);

        scheduler.running.store(false, Ordering::SeqCst);
        assert!(scheduler.run_cycle().await.is_some());
    }
}

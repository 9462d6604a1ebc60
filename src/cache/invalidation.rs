//! Table-driven invalidation.
//!
//! A table change deletes every entry derived from that table, either right
//! away or, under the batched strategy, after a quiet period during which
//! further notifications are coalesced into one bulk deletion.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use metrics::histogram;
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::config::{CacheConfig, InvalidationStrategy};
use super::events::{EventBus, EventKind};
use super::lock::mutex_lock;
use super::registry::CacheRegistry;
use super::stats::CacheStatistics;
use super::store::TieredStore;
use super::warming::WarmingScheduler;

const SOURCE: &str = "cache::invalidation";

pub(crate) const METRIC_INVALIDATION_FLUSH_MS: &str = "querycache_invalidation_flush_ms";

/// Notifications waiting for the next batched flush.
///
/// `generation` moves whenever the scheduled timer is replaced or cancelled;
/// a timer only flushes while its generation is current.
#[derive(Default)]
struct PendingBatch {
    pending: HashMap<String, HashSet<String>>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl PendingBatch {
    fn key_count(&self) -> usize {
        self.pending.values().map(HashSet::len).sum()
    }

    fn abort_timer(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Where a flush request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    /// Scheduled flush for the given batch generation.
    Timer(u64),
    BatchFull,
    Manual,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Timer(_) => "timer",
            Self::BatchFull => "batch_full",
            Self::Manual => "manual",
        }
    }
}

pub struct InvalidationCoordinator {
    strategy: InvalidationStrategy,
    batch_size: usize,
    batch_timeout: Duration,
    metrics_enabled: bool,
    store: Arc<TieredStore>,
    registry: Arc<CacheRegistry>,
    stats: Arc<CacheStatistics>,
    events: Arc<EventBus>,
    warming: Arc<WarmingScheduler>,
    batch: Mutex<PendingBatch>,
    flushes: AtomicU64,
}

impl InvalidationCoordinator {
    pub fn new(
        config: &CacheConfig,
        store: Arc<TieredStore>,
        registry: Arc<CacheRegistry>,
        stats: Arc<CacheStatistics>,
        events: Arc<EventBus>,
        warming: Arc<WarmingScheduler>,
    ) -> Self {
        Self {
            strategy: config.effective_strategy(),
            batch_size: config.invalidation_batch_size.max(1),
            batch_timeout: config.invalidation_batch_timeout(),
            metrics_enabled: config.enable_metrics,
            store,
            registry,
            stats,
            events,
            warming,
            batch: Mutex::new(PendingBatch::default()),
            flushes: AtomicU64::new(0),
        }
    }

    fn lock_batch(&self, op: &'static str) -> MutexGuard<'_, PendingBatch> {
        mutex_lock(&self.batch, SOURCE, op)
    }

    pub fn strategy(&self) -> InvalidationStrategy {
        self.strategy
    }

    /// Handle a change to `table`.
    ///
    /// Returns the number of keys deleted (immediate) or queued (batched).
    #[instrument(skip(self))]
    pub async fn invalidate_table(self: &Arc<Self>, table: &str) -> usize {
        let table = table.trim().to_lowercase();
        let keys = self.keys_for_table(&table);

        match self.strategy {
            InvalidationStrategy::Batched => self.enqueue(table, keys).await,
            _ => {
                let keys: Vec<String> = keys.into_iter().collect();
                self.remove_keys(vec![table], keys, InvalidationStrategy::Immediate)
                    .await
            }
        }
    }

    /// Delete every entry whose tables match `pattern`, regardless of
    /// strategy. Invalid regular expressions match literally.
    #[instrument(skip(self))]
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let Some(matcher) = compile_pattern(pattern) else {
            return 0;
        };

        let mut tables = BTreeSet::new();
        let mut keys = HashSet::new();
        for (table, table_keys) in self.registry.keys_matching(|table| matcher.is_match(table)) {
            tables.insert(table);
            keys.extend(table_keys);
        }

        let local = self
            .store
            .local_keys_where(|entry| entry.tables.iter().any(|table| matcher.is_match(table)));
        for key in &local {
            if let Some(entry) = self.store.peek_local(key) {
                tables.extend(
                    entry
                        .tables
                        .into_iter()
                        .filter(|table| matcher.is_match(table)),
                );
            }
        }
        keys.extend(local);

        self.remove_keys(
            tables.into_iter().collect(),
            keys.into_iter().collect(),
            InvalidationStrategy::Immediate,
        )
        .await
    }

    /// Flush queued invalidations now. Returns the number of keys deleted.
    pub async fn flush_pending(&self) -> usize {
        self.flush(FlushTrigger::Manual).await
    }

    /// Drop queued invalidations and the scheduled flush without deleting.
    pub fn cancel_pending(&self) {
        let mut batch = self.lock_batch("cancel_pending");
        batch.abort_timer();
        batch.pending.clear();
    }

    /// Keys currently queued for the next flush.
    pub fn pending_key_count(&self) -> usize {
        self.lock_batch("pending_key_count").key_count()
    }

    pub fn has_scheduled_flush(&self) -> bool {
        self.lock_batch("has_scheduled_flush").timer.is_some()
    }

    /// Completed batched flushes since construction.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    fn keys_for_table(&self, table: &str) -> HashSet<String> {
        let mut keys = self.registry.keys_for_table(table);
        keys.extend(self.store.local_keys_where(|entry| entry.has_table(table)));
        keys
    }

    async fn enqueue(self: &Arc<Self>, table: String, keys: HashSet<String>) -> usize {
        let queued = keys.len();
        let batch_full = {
            let mut batch = self.lock_batch("enqueue");
            batch.pending.entry(table).or_default().extend(keys);
            batch.abort_timer();

            if batch.key_count() >= self.batch_size {
                true
            } else {
                batch.timer = Some(self.spawn_flush_timer(batch.generation));
                false
            }
        };

        if batch_full {
            self.flush(FlushTrigger::BatchFull).await;
        }
        queued
    }

    fn spawn_flush_timer(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let timeout = self.batch_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.flush(FlushTrigger::Timer(generation)).await;
            }
        })
    }

    async fn flush(&self, trigger: FlushTrigger) -> usize {
        let pending = {
            let mut batch = self.lock_batch("flush");
            match trigger {
                // A newer notification replaced this timer after it woke.
                FlushTrigger::Timer(generation) if generation != batch.generation => {
                    debug!(generation, "Superseded flush timer skipped");
                    return 0;
                }
                // Running inside the timer task; aborting it would cancel this flush.
                FlushTrigger::Timer(_) => {
                    batch.timer.take();
                }
                FlushTrigger::BatchFull | FlushTrigger::Manual => batch.abort_timer(),
            }
            std::mem::take(&mut batch.pending)
        };

        if pending.is_empty() {
            return 0;
        }

        let started_at = Instant::now();
        let mut tables: Vec<String> = pending.keys().cloned().collect();
        tables.sort();
        let keys: Vec<String> = pending
            .into_values()
            .flatten()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let removed = self
            .remove_keys(tables, keys, InvalidationStrategy::Batched)
            .await;
        self.flushes.fetch_add(1, Ordering::SeqCst);

        if self.metrics_enabled {
            histogram!(METRIC_INVALIDATION_FLUSH_MS, "trigger" => trigger.as_str())
                .record(started_at.elapsed().as_secs_f64() * 1000.0);
        }
        removed
    }

    async fn remove_keys(
        &self,
        tables: Vec<String>,
        keys: Vec<String>,
        strategy: InvalidationStrategy,
    ) -> usize {
        let removed_locally = self.store.delete_many(&keys).await;
        self.registry.unregister_all(&keys);
        self.warming.forget(&keys);
        self.stats.record_deletes(keys.len() as u64);

        info!(
            tables = ?tables,
            keys = keys.len(),
            removed_locally,
            strategy = %strategy,
            "Cache entries invalidated"
        );

        self.events.publish(EventKind::Invalidation {
            tables,
            keys: keys.len(),
            strategy,
        });
        keys.len()
    }
}

fn compile_pattern(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!(pattern = %pattern, error = %err, "Invalid table pattern; matching literally");
            match Regex::new(&regex::escape(pattern)) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(pattern = %pattern, error = %err, "Table pattern rejected");
                    None
                }
            }
        }
    }
}

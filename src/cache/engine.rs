//! Public facade of the query cache.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::config::{CacheConfig, InvalidationStrategy};
use super::entry::{CacheEntry, EntryParts};
use super::events::{CacheEvent, EventBus, EventKind};
use super::eviction::{CleanupReport, EvictionManager};
use super::fingerprint;
use super::invalidation::InvalidationCoordinator;
use super::lock::mutex_lock;
use super::notify::TableChange;
use super::registry::CacheRegistry;
use super::remote::RemoteTier;
use super::stats::{CacheStatistics, StatisticsSnapshot};
use super::store::TieredStore;
use super::tables::{extract_tables, normalize_tables};
use super::warming::{Refresher, WarmReport, WarmingScheduler};

const SOURCE: &str = "cache::engine";

/// Per-call options for [`QueryCache::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Bound parameters of the query; part of the cache key.
    pub params: Vec<Value>,
    /// Overrides the configured default TTL.
    pub ttl: Option<Duration>,
    /// Tables the result depends on. Extracted from the query text when
    /// absent.
    pub tables: Option<Vec<String>>,
}

impl SetOptions {
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Default)]
struct BackgroundTasks {
    cleanup: Option<JoinHandle<()>>,
    warming: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn take_all(&mut self) -> Vec<JoinHandle<()>> {
        self.cleanup.take().into_iter().chain(self.warming.take()).collect()
    }
}

/// Two-tier cache for query results with table-driven invalidation.
///
/// Construct one per process (or per logical cache) and share it behind an
/// `Arc`. Cache operations never fail: a broken remote tier degrades to
/// local-only caching and every problem is logged.
pub struct QueryCache {
    config: CacheConfig,
    store: Arc<TieredStore>,
    registry: Arc<CacheRegistry>,
    stats: Arc<CacheStatistics>,
    events: Arc<EventBus>,
    invalidation: Arc<InvalidationCoordinator>,
    eviction: Arc<EvictionManager>,
    warming: Arc<WarmingScheduler>,
    tasks: Mutex<BackgroundTasks>,
}

impl QueryCache {
    pub fn new(config: CacheConfig, remote: Arc<dyn RemoteTier>) -> Self {
        Self::build(config, remote, None)
    }

    /// Like [`QueryCache::new`], re-running queries through `refresher` when
    /// warming hot entries.
    pub fn with_refresher(
        config: CacheConfig,
        remote: Arc<dyn RemoteTier>,
        refresher: Arc<dyn Refresher>,
    ) -> Self {
        Self::build(config, remote, Some(refresher))
    }

    fn build(
        config: CacheConfig,
        remote: Arc<dyn RemoteTier>,
        refresher: Option<Arc<dyn Refresher>>,
    ) -> Self {
        if config.invalidation_strategy == InvalidationStrategy::Lazy {
            warn!("Lazy invalidation is not supported; falling back to immediate invalidation");
        }

        let stats = Arc::new(CacheStatistics::new(config.enable_metrics));
        let events = Arc::new(EventBus::new(config.event_capacity_non_zero().get()));
        let registry = Arc::new(CacheRegistry::new());
        let store = Arc::new(TieredStore::new(&config, remote, stats.clone()));

        let warming = Arc::new(WarmingScheduler::new(
            &config,
            store.clone(),
            registry.clone(),
            stats.clone(),
            events.clone(),
            refresher,
        ));
        let invalidation = Arc::new(InvalidationCoordinator::new(
            &config,
            store.clone(),
            registry.clone(),
            stats.clone(),
            events.clone(),
            warming.clone(),
        ));
        let eviction = Arc::new(EvictionManager::new(
            store.clone(),
            registry.clone(),
            config.cleanup_interval(),
            config.enable_metrics,
        ));

        Self {
            config,
            store,
            registry,
            stats,
            events,
            invalidation,
            eviction,
            warming,
            tasks: Mutex::new(BackgroundTasks::default()),
        }
    }

    fn lock_tasks(&self, op: &'static str) -> MutexGuard<'_, BackgroundTasks> {
        mutex_lock(&self.tasks, SOURCE, op)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Spawn the cleanup loop and, when enabled, the warming loop.
    ///
    /// Must be called from within a Tokio runtime. Calling it twice is a
    /// no-op.
    pub fn start(&self) {
        let mut tasks = self.lock_tasks("start");
        if tasks.cleanup.is_none() {
            tasks.cleanup = Some(self.eviction.clone().spawn());
        }
        if self.warming.is_enabled() && tasks.warming.is_none() {
            tasks.warming = Some(self.warming.clone().spawn());
        }

        info!(
            cleanup_interval_ms = self.config.cleanup_interval_ms,
            warming_enabled = self.config.warming_enabled,
            strategy = %self.invalidation.strategy(),
            "Query cache started"
        );
    }

    /// Stop background loops, flush queued invalidations and release the
    /// remote handle.
    pub async fn stop(&self) {
        let handles = self.lock_tasks("stop").take_all();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        let flushed = self.invalidation.flush_pending().await;
        self.store.remote().close().await;

        info!(flushed, "Query cache stopped");
    }

    /// Cached result of `query` with `params`, if present and unexpired.
    ///
    /// A payload that does not deserialize into `T` counts as a miss.
    #[instrument(skip(self, params))]
    pub async fn get<T>(&self, query: &str, params: &[Value]) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let started_at = Instant::now();
        let fingerprint = fingerprint::fingerprint(query, params);
        let key = fingerprint::cache_key(&self.config.key_prefix, &fingerprint);

        let Some(lookup) = self.store.get(&key, OffsetDateTime::now_utc()).await else {
            self.record_miss(key, fingerprint, started_at);
            return None;
        };

        match serde_json::from_value::<T>(lookup.entry.data.clone()) {
            Ok(value) => {
                self.stats.record_hit();
                self.warming.consider(&lookup.entry);
                self.events.publish(EventKind::Hit {
                    key,
                    fingerprint,
                    tier: lookup.tier,
                    elapsed: started_at.elapsed(),
                });
                Some(value)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Cached payload does not match the requested type");
                self.record_miss(key, fingerprint, started_at);
                None
            }
        }
    }

    fn record_miss(&self, key: String, fingerprint: String, started_at: Instant) {
        self.stats.record_miss();
        self.events.publish(EventKind::Miss {
            key,
            fingerprint,
            elapsed: started_at.elapsed(),
        });
    }

    /// Cache `data` as the result of `query`.
    #[instrument(skip(self, data, options))]
    pub async fn set<T>(&self, query: &str, data: &T, options: SetOptions)
    where
        T: Serialize + ?Sized,
    {
        let payload = match serde_json::to_value(data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Query result is not serializable; skipping cache write");
                return;
            }
        };

        let SetOptions {
            params,
            ttl,
            tables,
        } = options;
        let fingerprint = fingerprint::fingerprint(query, &params);
        let key = fingerprint::cache_key(&self.config.key_prefix, &fingerprint);
        let tables = match tables {
            Some(tables) => normalize_tables(tables),
            None => extract_tables(query),
        };

        let entry = CacheEntry::new(
            EntryParts {
                key: key.clone(),
                fingerprint: fingerprint.clone(),
                query: query.to_string(),
                params,
                tables,
                data: payload,
                ttl: ttl.unwrap_or_else(|| self.config.default_ttl()),
            },
            OffsetDateTime::now_utc(),
        );

        if entry.ttl_secs > 0 {
            self.registry
                .register(&key, entry.tables.iter(), entry.expires_at);
        } else {
            self.registry.unregister(&key);
        }
        self.stats.record_set(entry.created_at);
        self.warming.consider(&entry);

        let event = EventKind::Set {
            key,
            fingerprint,
            size: entry.size,
            ttl_secs: entry.ttl_secs,
            tables: entry.tables.iter().cloned().collect(),
        };
        self.store.set(entry).await;
        self.events.publish(event);
    }

    /// Remove `key` from both tiers. Returns whether anything was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.store.delete(key).await;
        self.registry.unregister(key);
        self.warming.forget(&[key.to_string()]);

        if removed {
            self.stats.record_deletes(1);
            self.events.publish(EventKind::Delete {
                key: key.to_string(),
            });
        } else {
            debug!(key = %key, "Delete found nothing to remove");
        }
        removed
    }

    /// Invalidate every entry derived from `table` using the configured
    /// strategy.
    pub async fn invalidate_by_table(&self, table: &str) -> usize {
        self.invalidation.invalidate_table(table).await
    }

    /// Invalidate every entry derived from a table matching `pattern`.
    pub async fn invalidate_by_table_pattern(&self, pattern: &str) -> usize {
        self.invalidation.invalidate_pattern(pattern).await
    }

    /// React to a write reported by the data layer.
    pub async fn on_table_change(&self, change: &TableChange) -> usize {
        debug!(
            table = %change.table_name,
            operation = %change.operation,
            row_count = change.row_count,
            "Table change received"
        );
        self.invalidate_by_table(&change.table_name).await
    }

    /// Flush batched invalidations without waiting for the quiet period.
    pub async fn flush_invalidations(&self) -> usize {
        self.invalidation.flush_pending().await
    }

    pub fn invalidation_flush_count(&self) -> u64 {
        self.invalidation.flush_count()
    }

    /// Remove everything under the key prefix from both tiers and reset the
    /// statistics.
    pub async fn clear(&self) {
        self.invalidation.cancel_pending();
        self.warming.clear_queue();
        self.store.clear(&self.config.key_prefix).await;
        self.registry.clear();
        self.stats.reset();

        info!(prefix = %self.config.key_prefix, "Query cache cleared");
        self.events.publish(EventKind::Clear);
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats
            .snapshot(self.store.total_size(), self.store.local_len())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Storage key for `query` with `params`.
    pub fn cache_key(&self, query: &str, params: &[Value]) -> String {
        fingerprint::cache_key(
            &self.config.key_prefix,
            &fingerprint::fingerprint(query, params),
        )
    }

    pub fn fingerprint(&self, query: &str, params: &[Value]) -> String {
        fingerprint::fingerprint(query, params)
    }

    pub fn is_cached_locally(&self, key: &str) -> bool {
        self.store.contains_local(key)
    }

    /// Entry stored under `key`, without touching it or counting a lookup.
    pub async fn inspect(&self, key: &str) -> Option<CacheEntry> {
        match self.store.peek_local(key) {
            Some(entry) => Some(entry),
            None => self.store.fetch_remote(key).await,
        }
    }

    /// Run one cleanup cycle now.
    pub fn run_cleanup(&self) -> CleanupReport {
        self.eviction.run_cycle()
    }

    /// Run one warming cycle now.
    pub async fn run_warming(&self) -> Option<WarmReport> {
        self.warming.run_cycle().await
    }
}

impl Drop for QueryCache {
    fn drop(&mut self) {
        for handle in self.lock_tasks("drop").take_all() {
            handle.abort();
        }
    }
}

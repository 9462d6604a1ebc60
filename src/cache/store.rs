//! Two-tier storage.
//!
//! Local tier: in-process LRU map guarded by a single mutex together with its
//! byte counter. Remote tier: any [`RemoteTier`], the tier of record for
//! expiry. Local operations never suspend; only remote calls await.

use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::events::Tier;
use super::lock::mutex_lock;
use super::remote::RemoteTier;
use super::stats::CacheStatistics;

const SOURCE: &str = "cache::store";
const REMOTE_DELETE_CHUNK: usize = 500;

struct LocalTier {
    entries: LruCache<String, CacheEntry>,
    total_size: usize,
}

impl LocalTier {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_size: 0,
        }
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.total_size += entry.size;
        if let Some(previous) = self.entries.put(entry.key.clone(), entry) {
            self.total_size = self.total_size.saturating_sub(previous.size);
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.pop(key)?;
        self.total_size = self.total_size.saturating_sub(removed.size);
        Some(removed)
    }

    fn evict_lru(&mut self) -> Option<CacheEntry> {
        let (_, evicted) = self.entries.pop_lru()?;
        self.total_size = self.total_size.saturating_sub(evicted.size);
        Some(evicted)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.total_size = 0;
    }
}

enum LocalProbe {
    Hit(CacheEntry),
    Expired,
    Absent,
}

/// A successful lookup and the tier that served it.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub entry: CacheEntry,
    pub tier: Tier,
}

pub struct TieredStore {
    local: Mutex<LocalTier>,
    remote: Arc<dyn RemoteTier>,
    max_memory_size: usize,
    max_entries: usize,
    stats: Arc<CacheStatistics>,
}

impl TieredStore {
    pub fn new(
        config: &CacheConfig,
        remote: Arc<dyn RemoteTier>,
        stats: Arc<CacheStatistics>,
    ) -> Self {
        Self {
            local: Mutex::new(LocalTier::new()),
            remote,
            max_memory_size: config.max_memory_size,
            max_entries: config.max_entries,
            stats,
        }
    }

    fn lock_local(&self, op: &'static str) -> MutexGuard<'_, LocalTier> {
        mutex_lock(&self.local, SOURCE, op)
    }

    /// Look up `key`, local tier first.
    ///
    /// Hits are touched. Remote hits are promoted locally when they fit.
    /// Expired entries are deleted from the tier they were found in, and
    /// remote failures or undecodable payloads count as misses.
    pub async fn get(&self, key: &str, now: OffsetDateTime) -> Option<Lookup> {
        let probe = {
            let mut local = self.lock_local("get");
            let probe = match local.entries.get_mut(key) {
                Some(entry) if entry.is_expired(now) => LocalProbe::Expired,
                Some(entry) => {
                    entry.touch(now);
                    LocalProbe::Hit(entry.clone())
                }
                None => LocalProbe::Absent,
            };
            if matches!(probe, LocalProbe::Expired) {
                local.remove(key);
            }
            probe
        };

        match probe {
            LocalProbe::Hit(entry) => {
                return Some(Lookup {
                    entry,
                    tier: Tier::Local,
                });
            }
            LocalProbe::Expired => {
                debug!(key = %key, "Expired entry dropped from local tier on read");
                self.observe_size();
                return None;
            }
            LocalProbe::Absent => {}
        }

        let raw = match self.remote.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %key, error = %err, "Remote tier read failed; treating as miss");
                return None;
            }
        };

        let mut entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %key, error = %err, "Discarding undecodable remote entry");
                self.remote_delete(&[key.to_string()]).await;
                return None;
            }
        };

        if entry.is_expired(now) {
            self.remote_delete(&[key.to_string()]).await;
            return None;
        }

        entry.touch(now);
        self.admit(entry.clone());
        Some(Lookup {
            entry,
            tier: Tier::Remote,
        })
    }

    /// Write `entry` to both tiers.
    ///
    /// The remote write carries the entry's TTL so the remote store expires
    /// it independently; a non-positive TTL removes any previous remote value
    /// instead. The local write happens even when the remote tier is down.
    /// Returns whether the entry was admitted locally.
    pub async fn set(&self, entry: CacheEntry) -> bool {
        if entry.ttl_secs > 0 {
            match serde_json::to_string(&entry) {
                Ok(encoded) => {
                    let ttl_secs = entry.ttl_secs.unsigned_abs();
                    if let Err(err) = self.remote.set_ex(&entry.key, encoded, ttl_secs).await {
                        warn!(
                            key = %entry.key,
                            error = %err,
                            "Remote tier write failed; keeping local copy only"
                        );
                    }
                }
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "Failed to encode entry for remote tier");
                }
            }
        } else {
            self.remote_delete(std::slice::from_ref(&entry.key)).await;
        }

        self.admit(entry)
    }

    /// Put `entry` in the local tier, evicting least-recently-used entries
    /// until it fits. Entries larger than the whole byte budget stay remote.
    fn admit(&self, entry: CacheEntry) -> bool {
        let mut evicted = 0_u64;
        let admitted = {
            let mut local = self.lock_local("admit");
            local.remove(&entry.key);

            if self.max_entries == 0 || entry.size > self.max_memory_size {
                false
            } else {
                while local.entries.len() + 1 > self.max_entries
                    || local.total_size + entry.size > self.max_memory_size
                {
                    if local.evict_lru().is_none() {
                        break;
                    }
                    evicted += 1;
                }
                local.insert(entry);
                true
            }
        };

        self.stats.record_evictions(evicted);
        self.observe_size();
        admitted
    }

    /// Remove `key` from both tiers. Returns whether either tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let removed_locally = self.remove_local(key).is_some();
        let removed_remotely = self.remote_delete(&[key.to_string()]).await > 0;
        removed_locally || removed_remotely
    }

    /// Bulk removal from both tiers. Returns how many keys the local tier held.
    pub async fn delete_many(&self, keys: &[String]) -> usize {
        if keys.is_empty() {
            return 0;
        }

        let removed_locally = {
            let mut local = self.lock_local("delete_many");
            keys.iter().filter(|key| local.remove(key).is_some()).count()
        };
        self.observe_size();

        for chunk in keys.chunks(REMOTE_DELETE_CHUNK) {
            self.remote_delete(chunk).await;
        }
        removed_locally
    }

    /// Empty the local tier and every remote key under `prefix`.
    pub async fn clear(&self, prefix: &str) {
        self.lock_local("clear").clear();
        self.observe_size();

        match self.remote.scan_prefix(prefix).await {
            Ok(keys) => {
                for chunk in keys.chunks(REMOTE_DELETE_CHUNK) {
                    self.remote_delete(chunk).await;
                }
            }
            Err(err) => {
                warn!(prefix = %prefix, error = %err, "Remote tier scan failed during clear");
            }
        }
    }

    pub fn remove_local(&self, key: &str) -> Option<CacheEntry> {
        let removed = self.lock_local("remove_local").remove(key);
        if removed.is_some() {
            self.observe_size();
        }
        removed
    }

    /// Keys of local entries satisfying `predicate`.
    pub fn local_keys_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        self.lock_local("local_keys_where")
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop every expired local entry, counting each as an eviction.
    pub fn sweep_expired(&self, now: OffsetDateTime) -> Vec<String> {
        let expired = {
            let mut local = self.lock_local("sweep_expired");
            let expired: Vec<String> = local
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                local.remove(key);
            }
            expired
        };

        self.stats.record_evictions(expired.len() as u64);
        self.observe_size();
        expired
    }

    /// Evict least-recently-used entries until both budgets hold.
    pub fn enforce_limits(&self) -> Vec<String> {
        let evicted = {
            let mut local = self.lock_local("enforce_limits");
            let mut evicted = Vec::new();
            while local.total_size > self.max_memory_size || local.entries.len() > self.max_entries
            {
                match local.evict_lru() {
                    Some(entry) => evicted.push(entry.key),
                    None => break,
                }
            }
            evicted
        };

        self.stats.record_evictions(evicted.len() as u64);
        self.observe_size();
        evicted
    }

    /// Touch a live local entry, refreshing its recency without extending
    /// its expiry.
    pub fn touch_local(&self, key: &str, now: OffsetDateTime) -> Option<CacheEntry> {
        let mut local = self.lock_local("touch_local");
        let entry = local.entries.get_mut(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.touch(now);
        Some(entry.clone())
    }

    /// Read a local entry without touching it or changing its recency.
    pub fn peek_local(&self, key: &str) -> Option<CacheEntry> {
        self.lock_local("peek_local").entries.peek(key).cloned()
    }

    pub fn contains_local(&self, key: &str) -> bool {
        self.lock_local("contains_local").entries.contains(key)
    }

    pub fn local_len(&self) -> usize {
        self.lock_local("local_len").entries.len()
    }

    pub fn total_size(&self) -> usize {
        self.lock_local("total_size").total_size
    }

    pub fn remote(&self) -> &Arc<dyn RemoteTier> {
        &self.remote
    }

    /// Read an entry straight from the remote tier without promoting it.
    pub async fn fetch_remote(&self, key: &str) -> Option<CacheEntry> {
        match self.remote.get(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(key = %key, error = %err, "Remote tier read failed");
                None
            }
        }
    }

    async fn remote_delete(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        match self.remote.del(keys).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(
                    key_count = keys.len(),
                    error = %err,
                    "Remote tier delete failed; local tier already cleared"
                );
                0
            }
        }
    }

    fn observe_size(&self) {
        self.stats.observe_local_size(self.total_size());
    }
}

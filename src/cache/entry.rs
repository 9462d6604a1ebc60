//! Cached query results.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use super::config::MAX_TTL_SECS;

/// One cached query result, as held in either tier.
///
/// `expires_at` is fixed when the entry is built. Touching an entry only
/// moves `last_accessed` and `access_count`; a fresher expiry needs a new
/// entry via [`CacheEntry::refreshed`] or a fresh `set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    pub fingerprint: String,
    /// Lowercase table names used for invalidation.
    pub tables: BTreeSet<String>,
    /// Original query text, kept for diagnostics and refreshes.
    pub query: String,
    pub params: Vec<Value>,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub access_count: u64,
    pub last_accessed: OffsetDateTime,
    /// Approximate bytes charged against the local tier budget.
    pub size: usize,
    pub ttl_secs: i64,
}

/// Everything needed to build an entry except the clock.
#[derive(Debug, Clone)]
pub struct EntryParts {
    pub key: String,
    pub fingerprint: String,
    pub query: String,
    pub params: Vec<Value>,
    pub tables: BTreeSet<String>,
    pub data: Value,
    pub ttl: Duration,
}

impl CacheEntry {
    /// Build an entry created at `now`.
    ///
    /// `ttl` is clamped to `±MAX_TTL_SECS`.
    pub fn new(parts: EntryParts, now: OffsetDateTime) -> Self {
        let EntryParts {
            key,
            fingerprint,
            query,
            params,
            tables,
            data,
            ttl,
        } = parts;
        let size = estimate_size(&data, &query, &params);
        let limit = Duration::seconds(MAX_TTL_SECS);
        let ttl = ttl.clamp(-limit, limit);

        Self {
            key,
            data,
            fingerprint,
            tables,
            query,
            params,
            created_at: now,
            expires_at: now.checked_add(ttl).unwrap_or(now),
            access_count: 0,
            last_accessed: now,
            size,
            ttl_secs: ttl.whole_seconds(),
        }
    }

    /// A new entry with fresh data and expiry that keeps this entry's identity
    /// and access history.
    pub fn refreshed(&self, data: Value, now: OffsetDateTime) -> Self {
        let mut entry = Self::new(
            EntryParts {
                key: self.key.clone(),
                fingerprint: self.fingerprint.clone(),
                query: self.query.clone(),
                params: self.params.clone(),
                tables: self.tables.clone(),
                data,
                ttl: self.ttl(),
            },
            now,
        );
        entry.access_count = self.access_count;
        entry
    }

    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs)
    }

    /// Expired once `now` reaches `expires_at`; a non-positive TTL is expired
    /// from the moment it is created.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.ttl_secs <= 0 || now >= self.expires_at
    }

    /// Whole seconds left before expiry, if any.
    pub fn remaining_ttl_secs(&self, now: OffsetDateTime) -> Option<u64> {
        if self.is_expired(now) {
            return None;
        }
        let remaining = (self.expires_at - now).whole_seconds();
        u64::try_from(remaining).ok().filter(|secs| *secs > 0)
    }

    pub fn touch(&mut self, now: OffsetDateTime) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = now;
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains(table)
    }
}

fn estimate_size(data: &Value, query: &str, params: &[Value]) -> usize {
    let data_bytes = serde_json::to_vec(data).map(|bytes| bytes.len()).unwrap_or(0);
    let params_bytes: usize = params.iter().map(|param| param.to_string().len()).sum();
    data_bytes + query.len() + params_bytes
}

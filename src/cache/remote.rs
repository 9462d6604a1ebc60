//! Shared remote tier contract.
//!
//! The remote tier is any key-value store offering `SET key value EX ttl`,
//! `GET`, multi-key `DEL` and prefix enumeration. It expires entries on its
//! own, independently of the engine's cleanup loop.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::remote";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("remote tier unavailable: {0}")]
    Unavailable(String),
    #[error("ttl of {0} seconds is out of range")]
    TtlOutOfRange(u64),
}

impl RemoteError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Asynchronous key-value store used as the shared tier.
#[async_trait]
pub trait RemoteTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RemoteError>;

    /// Store `value` under `key`, expiring after `ttl_secs` (> 0).
    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), RemoteError>;

    /// Delete `keys`, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, RemoteError>;

    /// Every live key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;

    /// Release the underlying handle.
    async fn close(&self) {}
}

/// Process-local remote tier.
///
/// Useful for single-node deployments and tests; several engines can share
/// one instance through an `Arc` to model a shared store.
#[derive(Debug, Default)]
pub struct MemoryTier {
    values: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        mutex_lock(&self.values, SOURCE, "len")
            .values()
            .filter(|(_, deadline)| *deadline > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        mutex_lock(&self.values, SOURCE, "contains")
            .get(key)
            .is_some_and(|(_, deadline)| *deadline > now)
    }
}

#[async_trait]
impl RemoteTier for MemoryTier {
    async fn get(&self, key: &str) -> Result<Option<String>, RemoteError> {
        let mut values = mutex_lock(&self.values, SOURCE, "get");
        match values.get(key) {
            Some((value, deadline)) if *deadline > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), RemoteError> {
        let deadline = Instant::now()
            .checked_add(Duration::from_secs(ttl_secs))
            .ok_or(RemoteError::TtlOutOfRange(ttl_secs))?;
        mutex_lock(&self.values, SOURCE, "set_ex").insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, RemoteError> {
        let mut values = mutex_lock(&self.values, SOURCE, "del");
        let removed = keys.iter().filter(|key| values.remove(*key).is_some()).count();
        Ok(removed as u64)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let now = Instant::now();
        let mut values = mutex_lock(&self.values, SOURCE, "scan_prefix");
        values.retain(|_, (_, deadline)| *deadline > now);
        Ok(values
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

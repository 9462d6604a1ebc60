//! Bidirectional table registry.
//!
//! Tracks which cache keys were derived from which tables, so a table change
//! can find its entries even after they have left the local tier and only
//! live in the remote tier.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use time::OffsetDateTime;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

#[derive(Debug, Clone)]
struct KeyRecord {
    tables: HashSet<String>,
    expires_at: OffsetDateTime,
}

/// Tracks table → keys and key → tables mappings.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    table_to_keys: RwLock<HashMap<String, HashSet<String>>>,
    key_to_tables: RwLock<HashMap<String, KeyRecord>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` depends on `tables` until `expires_at`.
    ///
    /// Re-registering a key replaces its previous tables.
    pub fn register<I>(&self, key: &str, tables: I, expires_at: OffsetDateTime)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let tables: HashSet<String> = tables
            .into_iter()
            .map(|table| table.as_ref().to_string())
            .collect();

        let mut t2k = rw_write(&self.table_to_keys, SOURCE, "register.table_to_keys");
        let mut k2t = rw_write(&self.key_to_tables, SOURCE, "register.key_to_tables");

        if let Some(previous) = k2t.remove(key) {
            detach(&mut t2k, key, &previous.tables);
        }
        for table in &tables {
            t2k.entry(table.clone()).or_default().insert(key.to_string());
        }
        k2t.insert(key.to_string(), KeyRecord { tables, expires_at });
    }

    /// Keys registered under exactly `table`.
    pub fn keys_for_table(&self, table: &str) -> HashSet<String> {
        rw_read(&self.table_to_keys, SOURCE, "keys_for_table")
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Tables whose name satisfies `matches`, with their keys.
    pub fn keys_matching<F>(&self, matches: F) -> HashMap<String, HashSet<String>>
    where
        F: Fn(&str) -> bool,
    {
        rw_read(&self.table_to_keys, SOURCE, "keys_matching")
            .iter()
            .filter(|(table, _)| matches(table))
            .map(|(table, keys)| (table.clone(), keys.clone()))
            .collect()
    }

    pub fn tables_for_key(&self, key: &str) -> HashSet<String> {
        rw_read(&self.key_to_tables, SOURCE, "tables_for_key")
            .get(key)
            .map(|record| record.tables.clone())
            .unwrap_or_default()
    }

    /// Forget `key` and clean up its table mappings.
    pub fn unregister(&self, key: &str) {
        let mut t2k = rw_write(&self.table_to_keys, SOURCE, "unregister.table_to_keys");
        let mut k2t = rw_write(&self.key_to_tables, SOURCE, "unregister.key_to_tables");

        if let Some(record) = k2t.remove(key) {
            detach(&mut t2k, key, &record.tables);
        }
    }

    pub fn unregister_all<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut t2k = rw_write(&self.table_to_keys, SOURCE, "unregister_all.table_to_keys");
        let mut k2t = rw_write(&self.key_to_tables, SOURCE, "unregister_all.key_to_tables");

        for key in keys {
            if let Some(record) = k2t.remove(key) {
                detach(&mut t2k, key, &record.tables);
            }
        }
    }

    /// Drop every key whose expiry has passed, returning them.
    ///
    /// Those entries are gone from the remote tier too, so nothing is left
    /// for a later table change to delete.
    pub fn prune_expired(&self, now: OffsetDateTime) -> Vec<String> {
        let mut t2k = rw_write(&self.table_to_keys, SOURCE, "prune_expired.table_to_keys");
        let mut k2t = rw_write(&self.key_to_tables, SOURCE, "prune_expired.key_to_tables");

        let expired: Vec<String> = k2t
            .iter()
            .filter(|(_, record)| now >= record.expires_at)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(record) = k2t.remove(key) {
                detach(&mut t2k, key, &record.tables);
            }
        }
        expired
    }

    pub fn clear(&self) {
        rw_write(&self.table_to_keys, SOURCE, "clear.table_to_keys").clear();
        rw_write(&self.key_to_tables, SOURCE, "clear.key_to_tables").clear();
    }

    pub fn table_count(&self) -> usize {
        rw_read(&self.table_to_keys, SOURCE, "table_count").len()
    }

    pub fn key_count(&self) -> usize {
        rw_read(&self.key_to_tables, SOURCE, "key_count").len()
    }
}

fn detach(t2k: &mut HashMap<String, HashSet<String>>, key: &str, tables: &HashSet<String>) {
    for table in tables {
        if let Some(keys) = t2k.get_mut(table) {
            keys.remove(key);
            if keys.is_empty() {
                t2k.remove(table);
            }
        }
    }
}

//! The query cache table: key → entry, with time-based pruning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entry::CacheEntry;

/// Mapping from query key to cache entry.
///
/// Backed by a `BTreeMap` so persisted snapshots serialize deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheTable<D> {
    entries: BTreeMap<String, CacheEntry<D>>,
}

impl<D> Default for CacheTable<D> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<D> CacheTable<D> {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CacheEntry<D>> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: String, entry: CacheEntry<D>) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<D>> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn entry_or_insert_with(
        &mut self,
        key: &str,
        default: impl FnOnce() -> CacheEntry<D>,
    ) -> &mut CacheEntry<D> {
        self.entries
            .entry(key.to_string())
            .or_insert_with(default)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Drop every entry that has outlived its own cache time, except the
    /// exempt keys (the current query key, plus the previous one under
    /// keep-previous-data). Returns the number of removed entries.
    pub fn prune(&mut self, now_ms: i64, exempt: &[&str]) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| exempt.contains(&key.as_str()) || !entry.is_expired(now_ms));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("🧹 pruned {} expired cache entries", removed);
        }
        removed
    }

    #[must_use]
    pub fn stats(&self, now_ms: i64, stale_ms: i64) -> CacheStats {
        let total_entries = self.entries.len();
        let fresh_entries = self
            .entries
            .values()
            .filter(|e| {
                e.error_info.is_none()
                    && e.last_fetched_at
                        .is_some_and(|at| now_ms - at < stale_ms)
            })
            .count();
        let expired_entries = self
            .entries
            .values()
            .filter(|e| e.is_expired(now_ms))
            .count();
        let error_entries = self
            .entries
            .values()
            .filter(|e| e.error_info.is_some())
            .count();

        CacheStats {
            total_entries,
            fresh_entries,
            expired_entries,
            error_entries,
        }
    }
}

/// Point-in-time cache census. Categories can overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub fresh_entries: usize,
    pub expired_entries: usize,
    pub error_entries: usize,
}

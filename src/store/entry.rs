//! Per-key cache entries.

use serde::{Deserialize, Serialize};

use super::clock::is_infinite;

/// Failure record carried by an entry between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub last_failed_at: i64,
    pub retry_count: u32,
}

/// Cached state for one query key.
///
/// `data` is only present after at least one successful fetch for the key;
/// when the caller owns placement via `set_data` the entry carries metadata
/// only. `cache_time_ms` is evaluated once, at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<D> {
    pub cache_time_ms: i64,
    pub data: Option<D>,
    pub last_fetched_at: Option<i64>,
    pub error_info: Option<ErrorInfo>,
}

impl<D> CacheEntry<D> {
    /// Metadata-only entry, used when an error lands before any success or
    /// when `set_data` owns the payload.
    #[must_use]
    pub fn empty(cache_time_ms: i64) -> Self {
        Self {
            cache_time_ms,
            data: None,
            last_fetched_at: None,
            error_info: None,
        }
    }

    /// Timestamp of the last meaningful operation: a success, else the last
    /// failure.
    #[must_use]
    pub fn last_activity_at(&self) -> Option<i64> {
        self.last_fetched_at
            .or_else(|| self.error_info.as_ref().map(|e| e.last_failed_at))
    }

    /// Whether the entry has outlived its own cache time.
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        if is_infinite(self.cache_time_ms) {
            return false;
        }
        match self.last_activity_at() {
            Some(at) => now_ms - at > self.cache_time_ms,
            None => false,
        }
    }

    /// An error still eligible for retries blocks freshness; once the retry
    /// budget is exhausted the error is considered resolved.
    #[must_use]
    pub fn has_unresolved_error(&self, max_retries: u32) -> bool {
        self.error_info
            .as_ref()
            .is_some_and(|info| info.retry_count < max_retries)
    }

    /// Fresh entries are returned without hitting the fetcher.
    #[must_use]
    pub fn is_fresh(&self, now_ms: i64, stale_ms: i64, max_retries: u32) -> bool {
        if self.has_unresolved_error(max_retries) {
            return false;
        }
        self.last_fetched_at
            .is_some_and(|at| is_infinite(stale_ms) || now_ms - at < stale_ms)
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.error_info.as_ref().map_or(0, |info| info.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::clock::INFINITE_MS;

    fn entry(cache_time_ms: i64, fetched_at: Option<i64>) -> CacheEntry<i32> {
        CacheEntry {
            cache_time_ms,
            data: fetched_at.map(|_| 1),
            last_fetched_at: fetched_at,
            error_info: None,
        }
    }

    #[test]
    fn test_expiry_follows_cache_time() {
        let e = entry(100, Some(1_000));
        assert!(!e.is_expired(1_050));
        assert!(!e.is_expired(1_100)); // boundary: age == cache_time survives
        assert!(e.is_expired(1_101));
    }

    #[test]
    fn test_infinite_cache_time_never_expires() {
        let e = entry(INFINITE_MS, Some(0));
        assert!(!e.is_expired(i64::MAX - 1));
    }

    #[test]
    fn test_failed_entry_ages_from_last_failure() {
        let mut e = entry(100, None);
        e.error_info = Some(ErrorInfo {
            message: "boom".to_string(),
            last_failed_at: 500,
            retry_count: 1,
        });
        assert_eq!(e.last_activity_at(), Some(500));
        assert!(e.is_expired(601));
    }

    #[test]
    fn test_freshness_blocked_by_unresolved_error() {
        let mut e = entry(10_000, Some(1_000));
        assert!(e.is_fresh(1_050, 200, 3));

        e.error_info = Some(ErrorInfo {
            message: "x".to_string(),
            last_failed_at: 1_060,
            retry_count: 1,
        });
        assert!(e.has_unresolved_error(3));
        assert!(!e.is_fresh(1_070, 200, 3));

        // retries exhausted: the error is resolved, freshness is age-based
        if let Some(info) = e.error_info.as_mut() {
            info.retry_count = 3;
        }
        assert!(!e.has_unresolved_error(3));
        assert!(e.is_fresh(1_070, 200, 3));
    }

    #[test]
    fn test_stale_boundary() {
        let e = entry(INFINITE_MS, Some(1_000));
        assert!(e.is_fresh(1_099, 100, 3));
        assert!(!e.is_fresh(1_100, 100, 3));
    }
}

//! The observable store state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::cache::CacheTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Everything observers can see, carried whole through the watch channel so
/// each update is one atomic snapshot.
#[derive(Debug, Clone)]
pub struct QueryState<D> {
    /// Whether the engine should actively fetch.
    pub enabled: bool,
    /// Current query key (canonical serialization of the parameter map).
    pub query_key: String,
    /// Status of the last in-flight or completed operation for the current
    /// key.
    pub status: QueryStatus,
    /// Last error surfaced for the current key.
    pub error: Option<Arc<Error>>,
    /// Timestamp of the last success; meaningful only when caching is
    /// disabled (otherwise the entry carries it).
    pub last_fetched_at: Option<i64>,
    pub query_cache: CacheTable<D>,
}

impl<D> QueryState<D> {
    pub(crate) fn initial(enabled: bool, query_key: String) -> Self {
        Self {
            enabled,
            query_key,
            status: QueryStatus::Idle,
            error: None,
            last_fetched_at: None,
            query_cache: CacheTable::default(),
        }
    }
}

/// Derived status booleans, the shape selectors usually want.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFlags {
    pub is_error: bool,
    pub is_fetching: bool,
    pub is_idle: bool,
    /// Loading with no prior success for the current key.
    pub is_initial_loading: bool,
    pub is_success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_defaults() {
        let state: QueryState<i32> = QueryState::initial(true, "[]".to_string());
        assert!(state.enabled);
        assert_eq!(state.status, QueryStatus::Idle);
        assert!(state.error.is_none());
        assert!(state.last_fetched_at.is_none());
        assert!(state.query_cache.is_empty());
    }

    #[test]
    fn test_status_serde_tags() {
        assert_eq!(
            serde_json::to_string(&QueryStatus::Loading).unwrap(),
            r#""loading""#
        );
        let status: QueryStatus = serde_json::from_str(r#""error""#).unwrap();
        assert_eq!(status, QueryStatus::Error);
    }
}

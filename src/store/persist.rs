//! Persistence bridge: partialize, persist, rehydrate.
//!
//! The persisted projection is fixed by a static policy: observable state
//! survives (with the cache pruned at the boundary), transient coordinator
//! state never does. Errors flatten to their message. A persisted `Loading`
//! downgrades to `Idle`, since no fetch can be in flight across processes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::error::{Error, Result};

use super::cache::CacheTable;
use super::state::QueryStatus;
use super::QueryStore;

/// A named-slot blob store. Implementations own expiry and durability.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn load(&self, slot: &str) -> Result<Option<String>>;

    async fn store(&self, slot: &str, value: String) -> Result<()>;
}

/// In-memory adapter, mainly for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    slots: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self, slot: &str) -> Result<Option<String>> {
        Ok(self.slots.read().await.get(slot).cloned())
    }

    async fn store(&self, slot: &str, value: String) -> Result<()> {
        self.slots.write().await.insert(slot.to_string(), value);
        Ok(())
    }
}

/// The persisted projection of a query store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQuery<D> {
    pub enabled: bool,
    pub error: Option<String>,
    pub last_fetched_at: Option<i64>,
    pub query_cache: CacheTable<D>,
    pub query_key: String,
    pub status: QueryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<serde_json::Value>,
}

impl<D> QueryStore<D>
where
    D: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Project the current state for persistence. The cache snapshot is
    /// pruned here so rehydrated stores never carry expired entries.
    #[must_use]
    pub fn partialize(&self) -> PersistedQuery<D> {
        let state = self.inner.state.borrow().clone();
        let now = self.inner.now_ms();

        let mut query_cache = state.query_cache;
        let previous_key = self.inner.transient().last_fetch_key.clone();
        let mut exempt = vec![state.query_key.as_str()];
        if self.inner.config.keep_previous_data {
            if let Some(previous) = previous_key.as_deref() {
                exempt.push(previous);
            }
        }
        query_cache.prune(now, &exempt);

        let status = if state.status == QueryStatus::Loading {
            QueryStatus::Idle
        } else {
            state.status
        };

        PersistedQuery {
            enabled: state.enabled,
            error: state.error.map(|e| e.to_string()),
            last_fetched_at: state.last_fetched_at,
            query_cache,
            query_key: state.query_key,
            status,
            user: self.inner.config.partialize_user.as_ref().map(|f| f()),
        }
    }

    /// Serialize the projection into the configured storage slot.
    ///
    /// # Errors
    ///
    /// Fails when no storage slot is configured, on serialization failure,
    /// or when the adapter write fails.
    pub async fn persist(&self) -> Result<()> {
        let Some((storage, slot)) = self.inner.config.storage.clone() else {
            return Err(Error::Custom("no storage slot configured".to_string()));
        };
        let blob = serde_json::to_string(&self.partialize())?;
        debug!("💾 persisting query state to {}", slot);
        storage.store(&slot, blob).await
    }

    /// Build a store and overlay the persisted projection, if the configured
    /// slot holds one. A corrupt blob is logged and discarded. Transient
    /// state starts fresh; the first subscriber runs the usual stale check.
    ///
    /// # Errors
    ///
    /// Fails only when the adapter read fails.
    pub async fn rehydrate(config: QueryConfig<D>) -> Result<Self> {
        let store = Self::new(config);
        let Some((storage, slot)) = store.inner.config.storage.clone() else {
            return Ok(store);
        };
        if let Some(blob) = storage.load(&slot).await? {
            match serde_json::from_str::<PersistedQuery<D>>(&blob) {
                Ok(persisted) => {
                    store.apply_persisted(persisted);
                    debug!("rehydrated query state from {}", slot);
                }
                Err(err) => {
                    warn!("discarding corrupt persisted state in {}: {}", slot, err);
                }
            }
        }
        Ok(store)
    }

    fn apply_persisted(&self, persisted: PersistedQuery<D>) {
        self.inner.state.send_modify(|s| {
            s.enabled = persisted.enabled;
            s.error = persisted.error.map(|msg| Arc::new(Error::Custom(msg)));
            s.last_fetched_at = persisted.last_fetched_at;
            s.query_cache = persisted.query_cache;
            s.query_key = persisted.query_key;
            s.status = persisted.status;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.load("slot").await.unwrap().is_none());

        storage.store("slot", "{}".to_string()).await.unwrap();
        assert_eq!(storage.load("slot").await.unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_persisted_query_serde() {
        let persisted: PersistedQuery<i32> = PersistedQuery {
            enabled: true,
            error: None,
            last_fetched_at: Some(42),
            query_cache: CacheTable::default(),
            query_key: "[1]".to_string(),
            status: QueryStatus::Success,
            user: None,
        };
        let blob = serde_json::to_string(&persisted).unwrap();
        let back: PersistedQuery<i32> = serde_json::from_str(&blob).unwrap();
        assert_eq!(back, persisted);
    }
}

//! feedstore — a reactive, cache-backed query engine.
//!
//! Wraps a user-provided fetch function in a subscribable store that
//! deduplicates concurrent requests, caches results by a derived query key,
//! refetches in the background when data goes stale, retries failures with a
//! bounded budget, aborts superseded work, and re-runs whenever reactive
//! parameters change.
//!
//! ```no_run
//! use feedstore::{signal, QueryConfig, QueryStore};
//! use serde_json::json;
//!
//! # async fn demo() {
//! let page = signal(json!(1));
//! let store = QueryStore::new(
//!     QueryConfig::new(|params, _abort| async move {
//!         Ok(format!("feed page {}", params["page"]))
//!     })
//!     .reactive_param("page", page.attach()),
//! );
//!
//! let _sub = store.subscribe();
//! let data = store.fetch().await;
//! page.set(json!(2)); // re-runs the query under the new key
//! # let _ = data;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod signal;
pub mod store;

pub use config::{
    CacheTime, FetchOptions, QueryConfig, RetryDelay, SetDataArgs, DEFAULT_CACHE_TIME,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, DEFAULT_STALE_TIME, STALE_TIME_WARN_FLOOR,
    SUBSCRIBE_THROTTLE_WINDOW,
};
pub use error::{Error, Result};
pub use signal::{signal, AttachValue, Signal};
pub use store::{
    query_key, AbortHandle, CacheEntry, CacheStats, CacheTable, Clock, EnabledSource, ErrorInfo,
    ManualClock, MemoryStorage, ParamMap, ParamSource, ParamValue, PersistedQuery, QueryState,
    QueryStatus, QueryStore, StatusFlags, Storage, SubscriptionHandle, SystemClock,
};

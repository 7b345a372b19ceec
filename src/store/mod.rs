//! The query store: a subscribable, cache-backed view over one fetcher.

pub mod abort;
pub mod cache;
pub mod clock;
pub mod entry;
mod fetch;
pub mod key;
pub mod params;
pub mod persist;
mod scheduler;
pub mod state;
mod subscription;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{FetchOptions, QueryConfig, STALE_TIME_WARN_FLOOR};

pub use abort::AbortHandle;
pub use cache::{CacheStats, CacheTable};
pub use clock::{duration_ms, is_infinite, Clock, ManualClock, SystemClock, INFINITE_MS};
pub use entry::{CacheEntry, ErrorInfo};
pub use key::query_key;
pub use params::{EnabledSource, ParamMap, ParamSource, ParamValue};
pub use persist::{MemoryStorage, PersistedQuery, Storage};
pub use state::{QueryState, QueryStatus, StatusFlags};

use params::ParamResolver;
use subscription::{SubscribeEvent, SubscriptionManager};

pub(crate) type SharedFetch<D> = Shared<BoxFuture<'static, Option<D>>>;

/// A reactive, cache-backed query store around one fetcher.
///
/// Cheap to clone; all clones share the same engine, and `fetch` may be
/// called concurrently from any number of tasks or threads — the
/// coordinator serializes its decision tree internally so concurrent
/// callers share one in-flight fetch per key. Must be created inside a
/// tokio runtime: parameter listeners and timers are spawned tasks.
pub struct QueryStore<D> {
    pub(crate) inner: Arc<StoreInner<D>>,
}

impl<D> Clone for QueryStore<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct StoreInner<D> {
    pub(crate) config: QueryConfig<D>,
    pub(crate) state: watch::Sender<QueryState<D>>,
    pub(crate) subs: SubscriptionManager,
    pub(crate) resolver: ParamResolver,
    pub(crate) transient: Mutex<Transient<D>>,
    /// Serializes the coordinator's dedup-check-through-registration
    /// sequence: on a multi-thread runtime two callers must not both miss
    /// the dedup check and launch the same key twice. Held only across
    /// synchronous sections, never across the fetcher await.
    pub(crate) fetch_gate: tokio::sync::Mutex<()>,
}

/// Process-local coordinator state. Never observable, never persisted.
pub(crate) struct Transient<D> {
    pub(crate) active_fetch: Option<ActiveFetch<D>>,
    pub(crate) abort: Option<AbortHandle>,
    /// Single slot shared by the refetch and retry timers.
    pub(crate) refetch_timer: Option<JoinHandle<()>>,
    pub(crate) last_fetch_key: Option<String>,
    /// Bumped on hard stops; in-flight commits check it before mutating.
    pub(crate) epoch: u64,
    pub(crate) next_fetch_id: u64,
    /// Retry counter for the cache-disabled configuration, where no entry
    /// can carry it. Reset on key change and success.
    pub(crate) detached_retry_count: u32,
    pub(crate) listener_tasks: Vec<JoinHandle<()>>,
}

impl<D> Default for Transient<D> {
    fn default() -> Self {
        Self {
            active_fetch: None,
            abort: None,
            refetch_timer: None,
            last_fetch_key: None,
            epoch: 0,
            next_fetch_id: 0,
            detached_retry_count: 0,
            listener_tasks: Vec::new(),
        }
    }
}

pub(crate) struct ActiveFetch<D> {
    pub(crate) id: u64,
    pub(crate) key: String,
    pub(crate) future: SharedFetch<D>,
}

impl<D> StoreInner<D> {
    pub(crate) fn transient(&self) -> MutexGuard<'_, Transient<D>> {
        self.transient.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.config.clock.now_ms()
    }

    /// Last subscriber released: drop the timer slot and abort whatever is
    /// in flight. The abort handle only exists when interrupted fetches are
    /// abortable, so this is naturally config-gated.
    pub(crate) fn on_last_unsubscribe(&self) {
        let mut t = self.transient();
        if let Some(timer) = t.refetch_timer.take() {
            timer.abort();
        }
        if let Some(handle) = t.abort.take() {
            handle.abort();
        }
        debug!("last subscriber released, timers cleared");
    }
}

impl<D> Drop for StoreInner<D> {
    fn drop(&mut self) {
        let mut t = self.transient();
        for task in t.listener_tasks.drain(..) {
            task.abort();
        }
        if let Some(timer) = t.refetch_timer.take() {
            timer.abort();
        }
        if let Some(handle) = t.abort.take() {
            handle.abort();
        }
    }
}

/// RAII lifecycle subscription. Dropping it releases the slot; when the last
/// one goes, timers stop and the active fetch is aborted.
pub struct SubscriptionHandle<D> {
    inner: Arc<StoreInner<D>>,
}

impl<D> Drop for SubscriptionHandle<D> {
    fn drop(&mut self) {
        if self.inner.subs.release() == 0 {
            self.inner.on_last_unsubscribe();
        }
    }
}

impl<D> QueryStore<D>
where
    D: Clone + Send + Sync + 'static,
{
    /// Build a store and bind its parameter graph. Parameter binding
    /// completes before this returns, so the first subscriber always sees a
    /// fully resolved query key.
    #[must_use]
    pub fn new(config: QueryConfig<D>) -> Self {
        if config.stale_time < STALE_TIME_WARN_FLOOR && !config.suppress_stale_time_warning {
            warn!(
                "stale time {:?} is below {:?}; refetches will be aggressive",
                config.stale_time, STALE_TIME_WARN_FLOOR
            );
        }

        let resolver = ParamResolver::new(config.params.clone());
        let initial_params = resolver.current();
        let initial_key = query_key(&initial_params);
        let enabled = config.initial_enabled();
        let (state, _) = watch::channel(QueryState::initial(enabled, initial_key));

        let inner = Arc::new(StoreInner {
            config,
            state,
            subs: SubscriptionManager::default(),
            resolver,
            transient: Mutex::new(Transient::default()),
            fetch_gate: tokio::sync::Mutex::new(()),
        });
        Self::spawn_listeners(&inner);
        Self { inner }
    }

    /// One listener task per reactive cell, registered so teardown is a
    /// plain abort. Tasks hold only a weak reference and die with the store.
    fn spawn_listeners(inner: &Arc<StoreInner<D>>) {
        let mut tasks = Vec::new();

        for (name, cell) in inner.resolver.cells() {
            let mut rx = cell.receiver();
            let name = name.clone();
            let weak = Arc::downgrade(inner);
            tasks.push(tokio::spawn(async move {
                let mut prev = rx.borrow().clone();
                while rx.changed().await.is_ok() {
                    let next = rx.borrow_and_update().clone();
                    if next == prev {
                        continue;
                    }
                    prev = next.clone();
                    let Some(inner) = Weak::upgrade(&weak) else {
                        break;
                    };
                    inner.resolver.set_value(&name, next);
                    QueryStore { inner }.on_param_change().await;
                }
            }));
        }

        if let EnabledSource::Reactive(cell) = &inner.config.enabled {
            let mut rx = cell.receiver();
            let weak = Arc::downgrade(inner);
            tasks.push(tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let next = *rx.borrow_and_update();
                    let Some(inner) = Weak::upgrade(&weak) else {
                        break;
                    };
                    QueryStore { inner }.set_enabled(next);
                }
            }));
        }

        inner.transient().listener_tasks = tasks;
    }

    /// Take a lifecycle subscription. The first subscriber (and any
    /// non-throttled later one) triggers a stale-check fetch.
    pub fn subscribe(&self) -> SubscriptionHandle<D> {
        match self.inner.subs.subscribe() {
            SubscribeEvent::First => {
                debug!("first subscriber, running stale check");
                self.spawn_stale_check();
            }
            SubscribeEvent::Subsequent { throttled: false } => self.spawn_stale_check(),
            SubscribeEvent::Subsequent { throttled: true } => {
                debug!("subscribe within throttle window, skipping stale check");
            }
        }
        SubscriptionHandle {
            inner: self.inner.clone(),
        }
    }

    fn spawn_stale_check(&self) {
        let store = self.clone();
        tokio::spawn(async move {
            store.fetch_with(None, FetchOptions::default()).await;
        });
    }

    /// Flip the engine on or off. Turning it on with live subscribers
    /// behaves like a first subscribe; turning it off is a hard stop.
    pub fn set_enabled(&self, enabled: bool) {
        let prev = self.inner.state.borrow().enabled;
        if prev == enabled {
            return;
        }
        self.inner.state.send_modify(|s| s.enabled = enabled);
        if enabled {
            if self.inner.subs.count() > 0 {
                self.spawn_stale_check();
            }
        } else {
            debug!("engine disabled, stopping timers and in-flight work");
            self.hard_stop();
        }
    }

    /// Restore defaults and recompute the query key from the currently
    /// resolved parameters. In-flight results arriving afterwards are
    /// discarded.
    pub fn reset(&self) {
        self.hard_stop();
        {
            let mut t = self.inner.transient();
            t.last_fetch_key = None;
            t.detached_retry_count = 0;
        }
        let params = self.inner.resolver.current();
        let key = query_key(&params);
        let enabled = self.inner.config.initial_enabled();
        self.inner
            .state
            .send_modify(|s| *s = QueryState::initial(enabled, key.clone()));
        debug!("store reset, query key {}", key);
    }

    fn hard_stop(&self) {
        let mut t = self.inner.transient();
        t.epoch += 1;
        if let Some(timer) = t.refetch_timer.take() {
            timer.abort();
        }
        if self.inner.config.abort_interrupted_fetches {
            if let Some(handle) = t.abort.take() {
                handle.abort();
            }
        } else {
            t.abort = None;
        }
        t.active_fetch = None;
    }

    /// Snapshot of the observable state.
    #[must_use]
    pub fn state(&self) -> QueryState<D> {
        self.inner.state.borrow().clone()
    }

    /// Change subscription over the observable state; receivers see each
    /// committed snapshot atomically.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<QueryState<D>> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.state.borrow().enabled
    }

    #[must_use]
    pub fn query_key(&self) -> String {
        self.inner.state.borrow().query_key.clone()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.count()
    }

    /// Cached data for the given params (current key when omitted), subject
    /// to expiry; under keep-previous-data, expiry is ignored.
    #[must_use]
    pub fn get_data(&self, params: Option<&ParamMap>) -> Option<D> {
        if self.inner.config.disable_cache {
            return None;
        }
        let state = self.inner.state.borrow();
        let key = match params {
            Some(p) => query_key(p),
            None => state.query_key.clone(),
        };
        let entry = state.query_cache.get(&key)?;
        if self.inner.config.keep_previous_data {
            return entry.data.clone();
        }
        let fetched_at = entry.last_fetched_at?;
        let now = self.inner.now_ms();
        if is_infinite(entry.cache_time_ms) || now - fetched_at <= entry.cache_time_ms {
            entry.data.clone()
        } else {
            None
        }
    }

    #[must_use]
    pub fn get_status(&self) -> StatusFlags {
        let state = self.inner.state.borrow();
        let fetched_at = if self.inner.config.disable_cache {
            state.last_fetched_at
        } else {
            state
                .query_cache
                .get(&state.query_key)
                .and_then(|e| e.last_fetched_at)
        };
        StatusFlags {
            is_error: state.status == QueryStatus::Error,
            is_fetching: state.status == QueryStatus::Loading,
            is_idle: state.status == QueryStatus::Idle,
            is_initial_loading: state.status == QueryStatus::Loading && fetched_at.is_none(),
            is_success: state.status == QueryStatus::Success,
        }
    }

    /// Whether the current key's data is older than the stale horizon. No
    /// recorded success reads as stale.
    #[must_use]
    pub fn is_stale(&self, stale_time: Option<Duration>) -> bool {
        let Some(fetched_at) = self.current_last_fetched_at() else {
            return true;
        };
        let stale_ms = duration_ms(stale_time.unwrap_or(self.inner.config.stale_time));
        if is_infinite(stale_ms) {
            return false;
        }
        self.inner.now_ms() - fetched_at >= stale_ms
    }

    /// Whether the current key's data has outlived its cache time. No
    /// recorded success reads as expired.
    #[must_use]
    pub fn is_data_expired(&self, cache_time: Option<Duration>) -> bool {
        let state = self.inner.state.borrow();
        let entry = if self.inner.config.disable_cache {
            None
        } else {
            state.query_cache.get(&state.query_key)
        };
        let fetched_at = match entry {
            Some(e) => e.last_fetched_at,
            None => state.last_fetched_at,
        };
        let Some(fetched_at) = fetched_at else {
            return true;
        };
        let cache_ms = match cache_time {
            Some(d) => duration_ms(d),
            None => match entry {
                Some(e) => e.cache_time_ms,
                None => {
                    let params = self.inner.resolver.current();
                    self.inner.config.cache_time.eval_ms(&params)
                }
            },
        };
        if is_infinite(cache_ms) {
            return false;
        }
        self.inner.now_ms() - fetched_at > cache_ms
    }

    /// Drop one cache entry (current key when omitted).
    pub fn remove_entry(&self, params: Option<&ParamMap>) -> bool {
        let key = match params {
            Some(p) => query_key(p),
            None => self.inner.state.borrow().query_key.clone(),
        };
        let mut removed = false;
        self.inner.state.send_modify(|s| {
            removed = s.query_cache.remove(&key).is_some();
        });
        removed
    }

    pub fn clear_cache(&self) {
        self.inner.state.send_modify(|s| s.query_cache.clear());
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        let now = self.inner.now_ms();
        let stale_ms = duration_ms(self.inner.config.stale_time);
        self.inner.state.borrow().query_cache.stats(now, stale_ms)
    }

    pub(crate) fn current_last_fetched_at(&self) -> Option<i64> {
        let state = self.inner.state.borrow();
        if self.inner.config.disable_cache {
            state.last_fetched_at
        } else {
            state
                .query_cache
                .get(&state.query_key)
                .and_then(|e| e.last_fetched_at)
        }
    }
}

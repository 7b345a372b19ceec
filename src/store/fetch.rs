//! The fetch coordinator: dedup, abort, freshness, commit, and the error
//! path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info};

use crate::config::{FetchOptions, SetDataArgs};
use crate::error::{Error, Result};

use super::clock::{duration_ms, is_infinite};
use super::entry::{CacheEntry, ErrorInfo};
use super::key::query_key;
use super::params::ParamMap;
use super::state::QueryStatus;
use super::{ActiveFetch, QueryStore, SharedFetch};

impl<D> QueryStore<D>
where
    D: Clone + Send + Sync + 'static,
{
    /// Fetch with the currently resolved parameters and default options.
    pub async fn fetch(&self) -> Option<D> {
        self.fetch_with(None, FetchOptions::default()).await
    }

    /// Run the query. Resolves to the transformed data or `None`; never
    /// fails outward — errors land in `state.error` and the cache entry.
    pub async fn fetch_with(&self, params: Option<ParamMap>, options: FetchOptions) -> Option<D> {
        let inner = &self.inner;

        if !options.force && !inner.state.borrow().enabled {
            if inner.config.debug_mode {
                debug!("fetch skipped, engine disabled");
            }
            return None;
        }

        let effective_params = params.unwrap_or_else(|| inner.resolver.current());
        let current_key = query_key(&effective_params);

        // Everything from the dedup check to active-fetch registration must
        // be atomic against concurrent callers; probes skip the gate along
        // with the bookkeeping it protects.
        let gate = if options.skip_store_updates {
            None
        } else {
            Some(inner.fetch_gate.lock().await)
        };

        // In-flight dedup: join the pending fetch for the same key.
        if !options.force
            && !options.skip_store_updates
            && inner.state.borrow().status == QueryStatus::Loading
        {
            let pending = {
                let t = inner.transient();
                t.active_fetch
                    .as_ref()
                    .filter(|active| active.key == current_key)
                    .map(|active| active.future.clone())
            };
            if let Some(future) = pending {
                debug!("⏳ dedup: joining in-flight fetch for {}", current_key);
                drop(gate);
                return future.await;
            }
        }

        // Any other fetch still in flight is superseded.
        if inner.config.abort_interrupted_fetches && !options.skip_store_updates {
            let superseded = inner.transient().abort.take();
            if let Some(handle) = superseded {
                debug!("🛑 aborting superseded fetch");
                handle.abort();
            }
        }

        if !options.force {
            if let Some(hit) = self.try_fresh_hit(&effective_params, &current_key, &options) {
                return hit;
            }
        }

        if !options.skip_store_updates {
            inner.state.send_modify(|s| {
                s.status = QueryStatus::Loading;
                s.error = None;
            });
        }

        let abort = if inner.config.abort_interrupted_fetches && !options.skip_store_updates {
            Some(super::AbortHandle::new())
        } else {
            None
        };

        let (fetch_id, epoch) = {
            let mut t = inner.transient();
            t.next_fetch_id += 1;
            if let Some(handle) = &abort {
                t.abort = Some(handle.clone());
            }
            (t.next_fetch_id, t.epoch)
        };

        if inner.config.debug_mode {
            debug!("🔄 FETCH START: {}", current_key);
        }

        let operation = run_fetch_operation(
            self.clone(),
            effective_params,
            current_key.clone(),
            options.clone(),
            abort,
            epoch,
            fetch_id,
        );
        let shared: SharedFetch<D> = operation.boxed().shared();

        if !options.skip_store_updates {
            inner.transient().active_fetch = Some(ActiveFetch {
                id: fetch_id,
                key: current_key,
                future: shared.clone(),
            });
        }

        // Drive the operation eagerly so it completes even when the caller
        // drops the returned future (timer callers, fire-and-forget).
        tokio::spawn({
            let future = shared.clone();
            async move {
                future.await;
            }
        });

        drop(gate);
        shared.await
    }

    /// Step 5 of the decision tree. `Some(hit)` short-circuits the fetch.
    fn try_fresh_hit(
        &self,
        params: &ParamMap,
        key: &str,
        options: &FetchOptions,
    ) -> Option<Option<D>> {
        let inner = &self.inner;
        let stale_ms = duration_ms(options.stale_time.unwrap_or(inner.config.stale_time));
        let now = inner.now_ms();
        let max_retries = inner.config.max_retries;

        let (fresh, data) = if inner.config.disable_cache {
            let (fetched_at, has_error) = {
                let state = inner.state.borrow();
                (state.last_fetched_at, state.error.is_some())
            };
            let unresolved =
                has_error && inner.transient().detached_retry_count < max_retries;
            let fresh = !unresolved
                && fetched_at.is_some_and(|at| is_infinite(stale_ms) || now - at < stale_ms);
            (fresh, None)
        } else {
            let state = inner.state.borrow();
            match state.query_cache.get(key) {
                Some(entry) => (
                    entry.is_fresh(now, stale_ms, max_retries),
                    entry.data.clone(),
                ),
                None => (false, None),
            }
        };

        if !fresh {
            return None;
        }

        debug!("🎯 cache hit for {}", key);
        if !inner.config.disable_auto_refetching && stale_ms > 0 && !is_infinite(stale_ms) {
            let timer_idle = inner.transient().refetch_timer.is_none();
            if timer_idle {
                self.schedule_next_fetch(params, options);
            }
        }
        if inner.config.keep_previous_data && inner.state.borrow().query_key != key {
            let key = key.to_string();
            inner.state.send_modify(|s| s.query_key = key);
        }
        Some(data)
    }

    /// Reactive parameter change: recompute the key, then re-run the query.
    pub(crate) async fn on_param_change(&self) {
        let params = self.inner.resolver.current();
        let key = query_key(&params);
        debug!("🔑 params changed, query key now {}", key);
        if !self.inner.config.keep_previous_data {
            let key = key.clone();
            self.inner.state.send_modify(|s| s.query_key = key);
        }
        self.inner.transient().detached_retry_count = 0;
        self.fetch_with(Some(params), FetchOptions::default()).await;
    }
}

async fn run_fetch_operation<D>(
    store: QueryStore<D>,
    params: ParamMap,
    key: String,
    options: FetchOptions,
    abort: Option<super::AbortHandle>,
    epoch: u64,
    fetch_id: u64,
) -> Option<D>
where
    D: Clone + Send + Sync + 'static,
{
    let result = match execute_fetcher(&store, &params, abort.as_ref()).await {
        Ok(raw) => apply_transform(&store, raw, &params),
        Err(err) => Err(err),
    };

    let out = match result {
        Err(Error::Aborted) => {
            debug!("🛑 fetch aborted for {}", key);
            None
        }
        Ok(data) => {
            if options.skip_store_updates {
                Some(data)
            } else {
                commit_success(&store, data, &params, &key, &options, epoch, abort.as_ref())
            }
        }
        Err(err) => {
            if options.skip_store_updates {
                error!("❌ probe fetch failed for {}: {}", key, err);
            } else {
                commit_error(&store, err, &params, &key, &options, epoch, abort.as_ref());
            }
            None
        }
    };

    if !options.skip_store_updates {
        let mut t = store.inner.transient();
        if t.active_fetch.as_ref().is_some_and(|a| a.id == fetch_id) {
            t.active_fetch = None;
        }
    }
    out
}

async fn execute_fetcher<D>(
    store: &QueryStore<D>,
    params: &ParamMap,
    abort: Option<&super::AbortHandle>,
) -> Result<D>
where
    D: Clone + Send + Sync + 'static,
{
    let fetcher = store.inner.config.fetcher.clone();
    match abort {
        Some(handle) => {
            let future = fetcher(params.clone(), Some(handle.clone()));
            tokio::select! {
                result = future => result,
                () = handle.aborted() => Err(Error::Aborted),
            }
        }
        None => fetcher(params.clone(), None).await,
    }
}

fn apply_transform<D>(store: &QueryStore<D>, raw: D, params: &ParamMap) -> Result<D>
where
    D: Clone + Send + Sync + 'static,
{
    let Some(transform) = &store.inner.config.transform else {
        return Ok(raw);
    };
    match catch_unwind(AssertUnwindSafe(|| transform(raw, params))) {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(Error::Aborted)) => Err(Error::Aborted),
        Ok(Err(err)) => Err(Error::Transform(err.to_string())),
        Err(_) => Err(Error::Transform("transform panicked".to_string())),
    }
}

/// A hard stop (reset, disable) or an abort between fetcher resolution and
/// commit means this result is already superseded.
fn commit_superseded<D>(
    store: &QueryStore<D>,
    epoch: u64,
    abort: Option<&super::AbortHandle>,
) -> bool
where
    D: Clone + Send + Sync + 'static,
{
    if store.inner.transient().epoch != epoch {
        debug!("discarding fetch result that arrived after a hard stop");
        return true;
    }
    if abort.is_some_and(super::AbortHandle::is_aborted) {
        debug!("discarding fetch result that lost its abort race");
        return true;
    }
    false
}

fn commit_success<D>(
    store: &QueryStore<D>,
    data: D,
    params: &ParamMap,
    key: &str,
    options: &FetchOptions,
    epoch: u64,
    abort: Option<&super::AbortHandle>,
) -> Option<D>
where
    D: Clone + Send + Sync + 'static,
{
    let inner = &store.inner;
    if commit_superseded(store, epoch, abort) {
        return None;
    }

    let now = inner.now_ms();
    let cache_ms = options
        .cache_time
        .map(duration_ms)
        .unwrap_or_else(|| inner.config.cache_time.eval_ms(params));

    // Data placement is decided outside the state update so a `set_data`
    // callback can freely read other stores.
    let entry_data = match &inner.config.set_data {
        Some(set_data) => {
            let call = catch_unwind(AssertUnwindSafe(|| {
                set_data(SetDataArgs {
                    data: &data,
                    params,
                    query_key: key,
                });
            }));
            if call.is_err() {
                error!("set_data callback panicked for {}", key);
            }
            None
        }
        None => Some(data.clone()),
    };

    let previous_key = inner.state.borrow().query_key.clone();
    inner.state.send_modify(|s| {
        s.status = QueryStatus::Success;
        s.error = None;
        if inner.config.disable_cache {
            s.last_fetched_at = Some(now);
        } else {
            s.query_cache.insert(
                key.to_string(),
                CacheEntry {
                    cache_time_ms: cache_ms,
                    data: entry_data.clone(),
                    last_fetched_at: Some(now),
                    error_info: None,
                },
            );
            if !is_infinite(cache_ms) {
                let exempt: Vec<&str> = if inner.config.keep_previous_data {
                    vec![key, previous_key.as_str()]
                } else {
                    vec![key]
                };
                s.query_cache.prune(now, &exempt);
            }
        }
        if inner.config.keep_previous_data {
            s.query_key = key.to_string();
        }
    });

    info!("✅ FETCH SUCCESS: {}", key);
    {
        let mut t = inner.transient();
        t.last_fetch_key = Some(key.to_string());
        t.detached_retry_count = 0;
    }
    store.schedule_next_fetch(params, options);

    if let Some(on_fetched) = &inner.config.on_fetched {
        let call = catch_unwind(AssertUnwindSafe(|| on_fetched(&data, params)));
        if call.is_err() {
            error!("on_fetched callback panicked for {}", key);
        }
    }

    Some(data)
}

fn commit_error<D>(
    store: &QueryStore<D>,
    err: Error,
    params: &ParamMap,
    key: &str,
    options: &FetchOptions,
    epoch: u64,
    abort: Option<&super::AbortHandle>,
) where
    D: Clone + Send + Sync + 'static,
{
    let inner = &store.inner;
    if commit_superseded(store, epoch, abort) {
        return;
    }

    let attempt = if inner.config.disable_cache {
        inner.transient().detached_retry_count
    } else {
        inner
            .state
            .borrow()
            .query_cache
            .get(key)
            .map_or(0, CacheEntry::retry_count)
    };

    if let Some(on_error) = &inner.config.on_error {
        let call = catch_unwind(AssertUnwindSafe(|| on_error(&err, attempt)));
        if call.is_err() {
            error!("on_error callback panicked for {}", key);
        }
    }

    // Capped at the budget: an exhausted key that fails again on a manual
    // or resubscribe-triggered fetch keeps its counter at max_retries.
    // max_retries == 0 still records 1.
    let retry_count = (attempt + 1).min(inner.config.max_retries.max(1));
    let budget_left = retry_count < inner.config.max_retries;
    if budget_left && inner.subs.count() > 0 {
        let delay = inner.config.retry_delay.eval(attempt, &err);
        if delay != Duration::MAX {
            debug!(
                "🔁 retry {}/{} for {} in {:?}",
                retry_count, inner.config.max_retries, key, delay
            );
            store.schedule_retry(params.clone(), delay);
        }
    }

    let now = inner.now_ms();
    let message = err.to_string();
    let is_transform = matches!(err, Error::Transform(_));
    let cache_ms = options
        .cache_time
        .map(duration_ms)
        .unwrap_or_else(|| inner.config.cache_time.eval_ms(params));
    let shared_err = Arc::new(err);

    inner.state.send_modify(|s| {
        s.status = QueryStatus::Error;
        s.error = Some(shared_err.clone());
        if !inner.config.disable_cache {
            let entry = s
                .query_cache
                .entry_or_insert_with(key, || CacheEntry::empty(cache_ms));
            entry.error_info = Some(ErrorInfo {
                message: message.clone(),
                last_failed_at: now,
                retry_count,
            });
        }
    });
    if inner.config.disable_cache {
        inner.transient().detached_retry_count = retry_count;
    }

    if is_transform {
        error!("❌ transform failed for {}: {}", key, shared_err);
    } else {
        error!("❌ FETCH FAILED: {} (attempt {}): {}", key, retry_count, shared_err);
    }
}

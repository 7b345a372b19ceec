//! Store configuration: the closed option set, its defaults, and the
//! per-fetch option overrides.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{Error, Result};
use crate::signal::AttachValue;
use crate::store::abort::AbortHandle;
use crate::store::clock::{duration_ms, Clock, SystemClock};
use crate::store::params::{EnabledSource, ParamMap, ParamSource, ParamValue};
use crate::store::persist::Storage;

/// Default entry lifetime: 7 days.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default staleness horizon: 2 minutes.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(2 * 60);

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Stale times below this trigger a warning unless suppressed.
pub const STALE_TIME_WARN_FLOOR: Duration = Duration::from_secs(5);

/// Subscriptions landing within this window of the previous one skip the
/// stale-check fetch.
pub const SUBSCRIBE_THROTTLE_WINDOW: Duration = Duration::from_millis(500);

const _: () = {
    assert!(DEFAULT_CACHE_TIME.as_millis() > 0, "cache time must be positive");
    assert!(DEFAULT_STALE_TIME.as_millis() > 0, "stale time must be positive");
    assert!(DEFAULT_RETRY_DELAY.as_millis() > 0, "retry delay must be positive");
    assert!(
        SUBSCRIBE_THROTTLE_WINDOW.as_millis() < STALE_TIME_WARN_FLOOR.as_millis(),
        "throttle window must sit below the stale-time warning floor"
    );
};

pub type FetcherFn<D> =
    Arc<dyn Fn(ParamMap, Option<AbortHandle>) -> BoxFuture<'static, Result<D>> + Send + Sync>;
pub type TransformFn<D> = Arc<dyn Fn(D, &ParamMap) -> Result<D> + Send + Sync>;
pub type OnFetchedFn<D> = Arc<dyn Fn(&D, &ParamMap) + Send + Sync>;
pub type OnErrorFn = Arc<dyn Fn(&Error, u32) + Send + Sync>;
pub type SetDataFn<D> = Arc<dyn Fn(SetDataArgs<'_, D>) + Send + Sync>;
pub type PartializeUserFn = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Arguments handed to a `set_data` callback, which then owns data
/// placement; the engine only records a metadata entry.
#[derive(Debug)]
pub struct SetDataArgs<'a, D> {
    pub data: &'a D,
    pub params: &'a ParamMap,
    pub query_key: &'a str,
}

/// Entry lifetime: a constant, or derived from the parameters at write time.
#[derive(Clone)]
pub enum CacheTime {
    Fixed(Duration),
    PerParams(Arc<dyn Fn(&ParamMap) -> Duration + Send + Sync>),
}

impl CacheTime {
    pub(crate) fn eval_ms(&self, params: &ParamMap) -> i64 {
        match self {
            Self::Fixed(duration) => duration_ms(*duration),
            Self::PerParams(f) => duration_ms(f(params)),
        }
    }
}

impl From<Duration> for CacheTime {
    fn from(duration: Duration) -> Self {
        Self::Fixed(duration)
    }
}

impl std::fmt::Debug for CacheTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::PerParams(_) => f.write_str("PerParams(..)"),
        }
    }
}

/// Delay before the next retry: a constant, or derived from the attempt
/// number and the error.
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    Backoff(Arc<dyn Fn(u32, &Error) -> Duration + Send + Sync>),
}

impl RetryDelay {
    pub(crate) fn eval(&self, retry_count: u32, err: &Error) -> Duration {
        match self {
            Self::Fixed(duration) => *duration,
            Self::Backoff(f) => f(retry_count, err),
        }
    }
}

impl From<Duration> for RetryDelay {
    fn from(duration: Duration) -> Self {
        Self::Fixed(duration)
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Backoff(_) => f.write_str("Backoff(..)"),
        }
    }
}

/// Full configuration of one query store. Built from a mandatory fetcher
/// plus chained setters.
#[derive(Clone)]
pub struct QueryConfig<D> {
    pub(crate) fetcher: FetcherFn<D>,
    pub(crate) transform: Option<TransformFn<D>>,
    pub(crate) on_fetched: Option<OnFetchedFn<D>>,
    pub(crate) on_error: Option<OnErrorFn>,
    pub(crate) set_data: Option<SetDataFn<D>>,
    pub(crate) params: BTreeMap<String, ParamSource>,
    pub(crate) enabled: EnabledSource,
    pub(crate) cache_time: CacheTime,
    pub(crate) stale_time: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retry_delay: RetryDelay,
    pub(crate) abort_interrupted_fetches: bool,
    pub(crate) disable_auto_refetching: bool,
    pub(crate) disable_cache: bool,
    pub(crate) keep_previous_data: bool,
    pub(crate) suppress_stale_time_warning: bool,
    pub(crate) debug_mode: bool,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) storage: Option<(Arc<dyn Storage>, String)>,
    pub(crate) partialize_user: Option<PartializeUserFn>,
}

impl<D> QueryConfig<D> {
    /// Configure a store around its fetcher. The fetcher receives the
    /// resolved parameter map and, when interrupted fetches are abortable, a
    /// handle it can observe or trip itself.
    pub fn new<F, Fut>(fetcher: F) -> Self
    where
        F: Fn(ParamMap, Option<AbortHandle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D>> + Send + 'static,
    {
        Self {
            fetcher: Arc::new(move |params, abort| fetcher(params, abort).boxed()),
            transform: None,
            on_fetched: None,
            on_error: None,
            set_data: None,
            params: BTreeMap::new(),
            enabled: EnabledSource::default(),
            cache_time: CacheTime::Fixed(DEFAULT_CACHE_TIME),
            stale_time: DEFAULT_STALE_TIME,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: RetryDelay::Fixed(DEFAULT_RETRY_DELAY),
            abort_interrupted_fetches: true,
            disable_auto_refetching: false,
            disable_cache: false,
            keep_previous_data: false,
            suppress_stale_time_warning: false,
            debug_mode: false,
            clock: Arc::new(SystemClock),
            storage: None,
            partialize_user: None,
        }
    }

    /// Add a static parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params
            .insert(name.into(), ParamSource::Static(value.into()));
        self
    }

    /// Add a reactive parameter; changes to the cell re-run the query.
    #[must_use]
    pub fn reactive_param(
        mut self,
        name: impl Into<String>,
        cell: AttachValue<ParamValue>,
    ) -> Self {
        self.params
            .insert(name.into(), ParamSource::Reactive(cell));
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: impl Into<EnabledSource>) -> Self {
        self.enabled = enabled.into();
        self
    }

    #[must_use]
    pub fn transform(
        mut self,
        transform: impl Fn(D, &ParamMap) -> Result<D> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    #[must_use]
    pub fn on_fetched(mut self, callback: impl Fn(&D, &ParamMap) + Send + Sync + 'static) -> Self {
        self.on_fetched = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_error(mut self, callback: impl Fn(&Error, u32) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Take over data placement; the engine keeps only entry metadata.
    #[must_use]
    pub fn set_data(
        mut self,
        callback: impl Fn(SetDataArgs<'_, D>) + Send + Sync + 'static,
    ) -> Self {
        self.set_data = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn cache_time(mut self, cache_time: impl Into<CacheTime>) -> Self {
        self.cache_time = cache_time.into();
        self
    }

    /// Per-parameter cache time, evaluated once at cache-write time.
    #[must_use]
    pub fn cache_time_fn(
        mut self,
        f: impl Fn(&ParamMap) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.cache_time = CacheTime::PerParams(Arc::new(f));
        self
    }

    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = retry_delay.into();
        self
    }

    #[must_use]
    pub fn retry_delay_fn(
        mut self,
        f: impl Fn(u32, &Error) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.retry_delay = RetryDelay::Backoff(Arc::new(f));
        self
    }

    #[must_use]
    pub fn abort_interrupted_fetches(mut self, abort: bool) -> Self {
        self.abort_interrupted_fetches = abort;
        self
    }

    #[must_use]
    pub fn disable_auto_refetching(mut self, disable: bool) -> Self {
        self.disable_auto_refetching = disable;
        self
    }

    #[must_use]
    pub fn disable_cache(mut self, disable: bool) -> Self {
        self.disable_cache = disable;
        self
    }

    #[must_use]
    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    #[must_use]
    pub fn suppress_stale_time_warning(mut self, suppress: bool) -> Self {
        self.suppress_stale_time_warning = suppress;
        self
    }

    #[must_use]
    pub fn debug_mode(mut self, debug: bool) -> Self {
        self.debug_mode = debug;
        self
    }

    /// Override the wall-clock source (tests drive expiry with a manual
    /// clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bind a persistence adapter and slot name for
    /// `partialize`/`persist`/`rehydrate`.
    #[must_use]
    pub fn storage(mut self, adapter: Arc<dyn Storage>, slot: impl Into<String>) -> Self {
        self.storage = Some((adapter, slot.into()));
        self
    }

    /// Contribute a user section to the persisted projection.
    #[must_use]
    pub fn partialize_user(
        mut self,
        f: impl Fn() -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.partialize_user = Some(Arc::new(f));
        self
    }

    pub(crate) fn initial_enabled(&self) -> bool {
        self.enabled.current()
    }
}

/// Per-call overrides for `fetch_with`.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Skip the disabled check, in-flight dedup, and the freshness check.
    pub force: bool,
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    /// Parallel probe: run the fetcher without touching dedup, abort, state,
    /// or cache.
    pub skip_store_updates: bool,
}

impl FetchOptions {
    #[must_use]
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn probe() -> Self {
        Self {
            skip_store_updates: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config: QueryConfig<i32> = QueryConfig::new(|_, _| async { Ok(1) });
        assert_eq!(config.stale_time, DEFAULT_STALE_TIME);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert!(config.abort_interrupted_fetches);
        assert!(!config.disable_cache);
        assert!(!config.keep_previous_data);
        assert!(config.initial_enabled());
    }

    #[test]
    fn test_cache_time_eval() {
        let fixed = CacheTime::from(Duration::from_secs(1));
        assert_eq!(fixed.eval_ms(&ParamMap::new()), 1_000);

        let per_params = CacheTime::PerParams(Arc::new(|params: &ParamMap| {
            if params.contains_key("long") {
                Duration::from_secs(60)
            } else {
                Duration::from_secs(1)
            }
        }));
        let mut params = ParamMap::new();
        params.insert("long".to_string(), json!(true));
        assert_eq!(per_params.eval_ms(&params), 60_000);
    }

    #[test]
    fn test_retry_delay_backoff() {
        let delay = RetryDelay::Backoff(Arc::new(|attempt, _err| {
            Duration::from_millis(10 * 2_u64.pow(attempt))
        }));
        assert_eq!(delay.eval(0, &Error::fetch("x")), Duration::from_millis(10));
        assert_eq!(delay.eval(2, &Error::fetch("x")), Duration::from_millis(40));
    }

    #[test]
    fn test_fetch_options_shorthands() {
        assert!(FetchOptions::forced().force);
        assert!(FetchOptions::probe().skip_store_updates);
        assert!(!FetchOptions::default().force);
    }
}

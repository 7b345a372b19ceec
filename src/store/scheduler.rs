//! Refetch and retry timers.
//!
//! One slot holds whichever timer is pending; scheduling anything cancels
//! what was there. Timer tasks hold a weak store reference and re-verify
//! enablement and audience at fire time, since both can change during the
//! delay.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::debug;

use crate::config::FetchOptions;

use super::clock::{duration_ms, is_infinite};
use super::key::query_key;
use super::params::ParamMap;
use super::{QueryStore, StoreInner};

impl<D> QueryStore<D>
where
    D: Clone + Send + Sync + 'static,
{
    /// Arm the refetch timer for the moment the given params go stale.
    pub(crate) fn schedule_next_fetch(&self, params: &ParamMap, options: &FetchOptions) {
        let inner = &self.inner;
        if inner.config.disable_auto_refetching {
            return;
        }
        let stale_ms = duration_ms(options.stale_time.unwrap_or(inner.config.stale_time));
        if stale_ms <= 0 || is_infinite(stale_ms) {
            return;
        }

        let key = query_key(params);
        let fetched_at = {
            let state = inner.state.borrow();
            if inner.config.disable_cache {
                state.last_fetched_at
            } else {
                state.query_cache.get(&key).and_then(|e| e.last_fetched_at)
            }
        };
        let now = inner.now_ms();
        let delay_ms = match fetched_at {
            Some(at) => (stale_ms - (now - at)).max(0),
            None => stale_ms,
        };
        #[allow(clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);

        if inner.config.debug_mode {
            debug!("⏰ next refetch for {} in {:?}", key, delay);
        }
        self.arm_timer(delay, params.clone());
    }

    /// Arm the retry timer. Replaces any pending refetch.
    pub(crate) fn schedule_retry(&self, params: ParamMap, delay: Duration) {
        self.arm_timer(delay, params);
    }

    fn arm_timer(&self, delay: Duration, params: ParamMap) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(weak, params).await;
        });
        let mut t = self.inner.transient();
        if let Some(old) = t.refetch_timer.replace(handle) {
            old.abort();
        }
    }
}

async fn fire<D>(weak: Weak<StoreInner<D>>, params: ParamMap)
where
    D: Clone + Send + Sync + 'static,
{
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if !inner.state.borrow().enabled || inner.subs.count() == 0 {
        debug!("⏰ timer fired with no audience, skipping");
        return;
    }
    let store = QueryStore { inner };
    store.fetch_with(Some(params), FetchOptions::forced()).await;
}

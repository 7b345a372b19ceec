//! Subscriber counting and lifecycle events.
//!
//! The manager only counts; what to do on each transition (first subscribe,
//! throttled subscribe, last release) is the coordinator's call. Rapid
//! successive subscriptions are flagged for throttling so a screenful of
//! selectors mounting at once does not trigger a refetch storm.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use crate::config::SUBSCRIBE_THROTTLE_WINDOW;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscribeEvent {
    /// Count went 0 → 1.
    First,
    /// Count was already positive; `throttled` when this subscription landed
    /// within the throttle window of the previous one.
    Subsequent { throttled: bool },
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionManager {
    inner: Mutex<SubInner>,
}

#[derive(Debug, Default)]
struct SubInner {
    count: usize,
    last_subscribe_at: Option<Instant>,
}

impl SubscriptionManager {
    pub(crate) fn subscribe(&self) -> SubscribeEvent {
        let mut inner = self.lock();
        let now = Instant::now();
        let event = if inner.count == 0 {
            SubscribeEvent::First
        } else {
            let throttled = inner
                .last_subscribe_at
                .is_some_and(|at| now.duration_since(at) < SUBSCRIBE_THROTTLE_WINDOW);
            SubscribeEvent::Subsequent { throttled }
        };
        inner.count += 1;
        inner.last_subscribe_at = Some(now);
        event
    }

    /// Returns the remaining count; zero means the last subscriber released.
    pub(crate) fn release(&self) -> usize {
        let mut inner = self.lock();
        inner.count = inner.count.saturating_sub(1);
        inner.count
    }

    pub(crate) fn count(&self) -> usize {
        self.lock().count
    }

    fn lock(&self) -> MutexGuard<'_, SubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn age_last_subscribe(&self, by: std::time::Duration) {
        let mut inner = self.lock();
        if let Some(at) = inner.last_subscribe_at {
            inner.last_subscribe_at = at.checked_sub(by);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_count_transitions() {
        let subs = SubscriptionManager::default();
        assert_eq!(subs.count(), 0);

        assert_eq!(subs.subscribe(), SubscribeEvent::First);
        assert_eq!(subs.count(), 1);

        subs.subscribe();
        assert_eq!(subs.count(), 2);

        assert_eq!(subs.release(), 1);
        assert_eq!(subs.release(), 0);
        assert_eq!(subs.count(), 0);

        // releasing an already-empty manager stays at zero
        assert_eq!(subs.release(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_after_drain_is_first_again() {
        let subs = SubscriptionManager::default();
        subs.subscribe();
        subs.release();
        assert_eq!(subs.subscribe(), SubscribeEvent::First);
    }

    #[tokio::test]
    async fn test_rapid_subsequent_subscribe_is_throttled() {
        let subs = SubscriptionManager::default();
        subs.subscribe();
        assert_eq!(
            subs.subscribe(),
            SubscribeEvent::Subsequent { throttled: true }
        );
    }

    #[tokio::test]
    async fn test_spaced_subsequent_subscribe_is_not_throttled() {
        let subs = SubscriptionManager::default();
        subs.subscribe();
        subs.age_last_subscribe(Duration::from_secs(1));
        assert_eq!(
            subs.subscribe(),
            SubscribeEvent::Subsequent { throttled: false }
        );
    }
}

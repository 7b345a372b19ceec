//! One-shot cancellation token shared with the fetcher.

use tokio_util::sync::CancellationToken;

/// Cooperative abort handle for an in-flight fetch.
///
/// The coordinator races the fetcher against [`AbortHandle::aborted`]; a
/// fetcher may also observe [`AbortHandle::is_aborted`] to bail out early, or
/// call [`AbortHandle::abort`] itself to cancel its own operation.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the handle has been aborted.
    pub async fn aborted(&self) {
        self.token.cancelled().await;
    }
}

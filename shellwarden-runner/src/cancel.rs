//! Composite cancellation for bounded runs.
//!
//! A run is cancelled either by the caller's token or by its deadline. Both
//! feed one child token handed to the engine; whichever fires first records
//! its [`CancelReason`] so the outcome never has to be inferred afterwards.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::CancelReason;

pub struct ExecutionCancellation {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    watcher: Option<JoinHandle<()>>,
}

impl ExecutionCancellation {
    /// Merge `caller` with a timer that fires after `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(caller: CancellationToken, timeout: Duration) -> Self {
        let token = CancellationToken::new();
        let reason = Arc::new(OnceLock::new());

        let watcher = tokio::spawn({
            let token = token.clone();
            let reason = Arc::clone(&reason);
            async move {
                let fired = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    _ = caller.cancelled() => Some(CancelReason::Caller),
                    _ = tokio::time::sleep(timeout) => Some(CancelReason::Timeout),
                };
                if let Some(fired) = fired {
                    let _ = reason.set(fired);
                    token.cancel();
                }
            }
        });

        Self {
            token,
            reason,
            watcher: Some(watcher),
        }
    }

    /// Token to pass to the engine.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Which source fired, if any.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Stop watching both sources without cancelling. Safe to call repeatedly.
    pub fn disarm(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for ExecutionCancellation {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_with_timeout_reason() {
        let caller = CancellationToken::new();
        let cancellation = ExecutionCancellation::new(caller.clone(), Duration::from_millis(50));
        let token = cancellation.token();

        token.cancelled().await;
        assert_eq!(cancellation.reason(), Some(CancelReason::Timeout));
        assert!(!caller.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancel_wins_before_deadline() {
        let caller = CancellationToken::new();
        let cancellation = ExecutionCancellation::new(caller.clone(), Duration::from_secs(60));
        let token = cancellation.token();

        caller.cancel();
        token.cancelled().await;
        assert_eq!(cancellation.reason(), Some(CancelReason::Caller));
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_caller_is_reported_as_caller() {
        let caller = CancellationToken::new();
        caller.cancel();
        let cancellation = ExecutionCancellation::new(caller, Duration::ZERO);
        cancellation.token().cancelled().await;
        assert_eq!(cancellation.reason(), Some(CancelReason::Caller));
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_watcher_never_fires() {
        let caller = CancellationToken::new();
        let mut cancellation =
            ExecutionCancellation::new(caller.clone(), Duration::from_millis(10));
        let token = cancellation.token();
        cancellation.disarm();
        cancellation.disarm();

        tokio::time::sleep(Duration::from_millis(100)).await;
        caller.cancel();
        tokio::task::yield_now().await;
        assert!(!token.is_cancelled());
        assert_eq!(cancellation.reason(), None);
    }
}

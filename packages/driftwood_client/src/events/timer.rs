//! Cancellable single-shot timer for reconnect backoff.
//!
//! Schedule returns a handle; cancelling the handle before the deadline
//! guarantees the callback never runs. Tests drive the deadline with tokio's
//! paused clock instead of wall time.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Handle to a scheduled callback. Dropping the handle does NOT cancel the
/// timer; call [`TimerHandle::cancel`].
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Run `callback` once after `delay`, unless the returned handle is cancelled
/// first. Must be called from within a tokio runtime.
pub fn schedule_once(delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerHandle {
    let token = CancellationToken::new();
    let guard = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            // Cancellation wins over a simultaneously elapsed deadline.
            biased;
            _ = guard.cancelled() => {}
            _ = tokio::time::sleep(delay) => callback(),
        }
    });
    TimerHandle { token }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counted = fired.clone();
        let _handle = schedule_once(Duration::from_secs(2), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(1999)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counted = fired.clone();
        let handle = schedule_once(Duration::from_secs(1), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

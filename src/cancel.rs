//! Cooperative cancellation
//!
//! Every externally triggered operation accepts a deadline/cancellation
//! handle (spec §5). There is no cancellation crate in the existing
//! dependency set, so this is a thin newtype over `tokio::sync::Notify`,
//! in the same spirit as the `AtomicBool` schema-change flag in
//! `InboundRelationshipCache`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Runs `fut` to completion unless `token` cancels or `deadline` elapses
/// first, in which case `Err(Canceled)` is returned per spec §5.
pub async fn run_cancellable<T, F>(
    token: &CancellationToken,
    deadline: Option<Duration>,
    fut: F,
) -> Result<T, Canceled>
where
    F: Future<Output = T>,
{
    tokio::pin!(fut);
    let cancel_wait = token.cancelled();
    tokio::pin!(cancel_wait);

    match deadline {
        Some(d) => tokio::select! {
            res = &mut fut => Ok(res),
            _ = &mut cancel_wait => Err(Canceled),
            _ = tokio::time::sleep(d) => Err(Canceled),
        },
        None => tokio::select! {
            res = &mut fut => Ok(res),
            _ = &mut cancel_wait => Err(Canceled),
        },
    }
}

/// Wraps `fut` with a plain timeout, used for internal fan-out that inherits
/// a parent deadline without its own cancellation token (spec §5).
pub async fn with_timeout<T, F>(deadline: Option<Duration>, fut: F) -> Result<T, Canceled>
where
    F: Future<Output = T>,
{
    match deadline {
        Some(d) => timeout(d, fut).await.map_err(|_| Canceled),
        None => Ok(fut.await),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_short_circuits_a_pending_future() {
        let token = CancellationToken::new();
        let token2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            token2.cancel();
        });
        let result =
            run_cancellable(&token, None, async { tokio::time::sleep(Duration::from_secs(10)).await }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn uncancelled_future_completes_normally() {
        let token = CancellationToken::new();
        let result = run_cancellable(&token, None, async { 42 }).await;
        assert_eq!(result, Ok(42));
    }
}

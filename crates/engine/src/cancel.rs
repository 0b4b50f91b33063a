//! A cheap, dependency-free cancel signal. The reference pack does not
//! carry `tokio-util` anywhere the engine crate would see it, so rather
//! than add it solely for `CancellationToken` we hand-roll the same shape
//! on top of `Notify` + `AtomicBool`: observe-once, fire-many, clone-and-share.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Resolves immediately if already cancelled, otherwise waits for the
    /// next `cancel()` call. Safe to race inside `tokio::select!`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }

    /// A token derived from this one: cancelling the child does not
    /// cancel the parent, and cancelling the parent is not automatically
    /// observed either — callers (e.g. sub-workflow recursion) must forward
    /// it explicitly. Kept this way (rather than a linked tree) because the
    /// only place propagation matters is parent -> child sub-workflow
    /// recursion, which always happens under one executor's `select!`.
    pub fn child(&self) -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await.expect("should not block");
    }

    #[tokio::test]
    async fn cancelled_resolves_once_cancel_is_called() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), handle).await.unwrap().unwrap();
    }

    #[test]
    fn double_cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}

//! Coalescing queue of restart requests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Restart requests folded onto a single pending permit.
///
/// Any number of requests made while a restart is already running result in
/// exactly one follow-up restart.
#[derive(Debug, Clone, Default)]
pub(crate) struct RestartQueue {
    notify: Arc<Notify>,
    requested: Arc<AtomicUsize>,
}

impl RestartQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Wait for a pending request. Returns how many requests it stands for.
    pub async fn next(&self) -> usize {
        loop {
            self.notify.notified().await;
            let pending = self.requested.swap(0, Ordering::SeqCst);
            if pending > 0 {
                return pending;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_requests_coalesce() {
        let queue = RestartQueue::new();
        queue.request();
        queue.request();
        queue.request();

        assert_eq!(queue.next().await, 3);
        let second = tokio::time::timeout(Duration::from_secs(5), queue.next()).await;
        assert!(second.is_err(), "a burst yields one restart");
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_during_restart_yields_one_follow_up() {
        let queue = RestartQueue::new();
        queue.request();
        assert_eq!(queue.next().await, 1);

        // Restart in progress; more triggers arrive.
        let trigger = queue.clone();
        tokio::spawn(async move {
            for _ in 0..4 {
                trigger.request();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(queue.next().await, 4);
        assert!(tokio::time::timeout(Duration::from_secs(5), queue.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_waiter_woken_by_later_request() {
        let queue = RestartQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.request();
        assert_eq!(waiter.await.unwrap(), 1);
    }
}

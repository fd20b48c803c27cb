//! Graceful stop for a slave generation.
//!
//! A slave is asked to stop by its master (restart signal or `SIGTERM`).
//! The stop token tells the program to stop accepting; `ConnectionGuard`s
//! let the slave wait for in-flight work before it exits. The master's
//! terminate timeout is the hard backstop, so draining here is bounded by
//! the same duration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// In-flight work counter, with a wakeup for the transition to idle.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> Arc<Ticket> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Arc::new(Ticket(Arc::clone(self)))
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn until_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.current() == 0 {
                return;
            }
            idle.await;
        }
    }
}

struct Ticket(Arc<InFlight>);

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Tracks one in-flight unit of work. Drop it when the work completes.
///
/// Clones share the same slot.
#[derive(Clone)]
pub struct ConnectionGuard {
    _ticket: Arc<Ticket>,
}

/// Stop coordinator shared between the slave runtime and the program.
#[derive(Clone, Debug)]
pub struct GracefulShutdown {
    stop: CancellationToken,
    in_flight: Arc<InFlight>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            stop: CancellationToken::new(),
            in_flight: Arc::default(),
            drain_timeout,
        }
    }

    /// Token cancelled when the program should stop accepting connections.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Resolves once a graceful stop has been requested.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Register an in-flight connection. The count drops with the guard.
    pub fn connection_guard(&self) -> ConnectionGuard {
        ConnectionGuard {
            _ticket: self.in_flight.enter(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.in_flight.current()
    }

    /// Request a graceful stop.
    pub fn trigger_stop(&self) {
        self.stop.cancel();
    }

    /// Wait for every guard to drop, bounded by the drain timeout.
    ///
    /// Returns `false` if guards were still held when the timeout expired.
    pub async fn drain(&self) -> bool {
        let active = self.active_connections();
        if active == 0 {
            return true;
        }
        info!(
            active_connections = active,
            timeout_secs = self.drain_timeout.as_secs(),
            "Waiting for in-flight work"
        );

        match tokio::time::timeout(self.drain_timeout, self.in_flight.until_idle()).await {
            Ok(()) => {
                info!("In-flight work finished");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.active_connections(),
                    timeout_secs = self.drain_timeout.as_secs(),
                    "Gave up waiting for in-flight work"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_drain() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let stop_token = shutdown.stop_token();

        let guard1 = shutdown.connection_guard();
        let guard2 = shutdown.connection_guard();
        assert_eq!(shutdown.active_connections(), 2);

        shutdown.trigger_stop();
        assert!(stop_token.is_cancelled());
        assert!(shutdown.is_stopping());

        let drainer = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.drain().await })
        };

        drop(guard1);
        drop(guard2);
        assert!(drainer.await.unwrap());
        assert_eq!(shutdown.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout() {
        let shutdown = GracefulShutdown::new(Duration::from_millis(100));
        let _guard = shutdown.connection_guard();

        shutdown.trigger_stop();

        assert!(!shutdown.drain().await);
        assert_eq!(shutdown.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_trigger() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(1));
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.stopped().await })
        };
        shutdown.trigger_stop();
        waiter.await.unwrap();
    }

    #[test]
    fn test_cloned_guards_count_once() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(1));
        let guard = shutdown.connection_guard();
        let clone = guard.clone();
        assert_eq!(shutdown.active_connections(), 1);
        drop(guard);
        assert_eq!(shutdown.active_connections(), 1);
        drop(clone);
        assert_eq!(shutdown.active_connections(), 0);
    }
}

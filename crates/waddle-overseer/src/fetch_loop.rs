//! The master's polling loop around a [`Fetcher`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Verbosity;
use crate::fetcher::{Fetched, Fetcher};
use crate::restart::RestartQueue;
use crate::upgrade::{UpgradeOutcome, Upgrader};

pub(crate) struct FetchLoop {
    pub fetcher: Box<dyn Fetcher>,
    pub upgrader: Arc<Upgrader>,
    /// Two attempts never start closer together than this.
    pub min_interval: Duration,
    /// Where to queue a restart after an upgrade. `None` disables it.
    pub restarts: Option<RestartQueue>,
    pub verbosity: Verbosity,
}

impl FetchLoop {
    pub async fn run(mut self, stopping: CancellationToken) {
        if let Err(e) = self.fetcher.init().await {
            if self.verbosity.warn {
                warn!(error = %e, "Fetcher failed to initialize, upgrades disabled");
            }
            return;
        }

        loop {
            let started = Instant::now();
            tokio::select! {
                _ = stopping.cancelled() => return,
                _ = self.attempt() => {}
            }
            tokio::select! {
                _ = stopping.cancelled() => return,
                _ = sleep_until(started + self.min_interval) => {}
            }
        }
    }

    async fn attempt(&mut self) {
        let mut image = match self.fetcher.fetch().await {
            Ok(Fetched::Unchanged) => return,
            Ok(Fetched::Binary(image)) => image,
            Err(e) => {
                if self.verbosity.warn {
                    warn!(error = %e, "Fetch failed");
                }
                return;
            }
        };

        match self.upgrader.apply(&mut image).await {
            Ok(UpgradeOutcome::Unchanged) => {}
            Ok(UpgradeOutcome::Upgraded(binary)) => match &self.restarts {
                Some(restarts) => {
                    info!(generation = binary.generation, "Upgraded binary, restarting slave");
                    restarts.request();
                }
                None => {
                    if self.verbosity.debug {
                        debug!(
                            generation = binary.generation,
                            "Upgraded binary, restart after fetch disabled"
                        );
                    }
                }
            },
            Err(e) => error!(error = %e, "Upgrade failed, keeping current binary"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::upgrade::BinaryIdentity;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    enum Step {
        Unchanged,
        Image(&'static str),
        Fail,
    }

    struct Scripted {
        steps: VecDeque<Step>,
        calls: Arc<Mutex<Vec<Instant>>>,
        busy: Duration,
        fail_init: bool,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> (Self, Arc<Mutex<Vec<Instant>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let fetcher = Self {
                steps: steps.into(),
                calls: Arc::clone(&calls),
                busy: Duration::ZERO,
                fail_init: false,
            };
            (fetcher, calls)
        }
    }

    #[async_trait]
    impl Fetcher for Scripted {
        async fn init(&mut self) -> Result<(), FetchError> {
            if self.fail_init {
                return Err(FetchError::InvalidUrl("nowhere".into()));
            }
            Ok(())
        }

        async fn fetch(&mut self) -> Result<Fetched, FetchError> {
            self.calls.lock().unwrap().push(Instant::now());
            if !self.busy.is_zero() {
                tokio::time::sleep(self.busy).await;
            }
            match self.steps.pop_front().unwrap_or(Step::Unchanged) {
                Step::Unchanged => Ok(Fetched::Unchanged),
                Step::Image(script) => Ok(Fetched::Binary(Box::new(Cursor::new(
                    script.as_bytes().to_vec(),
                )))),
                Step::Fail => Err(FetchError::Status(503)),
            }
        }
    }

    struct Binary {
        _dir: tempfile::TempDir,
        upgrader: Arc<Upgrader>,
    }

    async fn binary() -> Binary {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");
        std::fs::write(&path, b"#!/bin/sh\necho old\n").unwrap();
        let identity = BinaryIdentity::load(path).await.unwrap();
        let upgrader = Upgrader::new(identity, None, Duration::from_secs(10), Verbosity::default());
        Binary {
            _dir: dir,
            upgrader: Arc::new(upgrader),
        }
    }

    fn fetch_loop(fetcher: Scripted, upgrader: Arc<Upgrader>, restarts: Option<RestartQueue>) -> FetchLoop {
        FetchLoop {
            fetcher: Box::new(fetcher),
            upgrader,
            min_interval: Duration::from_secs(1),
            restarts,
            verbosity: Verbosity::default(),
        }
    }

    fn gaps(calls: &Mutex<Vec<Instant>>) -> Vec<Duration> {
        calls
            .lock()
            .unwrap()
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_debounced() {
        let bin = binary().await;
        let (fetcher, calls) = Scripted::new(vec![]);
        let stopping = CancellationToken::new();

        let _ = tokio::time::timeout(
            Duration::from_millis(3500),
            fetch_loop(fetcher, Arc::clone(&bin.upgrader), None).run(stopping),
        )
        .await;

        assert_eq!(calls.lock().unwrap().len(), 4);
        assert!(gaps(&calls).iter().all(|gap| *gap >= Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_counts_from_attempt_start() {
        let bin = binary().await;
        let (mut fetcher, calls) = Scripted::new(vec![]);
        fetcher.busy = Duration::from_millis(1500);

        let _ = tokio::time::timeout(
            Duration::from_millis(3200),
            fetch_loop(fetcher, Arc::clone(&bin.upgrader), None).run(CancellationToken::new()),
        )
        .await;

        // A slow attempt is followed immediately by the next one.
        assert_eq!(gaps(&calls), vec![Duration::from_millis(1500); 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_the_loop() {
        let bin = binary().await;
        let (fetcher, calls) = Scripted::new(vec![Step::Fail, Step::Fail, Step::Unchanged]);

        let _ = tokio::time::timeout(
            Duration::from_millis(2500),
            fetch_loop(fetcher, Arc::clone(&bin.upgrader), None).run(CancellationToken::new()),
        )
        .await;

        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_disables_fetching() {
        let bin = binary().await;
        let (mut fetcher, calls) = Scripted::new(vec![]);
        fetcher.fail_init = true;

        fetch_loop(fetcher, Arc::clone(&bin.upgrader), None)
            .run(CancellationToken::new())
            .await;

        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_the_loop() {
        let bin = binary().await;
        let (fetcher, calls) = Scripted::new(vec![]);
        let stopping = CancellationToken::new();
        let task = tokio::spawn(
            fetch_loop(fetcher, Arc::clone(&bin.upgrader), None).run(stopping.clone()),
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        stopping.cancel();
        task.await.unwrap();

        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upgrade_queues_restart() {
        let bin = binary().await;
        let good = "#!/bin/sh\nprintf '%s' \"$OVERSEER_BIN_CHECK\"\n";
        let (fetcher, _calls) = Scripted::new(vec![Step::Image(good)]);
        let restarts = RestartQueue::new();
        let stopping = CancellationToken::new();

        let mut lp = fetch_loop(fetcher, Arc::clone(&bin.upgrader), Some(restarts.clone()));
        lp.min_interval = Duration::from_millis(20);
        let task = tokio::spawn(lp.run(stopping.clone()));

        let queued = tokio::time::timeout(Duration::from_secs(10), restarts.next()).await;
        assert_eq!(queued.unwrap(), 1);
        assert_eq!(bin.upgrader.lock().await.generation, 1);

        stopping.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_image_queues_nothing() {
        let bin = binary().await;
        let (fetcher, calls) = Scripted::new(vec![Step::Image("#!/bin/sh\nexit 1\n")]);
        let restarts = RestartQueue::new();
        let stopping = CancellationToken::new();

        let mut lp = fetch_loop(fetcher, Arc::clone(&bin.upgrader), Some(restarts.clone()));
        lp.min_interval = Duration::from_millis(20);
        let task = tokio::spawn(lp.run(stopping.clone()));

        while calls.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        stopping.cancel();
        task.await.unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(100), restarts.next())
                .await
                .is_err()
        );
        assert_eq!(bin.upgrader.lock().await.generation, 0);
    }
}

//! The master controller.
//!
//! The master owns the listening sockets, the trusted binary and the active
//! slave. It never runs the program itself. Everything that changes which
//! slave is active happens on one event loop:
//!
//! - a queued restart spawns the next generation from the trusted binary,
//!   waits for its readiness handshake and only then retires the old slave;
//! - an exit of the active slave outside a handover is a crash and is
//!   respawned, up to the crash limit;
//! - cancellation of the stopping token stops the active slave and returns.
//!
//! The fetch loop and signal forwarding run as separate tasks and only talk
//! to the event loop through the restart queue and the stopping token.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Settings, Verbosity};
use crate::crash::{CrashTracker, CrashVerdict};
use crate::error::Error;
use crate::fetch_loop::FetchLoop;
use crate::fetcher::Fetcher;
use crate::listener::SharedListeners;
use crate::process::{
    await_ready, check_dir_writable, send_signal, spawn_slave, SlaveLaunch, SpawnedSlave,
    INHERIT_FD_FLOOR,
};
use crate::restart::RestartQueue;
use crate::signals::MasterSignals;
use crate::upgrade::{BinaryIdentity, Upgrader};

/// Exit report from a slave's watcher task.
#[derive(Debug)]
struct SlaveExit {
    id: u64,
    status: io::Result<ExitStatus>,
}

/// A spawned slave the master still tracks.
struct RunningSlave {
    id: u64,
    pid: u32,
    exited: watch::Receiver<bool>,
}

impl RunningSlave {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

pub(crate) struct Master {
    settings: Settings,
    fetcher: Option<Box<dyn Fetcher>>,
    args: Vec<OsString>,
    listeners: SharedListeners,
    upgrader: Arc<Upgrader>,
    signals: Option<MasterSignals>,
    stopping: CancellationToken,
    restarts: RestartQueue,
    exits_tx: mpsc::UnboundedSender<SlaveExit>,
    exits_rx: mpsc::UnboundedReceiver<SlaveExit>,
    active: Option<RunningSlave>,
    last_id: u64,
    crashes: CrashTracker,
    verbosity: Verbosity,
}

impl Master {
    /// Prepare a master for the running executable and its arguments.
    pub async fn start(settings: Settings) -> Result<Self, Error> {
        let exe = std::env::current_exe().map_err(|source| Error::Binary {
            path: PathBuf::from(std::env::args_os().next().unwrap_or_default()),
            source,
        })?;
        let args = std::env::args_os().skip(1).collect();
        Self::with_binary(settings, exe, args).await
    }

    /// Prepare a master that spawns slaves from `exe` with `args`.
    ///
    /// Binds every listener and registers signal handlers. No slave is
    /// spawned until [`Master::run`].
    pub async fn with_binary(
        mut settings: Settings,
        exe: PathBuf,
        args: Vec<OsString>,
    ) -> Result<Self, Error> {
        let verbosity = settings.verbosity();
        let exe = exe.canonicalize().map_err(|source| Error::Binary {
            path: exe.clone(),
            source,
        })?;
        let identity = BinaryIdentity::load(exe.clone())
            .await
            .map_err(|source| Error::Binary {
                path: exe.clone(),
                source,
            })?;

        let fetcher = settings.fetcher.take();
        if fetcher.is_some() {
            let dir = exe.parent().unwrap_or(exe.as_path());
            check_dir_writable(dir).map_err(|source| Error::Binary {
                path: exe.clone(),
                source,
            })?;
        }

        let listeners = SharedListeners::bind(&settings.addresses, INHERIT_FD_FLOOR)?;
        let signals = MasterSignals::register(settings.restart_signal)?;

        if verbosity.debug {
            debug!(
                bin = %exe.display(),
                hash = %identity.hash,
                listeners = listeners.len(),
                addresses = ?listeners.addresses(),
                "Master prepared"
            );
        }

        let upgrader = Upgrader::new(
            identity,
            settings.pre_upgrade.take(),
            settings.sanity_check_timeout,
            verbosity,
        );
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let crashes = CrashTracker::new(settings.crash_limit);

        Ok(Self {
            settings,
            fetcher,
            args,
            listeners,
            upgrader: Arc::new(upgrader),
            signals: Some(signals),
            stopping: CancellationToken::new(),
            restarts: RestartQueue::new(),
            exits_tx,
            exits_rx,
            active: None,
            last_id: 0,
            crashes,
            verbosity,
        })
    }

    /// Cancelling this token stops the active slave and ends [`Master::run`].
    pub fn stopping_token(&self) -> CancellationToken {
        self.stopping.clone()
    }

    pub fn restart_queue(&self) -> RestartQueue {
        self.restarts.clone()
    }

    #[cfg(test)]
    fn local_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.listeners.local_addrs()
    }

    /// Supervise until stopped. Returns an error only for a crash loop or a
    /// failure to spawn a replacement for a crashed slave.
    pub async fn run(mut self) -> Result<(), Error> {
        let signal_task = self.signals.take().map(|signals| {
            signals.spawn(
                self.stopping.clone(),
                self.restarts.clone(),
                self.settings.no_restart,
            )
        });

        let result = match self.spawn_active().await {
            Ok(()) => {
                let fetch_task = self.start_fetching();
                let result = self.event_loop().await;
                self.stopping.cancel();
                if let Some(task) = fetch_task {
                    let _ = task.await;
                }
                result
            }
            Err(e) => Err(e),
        };

        self.stopping.cancel();
        self.terminate().await;
        if let Some(task) = signal_task {
            let _ = task.await;
        }
        info!("Master exiting");
        result
    }

    fn start_fetching(&mut self) -> Option<tokio::task::JoinHandle<()>> {
        let fetcher = self.fetcher.take()?;
        let restart_after_fetch = !self.settings.no_restart && !self.settings.no_restart_after_fetch;
        let fetch = FetchLoop {
            fetcher,
            upgrader: Arc::clone(&self.upgrader),
            min_interval: self.settings.min_fetch_interval,
            restarts: restart_after_fetch.then(|| self.restarts.clone()),
            verbosity: self.verbosity,
        };
        Some(tokio::spawn(fetch.run(self.stopping.clone())))
    }

    async fn event_loop(&mut self) -> Result<(), Error> {
        let restarts = self.restarts.clone();
        let stopping = self.stopping.clone();
        loop {
            tokio::select! {
                biased;
                _ = stopping.cancelled() => return Ok(()),
                Some(exit) = self.exits_rx.recv() => self.handle_exit(exit).await?,
                coalesced = restarts.next() => self.restart(coalesced).await,
            }
        }
    }

    /// Spawn the next generation from the trusted binary.
    async fn spawn_next(&mut self) -> Result<(RunningSlave, UnixStream), Error> {
        let upgrader = Arc::clone(&self.upgrader);
        let binary = upgrader.lock().await;

        self.last_id += 1;
        let id = self.last_id;
        let id_str = id.to_string();
        let SpawnedSlave { mut child, ready } = spawn_slave(SlaveLaunch {
            bin_path: &binary.path,
            args: &self.args,
            id: &id_str,
            bin_id: &binary.hash,
            restart_signal: self.settings.restart_signal,
            listeners: &self.listeners,
        })
        .await
        .map_err(Error::Spawn)?;

        let pid = child.id().ok_or_else(|| {
            Error::Spawn(io::Error::other("slave exited before it could be tracked"))
        })?;

        let (exited_tx, exited) = watch::channel(false);
        let exits = self.exits_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exited_tx.send(true);
            let _ = exits.send(SlaveExit { id, status });
        });

        Ok((RunningSlave { id, pid, exited }, ready))
    }

    /// Spawn a slave straight into the active slot. Readiness is only logged.
    async fn spawn_active(&mut self) -> Result<(), Error> {
        let (slave, ready) = self.spawn_next().await?;
        let id = slave.id.to_string();
        let timeout = self.settings.ready_timeout;
        let verbosity = self.verbosity;
        tokio::spawn(async move {
            match await_ready(ready, &id, timeout).await {
                Ok(()) if verbosity.debug => debug!(id = %id, "Slave ready"),
                Ok(()) => {}
                Err(e) if verbosity.warn => warn!(id = %id, error = %e, "Slave did not report ready"),
                Err(_) => {}
            }
        });
        self.active = Some(slave);
        Ok(())
    }

    /// Replace the active slave with a new generation, keeping the old one
    /// if the new one does not become ready.
    async fn restart(&mut self, coalesced: usize) {
        info!(requests = coalesced, "Restarting slave");

        let (next, ready) = match self.spawn_next().await {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(error = %e, "Failed to spawn new slave, keeping current one");
                return;
            }
        };

        let id = next.id.to_string();
        let outcome = tokio::select! {
            _ = self.stopping.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "master is stopping",
            )),
            outcome = await_ready(ready, &id, self.settings.ready_timeout) => outcome,
        };
        if let Err(e) = outcome {
            error!(id = next.id, error = %e, "New slave failed to become ready, keeping current one");
            self.kill(&next);
            return;
        }

        info!(id = next.id, pid = next.pid, "New slave ready");
        if let Some(old) = self.active.replace(next) {
            self.stop_slave(old, self.settings.restart_signal).await;
        }
    }

    async fn handle_exit(&mut self, exit: SlaveExit) -> Result<(), Error> {
        let is_active = self.active.as_ref().is_some_and(|a| a.id == exit.id);
        if !is_active {
            if self.verbosity.debug {
                debug!(id = exit.id, status = ?exit.status, "Retired slave exited");
            }
            return Ok(());
        }
        self.active = None;

        match self.crashes.record(Instant::now()) {
            CrashVerdict::GiveUp { crashes } => {
                error!(id = exit.id, status = ?exit.status, crashes, "Slave keeps crashing, giving up");
                Err(Error::SlaveCrashLoop {
                    crashes,
                    window: self.settings.crash_limit.window,
                })
            }
            CrashVerdict::Respawn { attempt } => {
                if self.verbosity.warn {
                    warn!(id = exit.id, status = ?exit.status, attempt, "Slave exited unexpectedly, respawning");
                }
                self.spawn_active().await
            }
        }
    }

    /// Signal `slave`, wait up to the terminate timeout, then kill it.
    async fn stop_slave(&self, mut slave: RunningSlave, signal: i32) {
        if slave.has_exited() {
            return;
        }
        if let Err(e) = send_signal(slave.pid, signal) {
            if self.verbosity.warn {
                warn!(id = slave.id, pid = slave.pid, error = %e, "Failed to signal slave");
            }
        }

        let timeout = self.settings.terminate_timeout;
        let stopped = tokio::time::timeout(timeout, slave.exited.wait_for(|exited| *exited))
            .await
            .is_ok();
        if stopped {
            if self.verbosity.debug {
                debug!(id = slave.id, pid = slave.pid, "Slave stopped");
            }
            return;
        }

        if self.verbosity.warn {
            warn!(id = slave.id, pid = slave.pid, ?timeout, "Slave did not stop in time, killing");
        }
        self.kill(&slave);
        let _ = slave.exited.wait_for(|exited| *exited).await;
    }

    fn kill(&self, slave: &RunningSlave) {
        if slave.has_exited() {
            return;
        }
        if let Err(e) = send_signal(slave.pid, libc::SIGKILL) {
            error!(id = slave.id, pid = slave.pid, error = %e, "Failed to kill slave");
        }
    }

    async fn terminate(&mut self) {
        if let Some(slave) = self.active.take() {
            info!(id = slave.id, pid = slave.pid, "Stopping slave");
            self.stop_slave(slave, libc::SIGTERM).await;
        }
    }
}

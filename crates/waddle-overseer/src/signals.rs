//! Signal handling for both roles.
//!
//! Handlers are registered before the first slave is spawned, so a signal
//! sent by a child (or an operator) during startup is never lost to the
//! default disposition.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Error;
use crate::restart::RestartQueue;

fn register(kind: SignalKind) -> Result<Signal, Error> {
    signal(kind).map_err(Error::Signal)
}

/// Master signal streams: terminate, interrupt and the restart signal.
pub(crate) struct MasterSignals {
    terminate: Signal,
    interrupt: Signal,
    restart: Signal,
    restart_signal: i32,
}

impl MasterSignals {
    pub fn register(restart_signal: i32) -> Result<Self, Error> {
        Ok(Self {
            terminate: register(SignalKind::terminate())?,
            interrupt: register(SignalKind::interrupt())?,
            restart: register(SignalKind::from_raw(restart_signal))?,
            restart_signal,
        })
    }

    /// Forward signals until `stopping` is cancelled.
    ///
    /// SIGTERM and SIGINT cancel `stopping`. The restart signal queues a
    /// restart, or cancels `stopping` when restarts are disabled.
    pub fn spawn(
        mut self,
        stopping: CancellationToken,
        restarts: RestartQueue,
        no_restart: bool,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopping.cancelled() => return,
                    Some(()) = self.terminate.recv() => {
                        info!("Received SIGTERM, stopping");
                        break;
                    }
                    Some(()) = self.interrupt.recv() => {
                        info!("Received SIGINT, stopping");
                        break;
                    }
                    Some(()) = self.restart.recv() => {
                        if no_restart {
                            info!(signal = self.restart_signal, "Restarts disabled, treating restart signal as shutdown");
                            break;
                        }
                        info!(signal = self.restart_signal, "Restart requested");
                        restarts.request();
                    }
                }
            }
            stopping.cancel();
        })
    }
}

/// Slave stop streams: the master's restart signal, SIGTERM and SIGINT.
pub(crate) struct SlaveSignals {
    restart: Signal,
    terminate: Signal,
    interrupt: Signal,
}

impl SlaveSignals {
    pub fn register(restart_signal: i32) -> Result<Self, Error> {
        Ok(Self {
            restart: register(SignalKind::from_raw(restart_signal))?,
            terminate: register(SignalKind::terminate())?,
            interrupt: register(SignalKind::interrupt())?,
        })
    }

    /// Resolves with a name for the first stop signal received.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            Some(()) = self.restart.recv() => "restart",
            Some(()) = self.terminate.recv() => "SIGTERM",
            Some(()) = self.interrupt.recv() => "SIGINT",
        }
    }
}

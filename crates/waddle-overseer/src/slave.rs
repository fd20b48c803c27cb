//! The slave side of supervision.
//!
//! A slave adopts the listeners its master passed down, reports ready on
//! the readiness socket, runs the program once and exits when the program
//! returns. Stop requests (the master's restart signal, SIGTERM, SIGINT, or
//! the master disappearing) cancel the program's stop token; the slave never
//! kills anything itself.

use std::io::{self, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::parent_id;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{Program, Settings, Verbosity};
use crate::env::SlaveEnv;
use crate::error::Error;
use crate::listener::{validate_fd, ListenerSet};
use crate::process::FIRST_INHERITED_FD;
use crate::shutdown::GracefulShutdown;
use crate::signals::SlaveSignals;
use crate::state::{RestartHandle, State};

const PARENT_POLL: Duration = Duration::from_secs(1);

pub(crate) struct Slave {
    env: SlaveEnv,
    state: State,
    signals: SlaveSignals,
    shutdown: GracefulShutdown,
    master_pid: u32,
    verbosity: Verbosity,
}

impl Slave {
    /// Adopt inherited descriptors and register stop signals.
    pub fn prepare(env: SlaveEnv, settings: &Settings) -> Result<Self, Error> {
        let listeners = ListenerSet::adopt(&settings.addresses, FIRST_INHERITED_FD, env.num_fds)?;
        Self::with_listeners(env, settings, listeners, parent_id())
    }

    fn with_listeners(
        env: SlaveEnv,
        settings: &Settings,
        listeners: ListenerSet,
        master_pid: u32,
    ) -> Result<Self, Error> {
        let signals = SlaveSignals::register(env.restart_signal)?;
        let shutdown = GracefulShutdown::new(settings.terminate_timeout);
        let state = State::supervised(
            env.id.clone(),
            settings.addresses.clone(),
            listeners,
            env.bin_path.clone(),
            env.bin_id.clone(),
            shutdown.clone(),
            RestartHandle::master(master_pid, env.restart_signal),
        );
        Ok(Self {
            env,
            state,
            signals,
            shutdown,
            master_pid,
            verbosity: settings.verbosity(),
        })
    }

    /// Run the program to completion, then drain remaining connections.
    pub async fn run(self, program: Program) {
        let Self {
            env,
            state,
            signals,
            shutdown,
            master_pid,
            verbosity,
        } = self;

        let watcher = tokio::spawn(watch_for_stop(
            signals,
            master_pid,
            shutdown.clone(),
            verbosity,
        ));

        if let Some(fd) = env.ready_fd {
            if let Err(e) = report_ready(fd, &env.id) {
                if verbosity.warn {
                    warn!(fd, error = %e, "Failed to report readiness to master");
                }
            }
        }

        info!(id = %env.id, pid = std::process::id(), "Slave running program");
        program(state).await;
        watcher.abort();

        shutdown.drain().await;
        if verbosity.debug {
            debug!(id = %env.id, "Slave finished");
        }
    }
}

/// Write the slave id on the readiness socket and close it.
fn report_ready(fd: RawFd, id: &str) -> io::Result<()> {
    if !validate_fd(fd) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "readiness descriptor is not a socket",
        ));
    }
    // SAFETY: the descriptor was inherited for this purpose and nothing else owns it.
    let mut ready = unsafe { UnixStream::from_raw_fd(fd) };
    ready.write_all(id.as_bytes())
}

async fn watch_for_stop(
    mut signals: SlaveSignals,
    master_pid: u32,
    shutdown: GracefulShutdown,
    verbosity: Verbosity,
) {
    let mut poll = tokio::time::interval(PARENT_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            signal = signals.recv() => {
                info!(signal, "Stop requested");
                break;
            }
            _ = poll.tick() => {
                if parent_id() != master_pid {
                    if verbosity.warn {
                        warn!(master_pid, "Master process is gone, stopping");
                    }
                    break;
                }
            }
        }
    }
    shutdown.trigger_stop();
}

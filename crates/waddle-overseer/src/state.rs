//! What the program is handed when it starts.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::listener::ListenerSet;
use crate::shutdown::GracefulShutdown;

/// Id of the state passed to a program running without supervision.
pub const DISABLED_ID: &str = "disabled";

/// Per-process state handed to the program.
#[derive(Debug)]
pub struct State {
    /// False when the program runs without supervision.
    pub enabled: bool,
    /// Identifies this slave generation.
    pub id: String,
    pub started_at: DateTime<Utc>,
    /// Configured addresses, in listener order.
    pub addresses: Vec<String>,
    /// Listeners inherited from the master. Empty when disabled.
    pub listeners: ListenerSet,
    /// Path of the trusted binary the master spawned this process from.
    pub bin_path: Option<PathBuf>,
    /// SHA-256 of that binary.
    pub bin_id: Option<String>,
    /// Graceful stop coordination. Stop accepting once the stop token fires.
    pub shutdown: GracefulShutdown,
    restart: RestartHandle,
}

impl State {
    pub(crate) fn supervised(
        id: String,
        addresses: Vec<String>,
        listeners: ListenerSet,
        bin_path: PathBuf,
        bin_id: String,
        shutdown: GracefulShutdown,
        restart: RestartHandle,
    ) -> Self {
        Self {
            enabled: true,
            id,
            started_at: Utc::now(),
            addresses,
            listeners,
            bin_path: Some(bin_path),
            bin_id: Some(bin_id).filter(|id| !id.is_empty()),
            shutdown,
            restart,
        }
    }

    /// State for a program running directly, without a master.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            id: DISABLED_ID.to_string(),
            started_at: Utc::now(),
            addresses: Vec::new(),
            listeners: ListenerSet::empty(),
            bin_path: None,
            bin_id: None,
            shutdown: GracefulShutdown::new(Duration::ZERO),
            restart: RestartHandle::disabled(),
        }
    }

    /// Handle for requesting a graceful restart from inside the program.
    pub fn restart_handle(&self) -> RestartHandle {
        self.restart.clone()
    }
}

/// Requests a graceful restart, as if the restart signal had been sent to
/// the master. With `Config::no_restart` this becomes a graceful shutdown.
#[derive(Debug, Clone)]
pub struct RestartHandle {
    target: RestartTarget,
}

#[derive(Debug, Clone)]
enum RestartTarget {
    Master { pid: u32, signal: i32 },
    Disabled,
}

impl RestartHandle {
    pub(crate) fn master(pid: u32, signal: i32) -> Self {
        Self {
            target: RestartTarget::Master { pid, signal },
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            target: RestartTarget::Disabled,
        }
    }

    /// Ask the master to restart. A no-op without supervision.
    pub fn trigger(&self) -> std::io::Result<()> {
        match self.target {
            RestartTarget::Master { pid, signal } => {
                debug!(master_pid = pid, signal, "Requesting restart from master");
                send(pid, signal)
            }
            RestartTarget::Disabled => {
                debug!("Restart requested without supervision, ignoring");
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn send(pid: u32, signal: i32) -> std::io::Result<()> {
    crate::process::send_signal(pid, signal)
}

#[cfg(not(unix))]
fn send(_pid: u32, _signal: i32) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_state() {
        let state = State::disabled();
        assert!(!state.enabled);
        assert_eq!(state.id, "disabled");
        assert!(state.listeners.is_empty());
        assert!(state.bin_path.is_none());
        assert!(state.restart_handle().trigger().is_ok());
    }
}

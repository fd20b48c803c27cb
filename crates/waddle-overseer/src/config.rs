//! Supervision configuration.
//!
//! [`Config`] is what callers build; [`Config::validate`] turns it into the
//! read-only [`Settings`] the master and slave run with.
//!
//! # Environment Variables
//!
//! - `OVERSEER_TERMINATE_TIMEOUT_SECS`: overrides `terminate_timeout`
//! - `OVERSEER_MIN_FETCH_INTERVAL_SECS`: overrides `min_fetch_interval`
//!
//! Overrides are only applied through [`Config::with_env_overrides`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::Error;
use crate::fetcher::Fetcher;
use crate::state::State;

/// Signal that requests a graceful restart unless configured otherwise.
#[cfg(unix)]
pub const DEFAULT_RESTART_SIGNAL: i32 = libc::SIGUSR2;
#[cfg(not(unix))]
pub const DEFAULT_RESTART_SIGNAL: i32 = 12;

pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_FETCH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SANITY_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const ENV_TERMINATE_TIMEOUT_SECS: &str = "OVERSEER_TERMINATE_TIMEOUT_SECS";
const ENV_MIN_FETCH_INTERVAL_SECS: &str = "OVERSEER_MIN_FETCH_INTERVAL_SECS";

/// The service entry point. Runs once per slave process.
pub type Program = Box<dyn FnOnce(State) -> BoxFuture<'static, ()> + Send>;

/// Boxed error returned by a [`PreUpgrade`] hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Check run against the staged candidate before it is trusted.
/// Returning an error cancels the upgrade.
pub type PreUpgrade = Arc<dyn Fn(&Path) -> Result<(), HookError> + Send + Sync>;

/// Bound on how often the active slave may crash before the master gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashLimit {
    /// Respawns allowed inside `window`. One more crash is fatal.
    pub max_restarts: usize,
    pub window: Duration,
}

impl Default for CrashLimit {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
        }
    }
}

/// Run-time configuration for the supervisor.
///
/// Zero durations and `None` signals mean "use the default".
#[derive(Default)]
pub struct Config {
    /// Never fall back to running the program unsupervised.
    pub required: bool,
    pub program: Option<Program>,
    /// Zero-downtime listen address. Set this or `addresses`, not both.
    pub address: Option<String>,
    pub addresses: Vec<String>,
    /// Signal that triggers a graceful restart. Defaults to `SIGUSR2`.
    pub restart_signal: Option<i32>,
    /// How long a slave gets to exit before it is killed.
    pub terminate_timeout: Duration,
    /// Minimum spacing between two fetch attempts.
    pub min_fetch_interval: Duration,
    /// How long a new slave gets to report ready during a restart.
    pub ready_timeout: Duration,
    /// How long a candidate binary gets to answer the sanity check.
    pub sanity_check_timeout: Duration,
    pub crash_limit: CrashLimit,
    pub pre_upgrade: Option<PreUpgrade>,
    pub fetcher: Option<Box<dyn Fetcher>>,
    /// Enables all supervision debug logs.
    pub debug: bool,
    /// Disables supervision warnings.
    pub no_warn: bool,
    /// Disables restarts; the restart signal becomes a shutdown signal.
    pub no_restart: bool,
    /// Disables the automatic restart after an upgrade. Manual restarts still work.
    pub no_restart_after_fetch: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("required", &self.required)
            .field("program", &self.program.is_some())
            .field("address", &self.address)
            .field("addresses", &self.addresses)
            .field("restart_signal", &self.restart_signal)
            .field("terminate_timeout", &self.terminate_timeout)
            .field("min_fetch_interval", &self.min_fetch_interval)
            .field("ready_timeout", &self.ready_timeout)
            .field("sanity_check_timeout", &self.sanity_check_timeout)
            .field("crash_limit", &self.crash_limit)
            .field("pre_upgrade", &self.pre_upgrade.is_some())
            .field("fetcher", &self.fetcher.is_some())
            .field("debug", &self.debug)
            .field("no_warn", &self.no_warn)
            .field("no_restart", &self.no_restart)
            .field("no_restart_after_fetch", &self.no_restart_after_fetch)
            .finish()
    }
}

impl Config {
    /// Create a config around `program` with every other field defaulted.
    pub fn new<F, Fut>(program: F) -> Self
    where
        F: FnOnce(State) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            program: Some(Box::new(move |state| program(state).boxed())),
            ..Self::default()
        }
    }

    /// Apply `OVERSEER_TERMINATE_TIMEOUT_SECS` and
    /// `OVERSEER_MIN_FETCH_INTERVAL_SECS` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(secs) = secs(ENV_TERMINATE_TIMEOUT_SECS) {
            self.terminate_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = secs(ENV_MIN_FETCH_INTERVAL_SECS) {
            self.min_fetch_interval = Duration::from_secs(secs);
        }
        self
    }

    /// Whether a supervision warning should be logged.
    pub(crate) fn warnings_enabled(&self) -> bool {
        self.debug || !self.no_warn
    }

    /// Check the config and produce the settings supervision runs with.
    ///
    /// The program stays in the config so it is still available for the
    /// unsupervised fallback. The fetcher and pre-upgrade hook move into
    /// the returned settings.
    pub(crate) fn validate(&mut self) -> Result<Settings, Error> {
        if self.program.is_none() {
            return Err(Error::ConfigInvalid("Config.program required".into()));
        }

        let addresses = match (&self.address, self.addresses.is_empty()) {
            (Some(_), false) => {
                return Err(Error::ConfigInvalid(
                    "Config.address and Config.addresses cannot both be set".into(),
                ))
            }
            (Some(address), true) => vec![address.clone()],
            (None, false) => self.addresses.clone(),
            (None, true) => {
                return Err(Error::ConfigInvalid(
                    "Config.address or Config.addresses required".into(),
                ))
            }
        };
        if let Some(blank) = addresses.iter().position(|a| a.trim().is_empty()) {
            return Err(Error::ConfigInvalid(format!("address #{blank} is empty")));
        }

        let or_default = |value: Duration, default: Duration| {
            if value.is_zero() {
                default
            } else {
                value
            }
        };

        Ok(Settings {
            addresses,
            restart_signal: self.restart_signal.unwrap_or(DEFAULT_RESTART_SIGNAL),
            terminate_timeout: or_default(self.terminate_timeout, DEFAULT_TERMINATE_TIMEOUT),
            min_fetch_interval: or_default(self.min_fetch_interval, DEFAULT_MIN_FETCH_INTERVAL),
            ready_timeout: or_default(self.ready_timeout, DEFAULT_READY_TIMEOUT),
            sanity_check_timeout: or_default(
                self.sanity_check_timeout,
                DEFAULT_SANITY_CHECK_TIMEOUT,
            ),
            crash_limit: self.crash_limit,
            pre_upgrade: self.pre_upgrade.take(),
            fetcher: self.fetcher.take(),
            debug: self.debug,
            no_warn: self.no_warn,
            no_restart: self.no_restart,
            no_restart_after_fetch: self.no_restart_after_fetch,
        })
    }
}

/// Validated, read-only supervision policy.
pub(crate) struct Settings {
    /// Non-empty, in bind order. Also the descriptor inheritance order.
    pub addresses: Vec<String>,
    pub restart_signal: i32,
    pub terminate_timeout: Duration,
    pub min_fetch_interval: Duration,
    pub ready_timeout: Duration,
    pub sanity_check_timeout: Duration,
    pub crash_limit: CrashLimit,
    pub pre_upgrade: Option<PreUpgrade>,
    pub fetcher: Option<Box<dyn Fetcher>>,
    pub debug: bool,
    pub no_warn: bool,
    pub no_restart: bool,
    pub no_restart_after_fetch: bool,
}

impl Settings {
    pub fn verbosity(&self) -> Verbosity {
        Verbosity {
            debug: self.debug,
            warn: self.debug || !self.no_warn,
        }
    }
}

/// Which supervision log events are emitted. Errors always are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Verbosity {
    pub debug: bool,
    pub warn: bool,
}

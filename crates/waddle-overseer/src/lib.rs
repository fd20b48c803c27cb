//! # waddle-overseer
//!
//! Self-upgrading supervision for long-running Waddle daemons.
//!
//! ## Overview
//!
//! The process started by the operator becomes the **master**. It binds the
//! configured listen addresses once and keeps them for its whole lifetime,
//! then re-executes its own binary as a **slave** that inherits the sockets
//! and runs the program. Upgrades work like this:
//!
//! 1. A [`Fetcher`] produces a candidate binary
//! 2. The master stages it next to the running binary, runs the pre-upgrade
//!    hook and executes it once in sanity-check mode
//! 3. The validated candidate is renamed over the trusted path
//! 4. A new slave generation is spawned on the same sockets; once it reports
//!    ready the old slave is asked to stop and drain
//!
//! The listening sockets never close, so no connection is refused during a
//! handover. A bad fetch or a bad binary leaves the running slave in place.
//!
//! ## Signal Conventions
//!
//! - `SIGUSR2` (configurable) sent to the master: graceful restart
//! - `SIGTERM` / `SIGINT` sent to the master: stop the slave, then exit
//!
//! ## Environment Variables
//!
//! Master and slave communicate through `OVERSEER_*` variables; the only
//! ones meant for operators are:
//!
//! - `OVERSEER_TERMINATE_TIMEOUT_SECS`: see [`Config::with_env_overrides`]
//! - `OVERSEER_MIN_FETCH_INTERVAL_SECS`: see [`Config::with_env_overrides`]
//!
//! ## Usage
//!
//! ```no_run
//! use waddle_overseer::{Config, State};
//!
//! #[tokio::main]
//! async fn main() {
//!     waddle_overseer::run(Config {
//!         address: Some(":5001".into()),
//!         ..Config::new(|mut state: State| async move {
//!             let _listener = state.listeners.take_first().expect("one listener");
//!             // serve on the listener until `state.shutdown.stopped()` resolves
//!         })
//!     })
//!     .await;
//! }
//! ```
//!
//! ## Platform
//!
//! Supervision requires Unix. Elsewhere [`run`] falls back to running the
//! program directly (see [`Config::required`]).

use std::io::Write;

use tracing::{error, warn};

mod config;
mod env;
mod error;
mod fetcher;
mod listener;
mod shutdown;
mod state;

#[cfg(unix)]
mod crash;
#[cfg(unix)]
mod fetch_loop;
#[cfg(unix)]
mod master;
#[cfg(unix)]
mod process;
#[cfg(unix)]
mod restart;
#[cfg(unix)]
mod signals;
#[cfg(unix)]
mod slave;
#[cfg(unix)]
mod upgrade;

pub use config::{
    Config, CrashLimit, HookError, PreUpgrade, Program, DEFAULT_MIN_FETCH_INTERVAL,
    DEFAULT_READY_TIMEOUT, DEFAULT_RESTART_SIGNAL, DEFAULT_SANITY_CHECK_TIMEOUT,
    DEFAULT_TERMINATE_TIMEOUT,
};
pub use env::{Role, SlaveEnv};
pub use error::{Error, FetchError, UpgradeError, ValidationError};
pub use fetcher::{
    Fetched, Fetcher, FileFetcher, HttpFetcher, DEFAULT_FILE_INTERVAL, DEFAULT_HTTP_INTERVAL,
};
pub use listener::ListenerSet;
pub use shutdown::{ConnectionGuard, GracefulShutdown};
pub use state::{RestartHandle, State, DISABLED_ID};

use config::Settings;
use env::Environment;

/// How a call to [`run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Supervision (or the sanity check) completed.
    Completed,
    /// Supervision was unavailable and the program ran unsupervised.
    RanDirectly,
    /// Supervision failed and no fallback was allowed.
    Fatal,
}

/// Run the program under supervision.
///
/// Exits the process with status 0 once supervision completes, or 1 when it
/// fails and [`Config::required`] is set. Otherwise a failure is logged and
/// the program runs directly against [`State::disabled`]; `run` then
/// returns when the program does.
pub async fn run(config: Config) {
    match run_on(config, is_supported()).await {
        Outcome::Completed => std::process::exit(0),
        Outcome::RanDirectly => {}
        Outcome::Fatal => std::process::exit(1),
    }
}

/// Like [`run`], but returns the supervision error instead of falling back.
pub async fn run_err(mut config: Config) -> Result<(), Error> {
    supervise(&mut config, is_supported()).await
}

/// Answer an upgrading master's sanity check, if this process is one.
///
/// [`run`] does this too; call it first thing in `main` when startup does
/// work that should not happen during a check. Exits when a check was
/// answered.
pub fn sanity_check() {
    if let Some(token) = Environment::from_process().sanity_token() {
        print_token(token);
        std::process::exit(0);
    }
}

/// Whether supervision is available on this platform.
pub fn is_supported() -> bool {
    cfg!(unix)
}

fn print_token(token: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(token.as_bytes());
    let _ = out.flush();
}

async fn run_on(mut config: Config, supported: bool) -> Outcome {
    let err = match supervise(&mut config, supported).await {
        Ok(()) => return Outcome::Completed,
        Err(e) => e,
    };

    if config.required {
        error!(error = %err, "Supervision failed");
        return Outcome::Fatal;
    }
    if config.warnings_enabled() {
        warn!(error = %err, role = ?Role::Disabled, "Supervision unavailable, running program directly");
    }

    let Some(program) = config.program.take() else {
        error!("No program to run");
        return Outcome::Fatal;
    };
    program(State::disabled()).await;
    Outcome::RanDirectly
}

async fn supervise(config: &mut Config, supported: bool) -> Result<(), Error> {
    let settings = config.validate()?;

    let env = Environment::from_process();
    if let Some(token) = env.sanity_token() {
        print_token(token);
        return Ok(());
    }

    let role = Role::resolve(&env, supported)?;
    supervise_role(config, settings, role).await
}

#[cfg(unix)]
async fn supervise_role(config: &mut Config, settings: Settings, role: Role) -> Result<(), Error> {
    match role {
        Role::Slave(slave_env) => {
            let slave = slave::Slave::prepare(slave_env, &settings)?;
            let program = config
                .program
                .take()
                .ok_or_else(|| Error::ConfigInvalid("Config.program required".into()))?;
            slave.run(program).await;
            Ok(())
        }
        Role::Master => master::Master::start(settings).await?.run().await,
        Role::Disabled => Err(Error::PlatformUnsupported(std::env::consts::OS)),
    }
}

#[cfg(not(unix))]
async fn supervise_role(_config: &mut Config, _settings: Settings, _role: Role) -> Result<(), Error> {
    Err(Error::PlatformUnsupported(std::env::consts::OS))
}

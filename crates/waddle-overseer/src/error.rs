//! Error types for supervision.
//!
//! [`Error`] covers setup-time failures and the crash-loop diagnosis; these
//! end supervision (and fall back to running the program directly unless
//! `Config::required` is set). [`UpgradeError`] and [`FetchError`] are
//! steady-state failures: they are logged and the trusted binary stays in
//! control.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal supervision errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("os ({0}) not supported")]
    PlatformUnsupported(&'static str),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid overseer environment: {0}")]
    Environment(String),

    #[error("binary {path}: {source}")]
    Binary {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("inherited descriptor {fd}: {reason}")]
    Inherit { fd: i32, reason: String },

    #[error("failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error("failed to spawn slave: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("slave crashed {crashes} times within {window:?}, giving up")]
    SlaveCrashLoop { crashes: usize, window: Duration },
}

/// Errors raised by a [`Fetcher`](crate::Fetcher) backend.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    Status(u16),

    #[error("invalid fetch url {0:?}")]
    InvalidUrl(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a candidate binary was refused.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("candidate binary is empty")]
    Empty,

    #[error("pre-upgrade hook rejected candidate: {0}")]
    Rejected(String),

    #[error("sanity check failed: {0}")]
    SanityCheck(String),
}

/// A failed upgrade attempt. The candidate is discarded.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("failed to stage candidate at {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to replace {path}: {source}")]
    Swap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

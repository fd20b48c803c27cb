//! Pluggable sources of candidate binaries.
//!
//! The master polls a [`Fetcher`] on the fetch loop. A fetcher reports
//! either that nothing changed or hands over a reader for a new image;
//! deciding whether the image is really new (by hash) and safe to run is
//! the upgrade pipeline's job, not the fetcher's.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::FetchError;

mod file;
mod http;

pub use file::{FileFetcher, DEFAULT_FILE_INTERVAL};
pub use http::{HttpFetcher, DEFAULT_HTTP_INTERVAL};

/// Result of one fetch attempt.
pub enum Fetched {
    /// Nothing new since the last attempt.
    Unchanged,
    /// A candidate image to validate.
    Binary(Box<dyn AsyncRead + Send + Unpin>),
}

impl std::fmt::Debug for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fetched::Unchanged => f.write_str("Unchanged"),
            Fetched::Binary(_) => f.write_str("Binary(..)"),
        }
    }
}

/// A source of replacement binaries.
///
/// `fetch` is called repeatedly; it must be cheap when nothing changed.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// One-time setup before the first fetch. An error disables fetching.
    async fn init(&mut self) -> Result<(), FetchError> {
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Fetched, FetchError>;
}

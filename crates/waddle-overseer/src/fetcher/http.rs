//! Poll an HTTP endpoint for new binaries.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use tracing::debug;

use super::{Fetched, Fetcher};
use crate::error::FetchError;

/// Poll interval used when none is given.
pub const DEFAULT_HTTP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Downloads the binary at `url`, skipping the download when a `HEAD`
/// request shows the same `ETag`, `Last-Modified` and `Content-Length` as
/// the previous poll.
#[derive(Debug)]
pub struct HttpFetcher {
    url: String,
    interval: Duration,
    client: reqwest::Client,
    delay: bool,
    last_seen: Option<[Option<String>; 3]>,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>, interval: Duration) -> Self {
        Self {
            url: url.into(),
            interval,
            client: reqwest::Client::new(),
            delay: false,
            last_seen: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn fingerprint(headers: &HeaderMap) -> [Option<String>; 3] {
    [ETAG, LAST_MODIFIED, CONTENT_LENGTH].map(|name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn init(&mut self) -> Result<(), FetchError> {
        reqwest::Url::parse(&self.url).map_err(|_| FetchError::InvalidUrl(self.url.clone()))?;
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Fetched, FetchError> {
        if self.delay {
            tokio::time::sleep(self.interval).await;
        }
        self.delay = true;

        let head = self.client.head(&self.url).send().await?;
        let seen = if head.status().is_success() {
            let seen = fingerprint(head.headers());
            if seen.iter().any(Option::is_some) && self.last_seen.as_ref() == Some(&seen) {
                debug!(url = %self.url, "Remote binary unchanged");
                return Ok(Fetched::Unchanged);
            }
            Some(seen)
        } else {
            None
        };

        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        self.last_seen = seen;

        debug!(url = %self.url, bytes = body.len(), "Downloaded candidate binary");
        Ok(Fetched::Binary(Box::new(Cursor::new(body))))
    }
}

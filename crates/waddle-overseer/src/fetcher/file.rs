//! Watch a file on disk for new binaries.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::debug;

use super::{Fetched, Fetcher};
use crate::error::FetchError;

/// Poll interval used when none is given.
pub const DEFAULT_FILE_INTERVAL: Duration = Duration::from_secs(1);

/// Treats a change in the modification time of `path` as a new binary.
/// The file present at startup is assumed to be the running build.
#[derive(Debug)]
pub struct FileFetcher {
    path: PathBuf,
    interval: Duration,
    delay: bool,
    last_modified: Option<SystemTime>,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            delay: false,
            last_modified: None,
        }
    }

    async fn modified(&self) -> Result<Option<SystemTime>, FetchError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn init(&mut self) -> Result<(), FetchError> {
        self.last_modified = self.modified().await?;
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Fetched, FetchError> {
        if self.delay {
            tokio::time::sleep(self.interval).await;
        }
        self.delay = true;

        let Some(modified) = self.modified().await? else {
            return Ok(Fetched::Unchanged);
        };
        if self.last_modified == Some(modified) {
            return Ok(Fetched::Unchanged);
        }

        let file = tokio::fs::File::open(&self.path).await?;
        self.last_modified = Some(modified);
        debug!(path = %self.path.display(), "Binary file changed");
        Ok(Fetched::Binary(Box::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn touch(path: &std::path::Path, contents: &[u8], secs: u64) {
        std::fs::write(path, contents).unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[tokio::test]
    async fn test_initial_file_is_not_an_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-next");
        touch(&path, b"v1", 1_000);

        let mut fetcher = FileFetcher::new(&path, Duration::ZERO);
        fetcher.init().await.unwrap();
        assert!(matches!(fetcher.fetch().await.unwrap(), Fetched::Unchanged));
    }

    #[tokio::test]
    async fn test_modified_file_is_fetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-next");
        touch(&path, b"v1", 1_000);

        let mut fetcher = FileFetcher::new(&path, Duration::ZERO);
        fetcher.init().await.unwrap();

        touch(&path, b"v2", 2_000);
        let Fetched::Binary(mut reader) = fetcher.fetch().await.unwrap() else {
            panic!("expected a binary");
        };
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"v2");

        assert!(matches!(fetcher.fetch().await.unwrap(), Fetched::Unchanged));
    }

    #[tokio::test]
    async fn test_missing_file_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = FileFetcher::new(dir.path().join("absent"), Duration::ZERO);
        fetcher.init().await.unwrap();
        assert!(matches!(fetcher.fetch().await.unwrap(), Fetched::Unchanged));
    }
}

//! Staging, validating and installing candidate binaries.
//!
//! A candidate is streamed into a hidden temp file next to the trusted
//! binary (same filesystem, so the final rename is atomic), checked by the
//! pre-upgrade hook, executed once in sanity-check mode, and only then
//! renamed over the trusted path. The trusted [`BinaryIdentity`] sits
//! behind one mutex for the whole sequence; upgrades never overlap.

use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{PreUpgrade, Verbosity};
use crate::env::{ENV_BIN_CHECK, ENV_BIN_CHECK_LEGACY, ENV_IS_SLAVE};
use crate::error::{UpgradeError, ValidationError};
use crate::process::spawn_retrying;

const EXECUTABLE_MODE: u32 = 0o755;
const COPY_BUFFER: usize = 64 * 1024;

/// The binary the master currently trusts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BinaryIdentity {
    /// Number of upgrades installed since the master started.
    pub generation: u64,
    pub path: PathBuf,
    /// Hex SHA-256 of the file contents.
    pub hash: String,
}

impl BinaryIdentity {
    pub async fn load(path: PathBuf) -> io::Result<Self> {
        let mut file = tokio::fs::File::open(&path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self {
            generation: 0,
            path,
            hash: hex::encode(hasher.finalize()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpgradeOutcome {
    /// The candidate is byte-identical to the trusted binary.
    Unchanged,
    Upgraded(BinaryIdentity),
}

/// Fresh random token, hex encoded.
pub(crate) fn random_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// A candidate written next to the trusted binary. Removed on drop unless installed.
struct StagedBinary {
    path: PathBuf,
    installed: bool,
}

impl StagedBinary {
    fn path_for(target: &Path) -> PathBuf {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "binary".to_string());
        dir.join(format!(".{name}.overseer-{}.tmp", random_token()))
    }

    /// Stream `image` to disk. Returns the staged file, its hash and its size.
    async fn write<R>(target: &Path, image: &mut R) -> io::Result<(Self, String, usize)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let staged = Self {
            path: Self::path_for(target),
            installed: false,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(EXECUTABLE_MODE)
            .open(&staged.path)
            .await?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut size = 0usize;
        loop {
            let n = image.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            size += n;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::set_permissions(&staged.path, Permissions::from_mode(EXECUTABLE_MODE)).await?;
        Ok((staged, hex::encode(hasher.finalize()), size))
    }

    async fn install(mut self, target: &Path) -> io::Result<()> {
        tokio::fs::rename(&self.path, target).await?;
        self.installed = true;
        Ok(())
    }
}

impl Drop for StagedBinary {
    fn drop(&mut self) {
        if !self.installed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Run `path` in sanity-check mode: it must print the token and exit 0.
pub(crate) async fn sanity_check(path: &Path, timeout: Duration) -> Result<(), ValidationError> {
    let token = random_token();
    let mut cmd = Command::new(path);
    cmd.env(ENV_BIN_CHECK, &token)
        .env_remove(ENV_BIN_CHECK_LEGACY)
        .env_remove(ENV_IS_SLAVE)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = spawn_retrying(&mut cmd)
        .await
        .map_err(|e| ValidationError::SanityCheck(format!("failed to run candidate: {e}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => {
            return Err(ValidationError::SanityCheck(format!(
                "no answer within {timeout:?}"
            )))
        }
        Ok(Err(e)) => return Err(ValidationError::SanityCheck(e.to_string())),
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        return Err(ValidationError::SanityCheck(format!(
            "candidate exited with {}",
            output.status
        )));
    }
    if output.stdout != token.as_bytes() {
        let printed: String = String::from_utf8_lossy(&output.stdout).chars().take(64).collect();
        return Err(ValidationError::SanityCheck(format!(
            "candidate printed {printed:?} instead of the check token"
        )));
    }
    Ok(())
}

/// Owns the trusted binary identity and installs validated candidates.
pub(crate) struct Upgrader {
    binary: Mutex<BinaryIdentity>,
    pre_upgrade: Option<PreUpgrade>,
    sanity_check_timeout: Duration,
    verbosity: Verbosity,
}

impl Upgrader {
    pub fn new(
        binary: BinaryIdentity,
        pre_upgrade: Option<PreUpgrade>,
        sanity_check_timeout: Duration,
        verbosity: Verbosity,
    ) -> Self {
        Self {
            binary: Mutex::new(binary),
            pre_upgrade,
            sanity_check_timeout,
            verbosity,
        }
    }

    /// Hold the trusted identity. Upgrades wait until the guard drops.
    pub async fn lock(&self) -> MutexGuard<'_, BinaryIdentity> {
        self.binary.lock().await
    }

    /// Validate `image` and, if it passes, make it the trusted binary.
    pub async fn apply<R>(&self, image: &mut R) -> Result<UpgradeOutcome, UpgradeError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut binary = self.binary.lock().await;

        let (staged, hash, size) = StagedBinary::write(&binary.path, image)
            .await
            .map_err(|source| UpgradeError::Stage {
                path: binary.path.clone(),
                source,
            })?;

        if hash == binary.hash {
            if self.verbosity.debug {
                debug!(hash = %hash, "Candidate matches the running binary");
            }
            return Ok(UpgradeOutcome::Unchanged);
        }
        if size == 0 {
            return Err(ValidationError::Empty.into());
        }
        if self.verbosity.debug {
            debug!(path = %staged.path.display(), bytes = size, hash = %hash, "Staged candidate binary");
        }

        if let Some(hook) = self.pre_upgrade.clone() {
            let path = staged.path.clone();
            tokio::task::spawn_blocking(move || hook(&path))
                .await
                .map_err(|e| ValidationError::Rejected(format!("pre-upgrade hook failed: {e}")))?
                .map_err(|e| ValidationError::Rejected(e.to_string()))?;
        }

        sanity_check(&staged.path, self.sanity_check_timeout).await?;

        staged
            .install(&binary.path)
            .await
            .map_err(|source| UpgradeError::Swap {
                path: binary.path.clone(),
                source,
            })?;
        if let Err(e) =
            tokio::fs::set_permissions(&binary.path, Permissions::from_mode(EXECUTABLE_MODE)).await
        {
            if self.verbosity.warn {
                warn!(path = %binary.path.display(), error = %e, "Failed to mark new binary executable");
            }
        }

        binary.generation += 1;
        binary.hash = hash;
        info!(
            generation = binary.generation,
            hash = %binary.hash,
            path = %binary.path.display(),
            "Installed new binary"
        );
        Ok(UpgradeOutcome::Upgraded(binary.clone()))
    }
}

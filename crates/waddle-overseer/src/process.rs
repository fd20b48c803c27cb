//! Spawning slave processes with inherited descriptors.
//!
//! The master's listener descriptors live above a high floor with
//! `FD_CLOEXEC` set. Between fork and exec the child duplicates them onto
//! the contiguous range 3..3+n (`dup2` clears `FD_CLOEXEC` on the target),
//! followed by one end of the readiness socket at 3+n. Nothing else leaks
//! into the child.

use std::ffi::OsString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::env::{
    ENV_BIN_CHECK, ENV_BIN_CHECK_LEGACY, ENV_BIN_ID, ENV_BIN_PATH, ENV_IS_SLAVE, ENV_NUM_FDS,
    ENV_READY_FD, ENV_RESTART_SIGNAL, ENV_SLAVE_ID,
};
use crate::listener::SharedListeners;

/// First descriptor number a slave inherits.
pub(crate) const FIRST_INHERITED_FD: RawFd = 3;

/// Lowest descriptor the master parks inheritable sockets on.
pub(crate) const INHERIT_FD_FLOOR: RawFd = 100;

const SPAWN_ATTEMPTS: u32 = 5;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Duplicate `fd` onto the lowest free descriptor >= `floor`, close-on-exec.
pub(crate) fn dup_above(fd: RawFd, floor: RawFd) -> io::Result<OwnedFd> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Place `fds` on FIRST_INHERITED_FD.. in order. Runs between fork and exec,
/// so it only calls async-signal-safe functions and does not allocate.
fn remap_fds(fds: &[RawFd]) -> io::Result<()> {
    for (i, &fd) in fds.iter().enumerate() {
        let target = FIRST_INHERITED_FD + i as RawFd;
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Spawn `cmd`, retrying while the executable is still busy being written.
///
/// A freshly written binary can report `ETXTBSY` if another thread forked
/// while the write descriptor was open.
pub(crate) async fn spawn_retrying(cmd: &mut Command) -> io::Result<Child> {
    let mut attempt = 1;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                debug!(attempt, "Executable busy, retrying spawn");
                attempt += 1;
                tokio::time::sleep(SPAWN_RETRY_DELAY).await;
            }
            result => return result,
        }
    }
}

/// What the master needs to launch one slave generation.
pub(crate) struct SlaveLaunch<'a> {
    pub bin_path: &'a Path,
    pub args: &'a [OsString],
    pub id: &'a str,
    pub bin_id: &'a str,
    pub restart_signal: i32,
    pub listeners: &'a SharedListeners,
}

/// A started slave and the master's end of its readiness socket.
pub(crate) struct SpawnedSlave {
    pub child: Child,
    pub ready: UnixStream,
}

pub(crate) async fn spawn_slave(launch: SlaveLaunch<'_>) -> io::Result<SpawnedSlave> {
    let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
    let floor = INHERIT_FD_FLOOR.max(FIRST_INHERITED_FD + launch.listeners.len() as RawFd + 1);
    let theirs = dup_above(theirs.as_raw_fd(), floor)?;

    let fds: Vec<RawFd> = launch
        .listeners
        .raw_fds()
        .chain(std::iter::once(theirs.as_raw_fd()))
        .collect();
    let num_fds = launch.listeners.len();
    let ready_fd = FIRST_INHERITED_FD + num_fds as RawFd;

    let mut cmd = Command::new(launch.bin_path);
    cmd.args(launch.args)
        .env_remove(ENV_BIN_CHECK)
        .env_remove(ENV_BIN_CHECK_LEGACY)
        .env(ENV_IS_SLAVE, "1")
        .env(ENV_SLAVE_ID, launch.id)
        .env(ENV_NUM_FDS, num_fds.to_string())
        .env(ENV_BIN_PATH, launch.bin_path)
        .env(ENV_BIN_ID, launch.bin_id)
        .env(ENV_READY_FD, ready_fd.to_string())
        .env(ENV_RESTART_SIGNAL, launch.restart_signal.to_string());

    // SAFETY: remap_fds only calls dup2 on descriptors that stay open in the
    // parent until spawn returns.
    unsafe {
        cmd.pre_exec(move || remap_fds(&fds));
    }

    let child = spawn_retrying(&mut cmd).await?;
    // The child holds its own copy now.
    drop(theirs);

    info!(
        id = launch.id,
        pid = child.id(),
        bin = %launch.bin_path.display(),
        fds = num_fds,
        "Spawned slave"
    );

    ours.set_nonblocking(true)?;
    Ok(SpawnedSlave {
        child,
        ready: UnixStream::from_std(ours)?,
    })
}

/// Wait for the slave to write its id on the readiness socket and close it.
pub(crate) async fn await_ready(mut ready: UnixStream, id: &str, timeout: Duration) -> io::Result<()> {
    let mut marker = Vec::with_capacity(id.len());
    let read = ready.read_to_end(&mut marker);
    match tokio::time::timeout(timeout, read).await {
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no readiness within {timeout:?}"),
        )),
        Ok(Err(e)) => Err(e),
        Ok(Ok(_)) if marker.is_empty() => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "slave closed readiness socket without reporting ready",
        )),
        Ok(Ok(_)) if marker != id.as_bytes() => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "readiness marker {:?} does not match slave id {id:?}",
                String::from_utf8_lossy(&marker)
            ),
        )),
        Ok(Ok(_)) => Ok(()),
    }
}

/// Fails unless this process may create and rename files in `dir`.
pub(crate) fn check_dir_writable(dir: &Path) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let c_dir = std::ffi::CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a nul byte"))?;
    if unsafe { libc::access(c_dir.as_ptr(), libc::W_OK | libc::X_OK) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Send `signal` to `pid`. A process that is already gone is not an error.
pub(crate) fn send_signal(pid: u32, signal: i32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Environment, Role};
    use crate::listener::ListenerSet;
    use tokio::io::AsyncWriteExt;

    const CHILD_TEST: &str = "process::tests::test_child_entry";

    #[test]
    fn test_dupfd_cloexec_to_high_range() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let high = dup_above(fd, 100).unwrap();
        assert!(high.as_raw_fd() >= 100);

        let flags = unsafe { libc::fcntl(high.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_signal_to_missing_process_is_ok() {
        // pid_max on Linux is at most 2^22.
        assert!(send_signal(4_194_304 + 1, 0).is_ok());
    }

    #[test]
    fn test_writable_dir_check() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_dir_writable(dir.path()).is_ok());
        assert!(check_dir_writable(&dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_ready_marker_must_match() {
        let (master, mut slave) = UnixStream::pair().unwrap();
        slave.write_all(b"7").await.unwrap();
        drop(slave);
        let err = await_ready(master, "8", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_ready_eof_is_not_ready() {
        let (master, slave) = UnixStream::pair().unwrap();
        drop(slave);
        let err = await_ready(master, "1", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_timeout() {
        let (master, _slave) = UnixStream::pair().unwrap();
        let err = await_ready(master, "1", Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    /// Child half of `test_spawned_slave_adopts_listeners_in_order`.
    ///
    /// Re-executed from the test binary with the slave environment set.
    /// Reports ready, then answers one connection per listener with the
    /// listener's position.
    #[test]
    fn test_child_entry() {
        let env = Environment::from_process();
        let Ok(Role::Slave(slave)) = Role::resolve(&env, true) else {
            return;
        };
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let names: Vec<String> = (0..slave.num_fds).map(|i| format!("l{i}")).collect();
            let set = ListenerSet::adopt(&names, FIRST_INHERITED_FD, slave.num_fds).unwrap();

            let fd = slave.ready_fd.unwrap();
            let mut ready = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
            std::io::Write::write_all(&mut ready, slave.id.as_bytes()).unwrap();
            drop(ready);

            for (i, (_, listener)) in set.into_inner().into_iter().enumerate() {
                let (mut stream, _) = listener.accept().await.unwrap();
                stream.write_all(i.to_string().as_bytes()).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_spawned_slave_adopts_listeners_in_order() {
        let addresses = vec!["127.0.0.1:0".to_string(), "127.0.0.1:0".to_string()];
        let shared = SharedListeners::bind(&addresses, INHERIT_FD_FLOOR).unwrap();
        let exe = std::env::current_exe().unwrap();
        let args: Vec<OsString> = ["--exact", CHILD_TEST, "--nocapture", "--test-threads=1"]
            .iter()
            .map(OsString::from)
            .collect();

        let SpawnedSlave { mut child, ready } = spawn_slave(SlaveLaunch {
            bin_path: &exe,
            args: &args,
            id: "42",
            bin_id: "test",
            restart_signal: libc::SIGUSR2,
            listeners: &shared,
        })
        .await
        .unwrap();

        await_ready(ready, "42", Duration::from_secs(30)).await.unwrap();

        for (i, addr) in shared.local_addrs().into_iter().enumerate() {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let mut reply = String::new();
            stream.read_to_string(&mut reply).await.unwrap();
            assert_eq!(reply, i.to_string());
        }

        let status = tokio::time::timeout(Duration::from_secs(30), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());
    }
}

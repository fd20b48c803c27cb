//! Listening sockets shared across slave generations.
//!
//! The master binds every configured address once and keeps the sockets
//! for its whole lifetime ([`SharedListeners`]). Each slave adopts its
//! copies from inherited descriptors 3..3+n, in configured address order
//! ([`ListenerSet`]). Because the master never closes its copies, the
//! kernel keeps queueing connections while generations hand over.

use tokio::net::TcpListener;

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
#[cfg(unix)]
use tracing::info;

#[cfg(unix)]
use crate::error::Error;

/// Listeners owned by one slave, named by their configured address.
#[derive(Debug, Default)]
pub struct ListenerSet {
    listeners: Vec<(String, TcpListener)>,
}

impl ListenerSet {
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// Take the listener bound for `address`, removing it from the set.
    pub fn take(&mut self, address: &str) -> Option<TcpListener> {
        let pos = self.listeners.iter().position(|(a, _)| a == address)?;
        Some(self.listeners.remove(pos).1)
    }

    /// Take the first remaining listener in address order.
    pub fn take_first(&mut self) -> Option<TcpListener> {
        if self.listeners.is_empty() {
            None
        } else {
            Some(self.listeners.remove(0).1)
        }
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.listeners.iter().map(|(a, _)| a.as_str())
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// All listeners, in configured address order.
    pub fn into_inner(self) -> Vec<(String, TcpListener)> {
        self.listeners
    }
}

#[cfg(unix)]
impl ListenerSet {
    /// Adopt `addresses.len()` listeners inherited at descriptors
    /// `first_fd..first_fd + n`.
    pub(crate) fn adopt(addresses: &[String], first_fd: RawFd, num_fds: usize) -> Result<Self, Error> {
        if num_fds != addresses.len() {
            return Err(Error::Environment(format!(
                "master passed {num_fds} listeners but {} addresses are configured",
                addresses.len()
            )));
        }
        let fds: Vec<RawFd> = (0..num_fds).map(|i| first_fd + i as RawFd).collect();
        Self::from_fds(addresses, &fds)
    }

    /// Adopt one listener per address from `fds`, pairing them by position.
    pub(crate) fn from_fds(addresses: &[String], fds: &[RawFd]) -> Result<Self, Error> {
        let mut listeners = Vec::with_capacity(fds.len());

        for (address, &fd) in addresses.iter().zip(fds) {
            if !validate_fd(fd) {
                return Err(Error::Inherit {
                    fd,
                    reason: format!("not a socket (address {address})"),
                });
            }

            let inherit_err = |e: std::io::Error| Error::Inherit {
                fd,
                reason: e.to_string(),
            };
            // Processes the program spawns must not hold the listening socket.
            set_cloexec(fd).map_err(inherit_err)?;

            // SAFETY: fstat confirmed `fd` is an open socket handed to us by the master.
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
            std_listener.set_nonblocking(true).map_err(inherit_err)?;
            let listener = TcpListener::from_std(std_listener).map_err(inherit_err)?;

            let addr = listener.local_addr().ok();
            info!(fd, address = %address, local = ?addr, "Inherited listener from master");
            listeners.push((address.clone(), listener));
        }

        Ok(Self { listeners })
    }
}

/// The master's copies of the bound sockets.
///
/// Each socket sits on a close-on-exec descriptor above `fd_floor`, so it
/// can be duplicated onto the contiguous child range 3..3+n without
/// clobbering another source descriptor.
#[cfg(unix)]
#[derive(Debug)]
pub(crate) struct SharedListeners {
    entries: Vec<SharedListener>,
}

#[cfg(unix)]
#[derive(Debug)]
struct SharedListener {
    address: String,
    local_addr: std::net::SocketAddr,
    fd: OwnedFd,
}

#[cfg(unix)]
impl SharedListeners {
    /// Bind every address in order. Any failure drops the ones already bound.
    pub fn bind(addresses: &[String], fd_floor: RawFd) -> Result<Self, Error> {
        let mut entries = Vec::with_capacity(addresses.len());
        for address in addresses {
            let bind_err = |source| Error::Bind {
                address: address.clone(),
                source,
            };
            let listener = std::net::TcpListener::bind(normalize_address(address)).map_err(bind_err)?;
            let local_addr = listener.local_addr().map_err(bind_err)?;
            let fd = crate::process::dup_above(listener.as_raw_fd(), fd_floor).map_err(bind_err)?;
            info!(address = %address, local = %local_addr, "Bound listener");
            entries.push(SharedListener {
                address: address.clone(),
                local_addr,
                fd,
            });
        }
        Ok(Self { entries })
    }

    /// Descriptors to hand to a child, in address order.
    pub fn raw_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.entries.iter().map(|e| e.fd.as_raw_fd())
    }

    pub fn local_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.entries.iter().map(|e| e.local_addr).collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.address.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Expand a port-only address (`:8080`) to all interfaces.
pub(crate) fn normalize_address(address: &str) -> String {
    let address = address.trim();
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

#[cfg(unix)]
fn set_cloexec(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Validate that a file descriptor is an open socket using fstat.
#[cfg(unix)]
pub(crate) fn validate_fd(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use tracing::debug;

use crate::addr::WireAddr;
use crate::error::{Result, TransportError};

/// A connected duplex byte stream implementing Read + Write.
///
/// This is the fundamental I/O type returned by transport operations.
/// It wraps either a TCP stream or a Unix domain socket stream.
pub struct WireStream {
    inner: StreamInner,
}

enum StreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for WireStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for WireStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl WireStream {
    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: StreamInner::Tcp(stream),
        }
    }

    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: StreamInner::Unix(stream),
        }
    }

    /// Connect to `addr`, waiting at most `timeout` for the connection to be
    /// established.
    ///
    /// TCP honors the timeout window natively. Unix-socket connects complete
    /// or fail immediately in the kernel, so the window does not apply there.
    pub fn connect(addr: &WireAddr, timeout: Duration) -> Result<Self> {
        match addr {
            WireAddr::Tcp(socket_addr) => {
                let stream =
                    TcpStream::connect_timeout(socket_addr, timeout).map_err(|source| {
                        if source.kind() == std::io::ErrorKind::TimedOut {
                            TransportError::ConnectTimeout {
                                addr: addr.clone(),
                                timeout,
                            }
                        } else {
                            TransportError::Connect {
                                addr: addr.clone(),
                                source,
                            }
                        }
                    })?;
                stream.set_nodelay(true).map_err(TransportError::Io)?;
                debug!(%addr, "connected over tcp");
                Ok(Self::from_tcp(stream))
            }
            #[cfg(unix)]
            WireAddr::Unix(path) => {
                let stream = std::os::unix::net::UnixStream::connect(path).map_err(|source| {
                    TransportError::Connect {
                        addr: addr.clone(),
                        source,
                    }
                })?;
                debug!(%addr, "connected over unix domain socket");
                Ok(Self::from_unix(stream))
            }
        }
    }

    /// Shut down both directions of the stream.
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.shutdown(Shutdown::Both).map_err(Into::into),
        }
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Switch the stream between blocking and non-blocking I/O.
    ///
    /// Streams accepted from a non-blocking listener inherit its mode on
    /// some platforms; callers wanting blocking reads should set this
    /// explicitly.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            StreamInner::Tcp(stream) => {
                let cloned = stream.try_clone()?;
                Ok(Self::from_tcp(cloned))
            }
            #[cfg(unix)]
            StreamInner::Unix(stream) => {
                let cloned = stream.try_clone()?;
                Ok(Self::from_unix(cloned))
            }
        }
    }

    /// Get the credentials of the connected peer (Linux Unix sockets only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            StreamInner::Unix(stream) => stream.as_raw_fd(),
            StreamInner::Tcp(_) => return None,
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this process.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl std::fmt::Debug for WireStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            StreamInner::Tcp(_) => f.debug_struct("WireStream").field("type", &"tcp").finish(),
            #[cfg(unix)]
            StreamInner::Unix(_) => f.debug_struct("WireStream").field("type", &"unix").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_refused_maps_to_connect_error() {
        // Bind then drop to get a port that refuses connections.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = WireAddr::Tcp(listener.local_addr().unwrap());
        drop(listener);

        let err = WireStream::connect(&addr, Duration::from_millis(500)).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::ConnectTimeout { .. }
        ));
    }

    #[test]
    #[cfg(unix)]
    fn unix_pair_reads_and_writes() {
        use std::io::{Read, Write};

        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut a = WireStream::from_unix(left);
        let mut b = WireStream::from_unix(right);

        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    #[cfg(unix)]
    fn shutdown_ends_reads_with_eof() {
        use std::io::Read;

        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let a = WireStream::from_unix(left);
        let mut b = WireStream::from_unix(right);

        a.shutdown().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn peer_credentials_report_own_process() {
        let (left, _right) = std::os::unix::net::UnixStream::pair().unwrap();
        let stream = WireStream::from_unix(left);
        let (uid, _gid, pid) = stream.peer_credentials().expect("linux exposes SO_PEERCRED");
        assert_eq!(pid, std::process::id());
        // SAFETY: getuid has no preconditions.
        assert_eq!(uid, unsafe { libc::getuid() });
    }
}

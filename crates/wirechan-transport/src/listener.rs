use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
#[cfg(unix)]
use std::os::unix::net::UnixListener;
#[cfg(unix)]
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::addr::WireAddr;
use crate::error::{Result, TransportError};
use crate::stream::WireStream;

/// Listening endpoint for incoming channel connections.
///
/// TCP listeners bind a socket address. Unix-socket listeners create the
/// socket file with hardened permissions, replace stale socket files, and
/// remove the path again on `Drop` (only while its inode identity is
/// unchanged).
pub struct WireListener {
    inner: ListenerInner,
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
        created_inode: Option<(u64, u64)>,
        cleanup_on_drop: bool,
    },
}

impl WireListener {
    /// Default permission mode for created socket paths.
    #[cfg(unix)]
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(all(unix, not(target_os = "linux")))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on `addr`.
    pub fn bind(addr: &WireAddr) -> Result<Self> {
        match addr {
            WireAddr::Tcp(socket_addr) => {
                let listener =
                    TcpListener::bind(socket_addr).map_err(|source| TransportError::Bind {
                        addr: addr.clone(),
                        source,
                    })?;
                info!(%addr, "listening on tcp");
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                })
            }
            #[cfg(unix)]
            WireAddr::Unix(path) => Self::bind_unix_with_mode(path, Self::DEFAULT_SOCKET_MODE),
        }
    }

    /// Bind a Unix-socket listener with an explicit permission mode.
    #[cfg(unix)]
    pub fn bind_unix_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bind_err = |path: &PathBuf, source: std::io::Error| TransportError::Bind {
            addr: WireAddr::Unix(path.clone()),
            source,
        };

        // Validate path length
        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Remove stale socket if it exists, but never remove non-socket files.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| bind_err(&path, e))?;
            } else {
                return Err(bind_err(
                    &path,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                ));
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| bind_err(&path, e))?;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| bind_err(&path, e))?;
        let created_metadata = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;
        let created_inode = Some((created_metadata.dev(), created_metadata.ino()));

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            inner: ListenerInner::Unix {
                listener,
                path,
                created_inode,
                cleanup_on_drop: true,
            },
        })
    }

    /// Switch the listener between blocking and non-blocking accepts.
    ///
    /// In non-blocking mode, `accept` with no pending connection fails with
    /// an `Accept` error of kind `WouldBlock`, so callers can poll a
    /// shutdown flag between attempts.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                listener.set_nonblocking(nonblocking).map_err(Into::into)
            }
            #[cfg(unix)]
            ListenerInner::Unix { listener, .. } => {
                listener.set_nonblocking(nonblocking).map_err(Into::into)
            }
        }
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<WireStream> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, peer) = listener.accept().map_err(TransportError::Accept)?;
                stream.set_nodelay(true).map_err(TransportError::Io)?;
                debug!(%peer, "accepted tcp connection");
                Ok(WireStream::from_tcp(stream))
            }
            #[cfg(unix)]
            ListenerInner::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().map_err(TransportError::Accept)?;
                debug!("accepted unix connection");
                Ok(WireStream::from_unix(stream))
            }
        }
    }

    /// The address this listener is bound to.
    ///
    /// For TCP this reflects the actual bound port (useful with port 0).
    pub fn addr(&self) -> Result<WireAddr> {
        match &self.inner {
            ListenerInner::Tcp(listener) => Ok(WireAddr::Tcp(listener.local_addr()?)),
            #[cfg(unix)]
            ListenerInner::Unix { path, .. } => Ok(WireAddr::Unix(path.clone())),
        }
    }
}

#[cfg(unix)]
impl Drop for WireListener {
    fn drop(&mut self) {
        if let ListenerInner::Unix {
            path,
            created_inode,
            cleanup_on_drop,
            ..
        } = &self.inner
        {
            if !cleanup_on_drop {
                return;
            }
            if let Some((expected_dev, expected_ino)) = created_inode {
                if let Ok(metadata) = std::fs::symlink_metadata(path) {
                    if metadata.file_type().is_socket()
                        && metadata.dev() == *expected_dev
                        && metadata.ino() == *expected_ino
                    {
                        debug!(?path, "cleaning up socket file");
                        let _ = std::fs::remove_file(path);
                    } else {
                        debug!(?path, "socket path identity changed; skipping cleanup");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    #[test]
    fn tcp_bind_accept_connect() {
        let addr: WireAddr = "127.0.0.1:0".parse().unwrap();
        let listener = WireListener::bind(&addr).unwrap();
        let bound = listener.addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut client = WireStream::connect(&bound, Duration::from_secs(1)).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn unix_bind_accept_connect() {
        let dir = std::env::temp_dir().join(format!("wirechan-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("test.sock");
        let addr = WireAddr::unix(&sock_path);

        let listener = WireListener::bind(&addr).unwrap();
        assert!(sock_path.exists());

        // Connect from another thread
        let addr_clone = addr.clone();
        let handle = std::thread::spawn(move || {
            let mut client = WireStream::connect(&addr_clone, Duration::from_secs(1)).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();

        // Cleanup
        drop(listener);
        assert!(
            !sock_path.exists(),
            "socket file should be cleaned up on drop"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn nonblocking_accept_reports_would_block_when_idle() {
        let addr: WireAddr = "127.0.0.1:0".parse().unwrap();
        let listener = WireListener::bind(&addr).unwrap();
        listener.set_nonblocking(true).unwrap();

        match listener.accept() {
            Err(TransportError::Accept(err)) => {
                assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
            }
            other => panic!("idle non-blocking accept should not yield {other:?}"),
        }
    }

    #[test]
    #[cfg(unix)]
    fn unix_path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = WireListener::bind(&WireAddr::unix(&long_path));
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    #[cfg(unix)]
    fn unix_bind_default_permissions_hardened() {
        let dir = std::env::temp_dir().join(format!("wirechan-perms-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("perm.sock");

        let listener = WireListener::bind(&WireAddr::unix(&sock_path)).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    #[cfg(unix)]
    fn unix_bind_rejects_existing_non_socket_file() {
        let dir = std::env::temp_dir().join(format!("wirechan-bind-file-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = WireListener::bind(&WireAddr::unix(&sock_path));
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_file(&sock_path);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    #[cfg(unix)]
    fn unix_drop_does_not_remove_replaced_path() {
        let dir = std::env::temp_dir().join(format!("wirechan-drop-race-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("drop.sock");

        let listener = WireListener::bind(&WireAddr::unix(&sock_path)).unwrap();
        assert!(sock_path.exists());

        // Replace path while listener is alive.
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"replacement-file").unwrap();

        drop(listener);
        assert!(
            sock_path.exists(),
            "drop must not remove path if inode identity changed"
        );

        let _ = std::fs::remove_file(&sock_path);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

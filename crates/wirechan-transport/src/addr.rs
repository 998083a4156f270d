use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TransportError;

/// Address of a stream endpoint: a TCP socket address or a filesystem path
/// to a Unix domain socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl WireAddr {
    /// Build a Unix-socket address from a path.
    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        WireAddr::Unix(path.into())
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self {
            WireAddr::Tcp(_) => "tcp",
            #[cfg(unix)]
            WireAddr::Unix(_) => "unix-domain-socket",
        }
    }
}

impl fmt::Display for WireAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireAddr::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            WireAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<SocketAddr> for WireAddr {
    fn from(addr: SocketAddr) -> Self {
        WireAddr::Tcp(addr)
    }
}

impl FromStr for WireAddr {
    type Err = TransportError;

    /// Parse `host:port` as TCP; anything containing a path separator (or
    /// starting with `.`) as a Unix socket path.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = input.parse::<SocketAddr>() {
            return Ok(WireAddr::Tcp(addr));
        }

        #[cfg(unix)]
        if input.contains('/') || input.starts_with('.') {
            return Ok(WireAddr::Unix(PathBuf::from(input)));
        }

        Err(TransportError::BadAddress(input.to_string()))
    }
}

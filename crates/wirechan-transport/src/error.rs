use std::time::Duration;

use crate::addr::WireAddr;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: WireAddr,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: WireAddr,
        source: std::io::Error,
    },

    /// No connection was established within the timeout window.
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: WireAddr, timeout: Duration },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: std::path::PathBuf,
        len: usize,
        max: usize,
    },

    /// The address string is not a TCP address or a socket path.
    #[error("unrecognized address: {0}")]
    BadAddress(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

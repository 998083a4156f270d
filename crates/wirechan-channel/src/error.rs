use std::time::Duration;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Operation on a handle that has already been closed.
    #[error("channel is closed")]
    Closed,

    /// No connected signal arrived within the timeout window.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// `start` was called on an already-started local channel.
    #[error("channel already started")]
    AlreadyStarted,

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] wirechan_transport::TransportError),

    /// Framing or serialization error.
    #[error("frame error: {0}")]
    Frame(#[from] wirechan_frame::FrameError),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

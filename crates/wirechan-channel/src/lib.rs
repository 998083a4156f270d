//! Message channels over two interchangeable delivery mechanisms.
//!
//! [`SocketChannel`] owns one stream-socket connection and turns raw byte
//! deliveries into ordered `message` events, with outbound sends serialized
//! through a per-connection FIFO. [`LocalChannel`] is the in-process peer:
//! synchronous topic-keyed fan-out with no transport or framing involved.
//! Both meet consumers at the [`ChannelSender`] seam.

pub mod error;
pub mod local;
pub mod registry;
pub mod sender;
pub mod socket;

pub use error::{ChannelError, Result};
pub use local::{LocalChannel, TopicHandler};
pub use registry::ListenerId;
pub use sender::ChannelSender;
pub use socket::{ChannelConfig, SocketChannel, DEFAULT_CONNECT_TIMEOUT};

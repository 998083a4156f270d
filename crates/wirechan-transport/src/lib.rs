//! Duplex byte-stream transport abstraction for message channels.
//!
//! Provides a unified interface over the stream transports a channel can
//! ride on:
//! - TCP sockets (all platforms)
//! - Unix domain sockets (Linux/macOS)
//!
//! This is the lowest layer of wirechan. Everything else builds on top of
//! the [`WireStream`] type provided here.

pub mod addr;
pub mod error;
pub mod listener;
pub mod stream;

pub use addr::WireAddr;
pub use error::{Result, TransportError};
pub use listener::WireListener;
pub use stream::WireStream;

//! Decimal-length-prefixed JSON framing for byte streams.
//!
//! This is the core value-add layer of wirechan. Every message is one frame:
//! - The payload byte length rendered as ASCII decimal digits
//! - A single `@` separator
//! - Exactly that many bytes of UTF-8 JSON
//!
//! Frames may arrive fragmented at any byte boundary; the decoder buffers
//! partial frames and yields complete values in arrival order. No partial
//! reads, no buffer management in user code.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_value, encode_value, FrameConfig, ValueDecoder, DEFAULT_MAX_HEADER_DIGITS,
    DEFAULT_MAX_PAYLOAD, SEPARATOR,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;

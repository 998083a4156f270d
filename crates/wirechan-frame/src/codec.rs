use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;

use crate::error::{FrameError, Result};

/// Header/payload separator. A single reserved byte that can never appear in
/// a run of decimal digits.
pub const SEPARATOR: u8 = b'@';

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default maximum number of length digits before the separator must appear.
///
/// Ten digits cover any payload the default size limit admits; a longer run
/// means the stream is not speaking this protocol.
pub const DEFAULT_MAX_HEADER_DIGITS: usize = 10;

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Maximum digits allowed in the length header.
    pub max_header_digits: usize,
    /// Read timeout the stream owner applies to blocking reads.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout the stream owner applies to blocking writes.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_header_digits: DEFAULT_MAX_HEADER_DIGITS,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Encode a value into the wire format, appending to `dst`.
///
/// Wire format:
/// ```text
/// ┌────────────────────┬───────────┬────────────────────┐
/// │ Length (ASCII      │ Separator │ Payload            │
/// │ decimal digits)    │ `@`       │ (Length bytes of   │
/// │                    │           │  UTF-8 JSON)       │
/// └────────────────────┴───────────┴────────────────────┘
/// ```
///
/// Returns the payload byte length. Nothing is written if serialization
/// fails.
pub fn encode_value<T: Serialize>(value: &T, dst: &mut BytesMut) -> Result<usize> {
    let json = serde_json::to_vec(value)?;
    let header = json.len().to_string();

    dst.reserve(header.len() + 1 + json.len());
    dst.put_slice(header.as_bytes());
    dst.put_u8(SEPARATOR);
    dst.put_slice(&json);
    Ok(json.len())
}

/// Decode one value from the front of a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet;
/// nothing is consumed in that case. On success, consumes the frame bytes
/// from the buffer.
pub fn decode_value(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Value>> {
    if src.is_empty() {
        return Ok(None);
    }

    // Scan only as far as a legal header can reach.
    let scan_end = src.len().min(config.max_header_digits + 1);
    let separator_idx = match src[..scan_end].iter().position(|&b| b == SEPARATOR) {
        Some(idx) => idx,
        None if src.len() > config.max_header_digits => {
            return Err(FrameError::BadHeader("length field too long"));
        }
        None => return Ok(None), // Need more data
    };

    if separator_idx == 0 {
        return Err(FrameError::BadHeader("missing length digits"));
    }

    let mut payload_len = 0usize;
    for &byte in &src[..separator_idx] {
        if !byte.is_ascii_digit() {
            return Err(FrameError::BadHeader("length is not a decimal integer"));
        }
        payload_len = payload_len
            .checked_mul(10)
            .and_then(|n| n.checked_add((byte - b'0') as usize))
            .ok_or(FrameError::BadHeader("length overflows"))?;
    }

    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }

    let total = separator_idx + 1 + payload_len;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    src.advance(separator_idx + 1);
    let payload = src.split_to(payload_len);

    if payload.is_empty() {
        return Err(FrameError::MalformedFrame("empty payload"));
    }
    let value: Value = serde_json::from_slice(&payload)?;
    if value.is_null() {
        return Err(FrameError::MalformedFrame("payload decodes to null"));
    }

    Ok(Some(value))
}

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Stateful decoder: accumulates fragmented byte deliveries and yields
/// complete values in arrival order.
///
/// The buffer is owned exclusively by one decoder instance; it holds at most
/// one trailing partial frame. A decode error is fatal to this decoder;
/// there is no resynchronization after a malformed frame.
#[derive(Debug)]
pub struct ValueDecoder {
    buf: BytesMut,
    config: FrameConfig,
}

impl Default for ValueDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueDecoder {
    /// Create a decoder with default configuration.
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    /// Create a decoder with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Append raw bytes to the receive buffer. No parsing occurs here.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete value, or `Ok(None)` if none is buffered.
    pub fn next_value(&mut self) -> Result<Option<Value>> {
        decode_value(&mut self.buf, &self.config)
    }

    /// Extract every complete buffered value, in order.
    ///
    /// Finite and non-blocking: returns once the buffer holds no further
    /// complete frame. A trailing partial frame stays buffered.
    pub fn drain(&mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(value) = self.next_value()? {
            values.push(value);
        }
        Ok(values)
    }

    /// Number of bytes currently buffered (partial frame remainder).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

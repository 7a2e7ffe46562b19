//! Frame Protocol
//!
//! Wire format for parley envelopes: the JSON text of one envelope followed
//! by four NUL bytes.
//!
//! # Frame Format
//!
//! ```text
//! +------------------------------------------+------------------+
//! | JSON Payload (variable, UTF-8)           | 0x00 0x00 0x00 0x00 |
//! | Request or Response envelope             | terminator       |
//! +------------------------------------------+------------------+
//! ```
//!
//! There is no length prefix. The terminator can never occur inside the
//! payload because JSON text escapes control characters (`\u0000`).
//!
//! # Security
//!
//! - Maximum frame size is enforced on both encode and decode
//! - A buffer that grows past the limit without a terminator is rejected
//!   instead of accumulating without bound

use serde_json::Value;

use super::config::DEFAULT_MAX_FRAME_SIZE;
use super::TransportError;
use crate::envelope::Envelope;

/// Bytes that close every frame
pub const FRAME_TERMINATOR: [u8; 4] = [0; 4];

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Position of the first terminator in `haystack`
fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(FRAME_TERMINATOR.len())
        .position(|window| window == FRAME_TERMINATOR)
}

/// Encode an envelope to a terminated frame
///
/// # Errors
///
/// Returns `TransportError::Serialization` if JSON serialization fails and
/// `TransportError::FrameTooLarge` if the payload exceeds `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, TransportError> {
    encode_with_limit(envelope, DEFAULT_MAX_FRAME_SIZE)
}

fn encode_with_limit(envelope: &Envelope, max_frame_size: usize) -> Result<Vec<u8>, TransportError> {
    let mut buf = serde_json::to_vec(envelope)
        .map_err(|e| TransportError::Serialization(e.to_string()))?;

    if buf.len() > max_frame_size {
        return Err(TransportError::FrameTooLarge {
            size: buf.len(),
            max: max_frame_size,
        });
    }

    buf.extend_from_slice(&FRAME_TERMINATOR);
    Ok(buf)
}

/// Split a byte stream into envelopes
///
/// Every terminator yields one envelope; bytes after the last terminator are
/// returned so they can be prefixed to the next read.
///
/// # Errors
///
/// Fails on the first frame that is not a valid envelope.
pub fn decode_stream(buffer: &[u8]) -> Result<(Vec<Envelope>, Vec<u8>), TransportError> {
    let mut decoder = FrameDecoder::new();
    decoder.push(buffer);

    let mut envelopes = Vec::new();
    while let Some(envelope) = decoder.next_frame()? {
        envelopes.push(envelope);
    }

    Ok((envelopes, decoder.remaining().to_vec()))
}

/// Encoder for outbound frames with a size limit
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    max_frame_size: usize,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    /// Create a new encoder with the default size limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create an encoder refusing payloads above `max_frame_size`
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Encode an envelope to bytes
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, TransportError> {
        encode_with_limit(envelope, self.max_frame_size)
    }
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete envelopes.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Position where the next terminator search resumes
    scan_pos: usize,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder rejecting payloads above `max_frame_size`
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scan_pos: 0,
            max_frame_size,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.scan_pos -= self.read_pos;
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Bytes received but not yet part of a complete frame
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.buffer[self.read_pos..]
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(envelope))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(TransportError::FrameTooLarge)` if the limit is exceeded
    /// - `Err(TransportError::Protocol)` if the frame is not a valid envelope
    pub fn next_frame(&mut self) -> Result<Option<Envelope>, TransportError> {
        let start = self.read_pos;
        let search_from = self.scan_pos.max(start);

        let Some(offset) = find_terminator(&self.buffer[search_from..]) else {
            // A terminator may straddle this read and the next one
            self.scan_pos = self
                .buffer
                .len()
                .saturating_sub(FRAME_TERMINATOR.len() - 1)
                .max(start);

            let pending = self.available();
            if pending > self.max_frame_size + FRAME_TERMINATOR.len() {
                return Err(TransportError::FrameTooLarge {
                    size: pending,
                    max: self.max_frame_size,
                });
            }
            return Ok(None);
        };

        let end = search_from + offset;
        self.read_pos = end + FRAME_TERMINATOR.len();
        self.scan_pos = self.read_pos;

        let payload = &self.buffer[start..end];
        if payload.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        let text = std::str::from_utf8(payload)
            .map_err(|e| TransportError::Protocol(format!("frame is not UTF-8: {e}")))?;
        let value: Value = serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("frame is not JSON: {e}")))?;
        let envelope = Envelope::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("frame is not an envelope: {e}")))?;

        Ok(Some(envelope))
    }
}

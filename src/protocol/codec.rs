//! Length-prefix framing
//!
//! Splits a byte stream into frame bodies and back. A frame on the wire is the
//! body length in decimal ASCII followed directly by the body. Bodies always
//! start with a non-digit opcode, which terminates the length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::MAX_FRAME_SIZE;

/// Longest accepted length prefix; bounds digit accumulation before overflow
const MAX_LENGTH_DIGITS: usize = 19;

/// Framing errors. All of them are fatal for the connection.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid length prefix: unexpected byte {0:#04x}")]
    InvalidLength(u8),

    #[error("Length prefix too long")]
    LengthOverflow,

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),
}

/// Writes frame bodies in the wire format
#[derive(Debug, Clone)]
pub struct Encoder {
    max_frame_size: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Append `len(body)` as decimal ASCII, then the body itself
    pub fn encode(&self, body: &[u8], buf: &mut BytesMut) -> Result<(), CodecError> {
        if body.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        if body.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(body.len(), self.max_frame_size));
        }

        let length = body.len().to_string();
        buf.reserve(length.len() + body.len());
        buf.put_slice(length.as_bytes());
        buf.put_slice(body);
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassembles frame bodies from arbitrarily chunked input.
///
/// State persists across calls, so length prefixes and bodies may be split
/// anywhere between reads.
#[derive(Debug)]
pub struct Decoder {
    state: DecodeState,
    max_frame_size: usize,
}

#[derive(Debug, Default, Clone, Copy)]
enum DecodeState {
    #[default]
    Length,
    Body {
        remaining: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::Length,
            max_frame_size,
        }
    }

    /// Attempt to decode one frame body from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        loop {
            match self.state {
                DecodeState::Length => {
                    if buf.is_empty() {
                        return Ok(None);
                    }

                    let digits = buf.iter().take_while(|b| b.is_ascii_digit()).count();
                    if digits > MAX_LENGTH_DIGITS {
                        return Err(CodecError::LengthOverflow);
                    }
                    if digits == buf.len() {
                        // The prefix may continue in the next chunk
                        return Ok(None);
                    }
                    if digits == 0 {
                        return Err(CodecError::InvalidLength(buf[0]));
                    }

                    let length = buf[..digits].iter().try_fold(0usize, |acc, &b| {
                        acc.checked_mul(10)?.checked_add(usize::from(b - b'0'))
                    });
                    let length = length.ok_or(CodecError::LengthOverflow)?;

                    if length == 0 {
                        return Err(CodecError::EmptyFrame);
                    }
                    if length > self.max_frame_size {
                        return Err(CodecError::FrameTooLarge(length, self.max_frame_size));
                    }

                    buf.advance(digits);
                    self.state = DecodeState::Body { remaining: length };
                }
                DecodeState::Body { remaining } => {
                    if buf.len() < remaining {
                        return Ok(None);
                    }

                    let body = buf.split_to(remaining).freeze();
                    self.state = DecodeState::Length;
                    return Ok(Some(body));
                }
            }
        }
    }

    /// Whether the decoder sits on a frame boundary
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Length)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

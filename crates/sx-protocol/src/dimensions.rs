//! Terminal dimension encoding/decoding
//!
//! A dimension record is 8 bytes:
//! - width: 4 bytes (u32, big-endian, character cells)
//! - height: 4 bytes (u32, big-endian, character cells)
//!
//! A `window-change` payload starts with the record. A `pty-req` payload
//! starts with the terminal name as an SSH string (4-byte big-endian length,
//! then the name), followed by the record.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::request::put_string;

/// Size of a dimension record in bytes
pub const DIMENSION_RECORD_SIZE: usize = 8;

/// Size of the terminal name length prefix in a `pty-req` payload
pub const TERM_LENGTH_SIZE: usize = 4;

/// Terminal size in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScreenSize {
    /// Columns
    pub width: u32,
    /// Rows
    pub height: u32,
}

impl ScreenSize {
    /// Create a new screen size
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Decode a dimension record from the start of `src`
    ///
    /// Bytes past the first record are ignored.
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < DIMENSION_RECORD_SIZE {
            return Err(ProtocolError::MalformedPayload {
                needed: DIMENSION_RECORD_SIZE,
                actual: src.len(),
            });
        }

        let mut buf = src;
        let width = buf.get_u32();
        let height = buf.get_u32();
        Ok(Self { width, height })
    }

    /// Encode the dimension record into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(DIMENSION_RECORD_SIZE);
        dst.put_u32(self.width);
        dst.put_u32(self.height);
    }
}

impl fmt::Display for ScreenSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Decoded `pty-req` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal name (`TERM`), lossily decoded
    pub term: String,
    /// Initial terminal size
    pub size: ScreenSize,
}

impl PtyRequest {
    /// Create a new pty request
    pub fn new(term: impl Into<String>, size: ScreenSize) -> Self {
        Self {
            term: term.into(),
            size,
        }
    }

    /// Decode a full `pty-req` payload
    ///
    /// The terminal name length is taken from byte 3 alone, the low byte of
    /// the length prefix, so the record is found at `payload[3] + 4`. Pixel
    /// dimensions and terminal modes after the record are ignored.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < TERM_LENGTH_SIZE {
            return Err(ProtocolError::MalformedPayload {
                needed: TERM_LENGTH_SIZE,
                actual: payload.len(),
            });
        }

        let term_len = payload[TERM_LENGTH_SIZE - 1] as usize;
        let offset = TERM_LENGTH_SIZE + term_len;
        let needed = offset + DIMENSION_RECORD_SIZE;
        if payload.len() < needed {
            return Err(ProtocolError::MalformedPayload {
                needed,
                actual: payload.len(),
            });
        }

        let term = String::from_utf8_lossy(&payload[TERM_LENGTH_SIZE..offset]).into_owned();
        let size = ScreenSize::decode(&payload[offset..])?;
        Ok(Self { term, size })
    }

    /// Encode as a `pty-req` payload with zero pixel size and no terminal modes
    ///
    /// Names longer than 255 bytes do not decode back.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(
            TERM_LENGTH_SIZE + self.term.len() + DIMENSION_RECORD_SIZE * 2 + 5,
        );
        put_string(&mut dst, self.term.as_bytes());
        self.size.encode(&mut dst);
        // pixel width, pixel height
        dst.put_u32(0);
        dst.put_u32(0);
        // encoded terminal modes: TTY_OP_END only
        put_string(&mut dst, &[0]);
        dst.freeze()
    }
}

/// Build a `window-change` payload with zero pixel size
pub fn window_change_payload(size: ScreenSize) -> Bytes {
    let mut dst = BytesMut::with_capacity(DIMENSION_RECORD_SIZE * 2);
    size.encode(&mut dst);
    dst.put_u32(0);
    dst.put_u32(0);
    dst.freeze()
}

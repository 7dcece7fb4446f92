//! Byte codecs for the two admin channels.
//!
//! Everything on the wire is little-endian; strings travel as UTF-16LE with
//! explicit byte counts. The control channel is request/reply with a
//! `{ type, total_size }` header; the monitor channel is a one-way stream of
//! `{ body_size, records }` frames. Codecs are pure over byte slices, with
//! thin async read/write helpers on top.

#![deny(unsafe_code)]

use thiserror::Error;

mod control;
mod record;
mod utf16;

pub use control::{
    read_reply, read_request, write_reply, write_request, MessageType, Reply, ReplyPayload,
    Request,
};
pub use record::{
    decode_frame, decode_record, encode_record_into, encoded_record_len, read_frame, write_frame,
    RECORD_FIXED_BYTES,
};
pub use utf16::{decode_utf16le, encode_utf16le};

use fsgate_core::status::OpStatus;

/// Decode and I/O failures for both channels.
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying socket failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed message: bad size, bad string, out-of-range enum value.
    #[error("invalid message: {0}")]
    InvalidArgument(String),
    /// Request type code outside the protocol.
    #[error("unknown message type {0}")]
    UnknownType(u32),
    /// Declared size exceeds the channel ceiling.
    #[error("message of {got} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Declared size.
        got: usize,
        /// Allowed ceiling.
        limit: usize,
    },
}

impl WireError {
    /// Platform status code reported for this failure on a reply header.
    #[must_use]
    pub fn status(&self) -> OpStatus {
        match self {
            WireError::UnknownType(_) => OpStatus::NOT_SUPPORTED,
            WireError::TooLarge { .. } => OpStatus::BUFFER_TOO_SMALL,
            _ => OpStatus::INVALID_PARAMETER,
        }
    }
}

/// Little-endian reader over a borrowed byte slice.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::InvalidArgument(format!(
                "truncated message: wanted {n} more bytes, have {}",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, WireError> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }

    pub(crate) fn i64(&mut self) -> Result<i64, WireError> {
        Ok(self.u64()? as i64)
    }
}

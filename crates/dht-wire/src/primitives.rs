//! # Primitive Encoding
//!
//! Fixed-width big-endian two's-complement integers and raw byte runs.
//! The layout is shared with peers built on other runtimes, so every width
//! and every byte order here is part of the protocol:
//!
//! | Type | Bytes |
//! |------|-------|
//! | `i8` / `u8` | 1 |
//! | `i16` / `u16` | 2 |
//! | `i32` | 4 |
//! | `i64` | 8 |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Appends primitives to a growable buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Signed bytes go out as their two's-complement bit patterns.
    pub fn write_signed_bytes(&mut self, values: &[i8]) {
        self.buf.reserve(values.len());
        for value in values {
            self.buf.put_i8(*value);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads primitives from the front of a byte buffer, failing instead of
/// panicking when the buffer runs short.
#[derive(Debug, Clone)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    #[must_use]
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.remaining() < needed {
            return Err(WireError::Underflow {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_i8(&mut self) -> Result<i8, WireError> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i16(&mut self) -> Result<i16, WireError> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    /// Split off the next `len` bytes without copying.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, WireError> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn read_signed_bytes(&mut self, len: usize) -> Result<Vec<i8>, WireError> {
        self.ensure(len)?;
        Ok((0..len).map(|_| self.buf.get_i8()).collect())
    }
}

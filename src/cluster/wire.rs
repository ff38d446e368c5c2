//! Cluster wire codec
//!
//! Big-endian primitives for cluster event payloads. Strings are an `i32`
//! byte length followed by UTF-8 bytes; a length of -1 encodes an absent
//! string.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Length marker of an absent string.
const NULL_LENGTH: i32 = -1;

// == Writer ==
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_opt_string(Some(value))
    }

    pub fn put_opt_string(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(value) => {
                self.buf.put_i32(value.len() as i32);
                self.buf.put_slice(value.as_bytes());
            }
            None => self.buf.put_i32(NULL_LENGTH),
        }
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

// == Reader ==
#[derive(Debug)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, len: usize, field: &'static str) -> Result<(), WireError> {
        if self.buf.remaining() < len {
            Err(WireError::Truncated(field))
        } else {
            Ok(())
        }
    }

    pub fn get_u8(&mut self, field: &'static str) -> Result<u8, WireError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self, field: &'static str) -> Result<bool, WireError> {
        Ok(self.get_u8(field)? != 0)
    }

    pub fn get_i64(&mut self, field: &'static str) -> Result<i64, WireError> {
        self.need(8, field)?;
        Ok(self.buf.get_i64())
    }

    pub fn get_u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_opt_string(&mut self, field: &'static str) -> Result<Option<String>, WireError> {
        self.need(4, field)?;
        let len = self.buf.get_i32();
        if len == NULL_LENGTH {
            return Ok(None);
        }
        let len = usize::try_from(len).map_err(|_| WireError::Truncated(field))?;
        self.need(len, field)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| WireError::InvalidUtf8(field))
    }

    /// Reads a string that must be present.
    pub fn get_string(&mut self, field: &'static str) -> Result<String, WireError> {
        self.get_opt_string(field)?
            .ok_or(WireError::MissingField(field))
    }
}

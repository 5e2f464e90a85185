//! Binary stream codec
//!
//! Length-prefixed strings and flag-prefixed optionals over `bytes`
//! buffers. Integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Wire decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("Unexpected end of stream: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("Invalid {what} tag: {tag}")]
    InvalidTag { what: &'static str, tag: u8 },
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Types that can be written to a stream
pub trait Writeable {
    fn write_to(&self, out: &mut StreamOutput);
}

fn length_prefix(len: usize) -> u32 {
    match u32::try_from(len) {
        Ok(prefix) => prefix,
        Err(_) => panic!("string of {} bytes exceeds the u32 length prefix", len),
    }
}

/// Output stream
#[derive(Debug, Default)]
pub struct StreamOutput {
    buf: BytesMut,
}

impl StreamOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    /// Strings are limited to `u32::MAX` bytes; longer ones panic rather
    /// than write a truncated length prefix.
    pub fn write_string(&mut self, value: &str) {
        self.buf.put_u32(length_prefix(value.len()));
        self.buf.put_slice(value.as_bytes());
    }

    pub fn write_optional_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => {
                self.write_bool(true);
                self.write_string(s);
            }
            None => self.write_bool(false),
        }
    }

    pub fn write_optional<T: Writeable>(&mut self, value: Option<&T>) {
        match value {
            Some(v) => {
                self.write_bool(true);
                v.write_to(self);
            }
            None => self.write_bool(false),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing and hand out the immutable buffer
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Input stream
#[derive(Debug)]
pub struct StreamInput {
    buf: Bytes,
}

impl StreamInput {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn ensure(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.remaining() < needed {
            return Err(WireError::UnexpectedEof {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(WireError::InvalidTag { what: "bool", tag }),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn read_optional_string(&mut self) -> Result<Option<String>, WireError> {
        if self.read_bool()? {
            Ok(Some(self.read_string()?))
        } else {
            Ok(None)
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Fail if anything is left unread
    pub fn finish(self) -> Result<(), WireError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefix_bound() {
        assert_eq!(length_prefix(0), 0);
        assert_eq!(length_prefix(u32::MAX as usize), u32::MAX);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    #[should_panic(expected = "exceeds the u32 length prefix")]
    fn test_oversized_length_prefix_panics() {
        length_prefix(u32::MAX as usize + 1);
    }

    #[test]
    fn test_truncated_string_is_rejected() {
        let mut out = StreamOutput::new();
        out.write_string("hello");
        let bytes = out.freeze();

        let mut input = StreamInput::new(bytes.slice(..6));
        assert_eq!(
            input.read_string(),
            Err(WireError::UnexpectedEof { needed: 5, remaining: 2 })
        );
    }

    #[test]
    fn test_optional_flags() {
        let mut out = StreamOutput::new();
        out.write_optional_string(None);
        out.write_optional_string(Some("disk error"));
        out.write_u8(7);

        let mut input = StreamInput::new(out.freeze());
        assert_eq!(input.read_optional_string().unwrap(), None);
        assert_eq!(input.read_optional_string().unwrap().as_deref(), Some("disk error"));
        assert!(input.read_bool().is_err());
    }

    #[test]
    fn test_trailing_bytes() {
        let mut out = StreamOutput::new();
        out.write_u32(1);
        out.write_u8(0);
        let mut input = StreamInput::new(out.freeze());
        input.read_u32().unwrap();
        assert_eq!(input.finish(), Err(WireError::TrailingBytes(1)));
    }
}

//! SSH binary data representation (RFC 4251 Section 5).
//!
//! Decoding consumes a [`Bytes`] buffer left to right through [`WireReader`].
//! Variable-length fields are returned as zero-copy slices of the input.
//! Encoding goes through the [`SshBufMut`] extension trait, implemented for
//! every [`BufMut`].
//!
//! | Type | Layout |
//! |------|--------|
//! | `byte`, `uint32`, `uint64` | fixed width, big-endian |
//! | `boolean` | one byte, zero is false |
//! | `string` | `uint32` length + raw bytes |
//! | `name-list` | `string` holding comma separated UTF-8 names |
//! | `mpint` | `string` holding a two's complement big-endian integer |
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use conduit_proto::ssh::wire::{SshBufMut, WireReader};
//!
//! let mut buf = BytesMut::new();
//! buf.put_ssh_string(b"session");
//! buf.put_ssh_u32(7);
//!
//! let mut reader = WireReader::new(buf.freeze());
//! assert_eq!(&reader.read_string().unwrap()[..], b"session");
//! assert_eq!(reader.read_u32().unwrap(), 7);
//! assert!(reader.is_empty());
//! ```

use bytes::{Buf, BufMut, Bytes};
use conduit_platform::{ConduitError, ConduitResult};

/// Cursor over an immutable SSH-encoded buffer.
#[derive(Debug, Clone)]
pub struct WireReader {
    buf: Bytes,
    consumed: usize,
}

impl WireReader {
    /// Wraps `buf` for decoding from its first byte.
    pub fn new(buf: Bytes) -> Self {
        Self { buf, consumed: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// True when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Offset of the cursor from the start of the original buffer.
    pub fn position(&self) -> usize {
        self.consumed
    }

    fn need(&self, needed: usize) -> ConduitResult<()> {
        if self.buf.len() < needed {
            return Err(ConduitError::Truncated {
                needed,
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> ConduitResult<u8> {
        self.need(1)?;
        self.consumed += 1;
        Ok(self.buf.get_u8())
    }

    /// Reads a big-endian `u16`.
    pub fn read_u16(&mut self) -> ConduitResult<u16> {
        self.need(2)?;
        self.consumed += 2;
        Ok(self.buf.get_u16())
    }

    /// Reads a big-endian `u32`.
    pub fn read_u32(&mut self) -> ConduitResult<u32> {
        self.need(4)?;
        self.consumed += 4;
        Ok(self.buf.get_u32())
    }

    /// Reads a big-endian `u64`.
    pub fn read_u64(&mut self) -> ConduitResult<u64> {
        self.need(8)?;
        self.consumed += 8;
        Ok(self.buf.get_u64())
    }

    /// Reads a boolean.
    ///
    /// Any nonzero byte decodes as `true` (RFC 4251 Section 5), so a value
    /// other than 0 or 1 will re-encode as 1.
    pub fn read_bool(&mut self) -> ConduitResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads exactly `len` raw bytes.
    pub fn read_fixed(&mut self, len: usize) -> ConduitResult<Bytes> {
        self.need(len)?;
        self.consumed += len;
        Ok(self.buf.split_to(len))
    }

    /// Reads a length-prefixed byte string without copying.
    ///
    /// A length prefix that exceeds the remaining bytes is an
    /// [`ConduitError::InvalidFormat`] error, not a truncation.
    pub fn read_string(&mut self) -> ConduitResult<Bytes> {
        let len = self.read_u32()? as usize;
        if len > self.buf.len() {
            return Err(ConduitError::InvalidFormat(format!(
                "string length {} exceeds remaining {} bytes",
                len,
                self.buf.len()
            )));
        }
        self.consumed += len;
        Ok(self.buf.split_to(len))
    }

    /// Reads a length-prefixed string that must be valid UTF-8.
    pub fn read_utf8(&mut self) -> ConduitResult<String> {
        let raw = self.read_string()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| ConduitError::InvalidFormat(format!("invalid UTF-8 string: {}", e)))
    }

    /// Reads a comma separated name-list.
    ///
    /// Names are kept verbatim; an empty string is an empty list.
    pub fn read_name_list(&mut self) -> ConduitResult<Vec<String>> {
        let text = self.read_utf8()?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(text.split(',').map(String::from).collect())
    }

    /// Reads an mpint and returns its raw two's complement bytes.
    pub fn read_mpint(&mut self) -> ConduitResult<Bytes> {
        self.read_string()
    }

    /// Takes every remaining byte.
    pub fn read_remaining(&mut self) -> Bytes {
        self.consumed += self.buf.len();
        std::mem::take(&mut self.buf)
    }

    /// Fails if unconsumed bytes remain.
    pub fn finish(&self, what: &str) -> ConduitResult<()> {
        if !self.buf.is_empty() {
            return Err(ConduitError::InvalidFormat(format!(
                "{} has {} trailing bytes",
                what,
                self.buf.len()
            )));
        }
        Ok(())
    }
}

/// SSH encoding helpers for any [`BufMut`].
pub trait SshBufMut: BufMut {
    /// Writes a big-endian `u32`.
    fn put_ssh_u32(&mut self, value: u32) {
        self.put_u32(value);
    }

    /// Writes a boolean as a single 0/1 byte.
    fn put_ssh_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// Writes a length-prefixed byte string.
    fn put_ssh_string(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.put_slice(data);
    }

    /// Writes a length-prefixed UTF-8 string.
    fn put_ssh_utf8(&mut self, text: &str) {
        self.put_ssh_string(text.as_bytes());
    }

    /// Writes a name-list.
    fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_ssh_utf8(&joined);
    }

    /// Writes an unsigned big-endian integer as an mpint.
    fn put_mpint_unsigned(&mut self, magnitude: &[u8]) {
        self.put_ssh_string(&encode_mpint(magnitude));
    }
}

impl<B: BufMut + ?Sized> SshBufMut for B {}

/// Encodes an unsigned big-endian magnitude as mpint content.
///
/// Leading zeros are stripped and a zero byte is prepended when the high
/// bit is set, so the value stays positive. Zero encodes as empty.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed[0] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn reader(bytes: &[u8]) -> WireReader {
        WireReader::new(Bytes::copy_from_slice(bytes))
    }

    #[test]
    fn test_fixed_width_big_endian() {
        let mut r = reader(&[
            0x01, 0x02, 0x03, 0x00, 0x00, 0x01, 0x00, 0, 0, 0, 0, 0, 0, 0, 0x2a,
        ]);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u16().unwrap(), 0x0203);
        assert_eq!(r.read_u32().unwrap(), 0x100);
        assert_eq!(r.read_u64().unwrap(), 42);
        assert!(r.is_empty());
        assert_eq!(r.position(), 15);
    }

    #[test]
    fn test_truncated_fixed_field() {
        let mut r = reader(&[0x00, 0x01]);
        match r.read_u32() {
            Err(ConduitError::Truncated { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            }
            other => panic!("Expected Truncated error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_length_prefix() {
        let mut r = reader(&[0x00, 0x00]);
        assert!(matches!(
            r.read_string(),
            Err(ConduitError::Truncated { .. })
        ));
    }

    #[test]
    fn test_string_length_exceeds_buffer() {
        let mut r = reader(&[0x00, 0x00, 0x00, 0x10, b'a', b'b']);
        assert!(matches!(
            r.read_string(),
            Err(ConduitError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_bool_nonzero_is_true() {
        let mut r = reader(&[0, 1, 7]);
        assert!(!r.read_bool().unwrap());
        assert!(r.read_bool().unwrap());
        assert!(r.read_bool().unwrap());
    }

    #[test]
    fn test_string_is_zero_copy_slice() {
        let source = Bytes::from_static(b"\x00\x00\x00\x03abcrest");
        let mut r = WireReader::new(source.clone());
        let s = r.read_string().unwrap();
        assert_eq!(&s[..], b"abc");
        // Same backing storage
        assert_eq!(s.as_ptr(), source[4..].as_ptr());
        assert_eq!(&r.read_remaining()[..], b"rest");
    }

    #[test]
    fn test_name_list_preserves_whitespace() {
        let mut buf = BytesMut::new();
        buf.put_ssh_utf8(" aes128-ctr, hmac-sha2-256 ");
        let mut r = WireReader::new(buf.freeze());
        let names = r.read_name_list().unwrap();
        assert_eq!(names, vec![" aes128-ctr", " hmac-sha2-256 "]);

        let mut out = BytesMut::new();
        out.put_name_list(&names[..]);
        assert_eq!(&out[4..], b" aes128-ctr, hmac-sha2-256 ");
    }

    #[test]
    fn test_empty_name_list() {
        let mut r = reader(&[0, 0, 0, 0]);
        assert!(r.read_name_list().unwrap().is_empty());

        let mut out = BytesMut::new();
        out.put_name_list::<&str>(&[]);
        assert_eq!(&out[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut r = reader(&[0, 0, 0, 2, 0xff, 0xfe]);
        assert!(matches!(r.read_utf8(), Err(ConduitError::InvalidFormat(_))));
    }

    #[test]
    fn test_finish_rejects_trailing_bytes() {
        let mut r = reader(&[0, 0, 0, 1, 9]);
        assert_eq!(r.read_u32().unwrap(), 1);
        assert!(r.finish("test").is_err());
        r.read_u8().unwrap();
        assert!(r.finish("test").is_ok());
    }

    #[test]
    fn test_encode_mpint() {
        assert_eq!(encode_mpint(&[0x00, 0x00]), Vec::<u8>::new());
        assert_eq!(encode_mpint(&[0x00, 0x7f]), vec![0x7f]);
        assert_eq!(encode_mpint(&[0x80, 0x01]), vec![0x00, 0x80, 0x01]);
        assert_eq!(encode_mpint(&[0x12, 0x34]), vec![0x12, 0x34]);
    }
}

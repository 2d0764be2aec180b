//! XDR (External Data Representation, RFC 1832) encoding and decoding.
//!
//! Every item occupies a multiple of four bytes on the wire. Integers are
//! big-endian, opaque data is zero-padded to the next 4-byte boundary, and
//! strings travel as NUL-terminated variable-length opaque data, which is
//! what the ACSLS client libraries send.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XdrError {
    #[error("buffer underflow: need {needed} bytes at offset {offset}, {available} available")]
    Underflow {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("opaque length {0} exceeds remaining data")]
    BadLength(u32),

    #[error("string at offset {0} is not valid UTF-8")]
    InvalidUtf8(usize),
}

pub type XdrResult<T> = std::result::Result<T, XdrError>;

fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// Growable XDR output buffer.
#[derive(Debug, Default, Clone)]
pub struct XdrEncoder {
    buf: Vec<u8>,
}

impl XdrEncoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
        }
    }

    pub fn append_u32(&mut self, val: u32) {
        self.buf.extend_from_slice(&val.to_be_bytes());
    }

    pub fn append_i32(&mut self, val: i32) {
        self.buf.extend_from_slice(&val.to_be_bytes());
    }

    pub fn append_enum(&mut self, val: i32) {
        self.append_i32(val);
    }

    pub fn append_bool(&mut self, val: bool) {
        self.append_u32(if val { 1 } else { 0 });
    }

    /// Fixed-length opaque: raw bytes plus zero fill, no length prefix.
    pub fn append_fixed_opaque(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.buf.resize(self.buf.len() + padding(data.len()), 0);
    }

    /// Variable-length opaque: length prefix, then fixed-length opaque.
    pub fn append_var_opaque(&mut self, data: &[u8]) {
        self.append_u32(data.len() as u32);
        self.append_fixed_opaque(data);
    }

    /// String with a terminating NUL, sent as variable-length opaque.
    pub fn append_string(&mut self, s: &str) {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.append_var_opaque(&bytes);
    }

    /// Raw bytes that are already XDR encoded.
    pub fn append_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// XDR input cursor over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct XdrDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> XdrDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Replace the buffer and rewind the cursor.
    pub fn set_data(&mut self, data: &'a [u8]) {
        self.data = data;
        self.pos = 0;
    }

    fn take(&mut self, len: usize) -> XdrResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(XdrError::Underflow {
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn extract_u32(&mut self) -> XdrResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn extract_i32(&mut self) -> XdrResult<i32> {
        Ok(self.extract_u32()? as i32)
    }

    pub fn extract_enum(&mut self) -> XdrResult<i32> {
        self.extract_i32()
    }

    pub fn extract_bool(&mut self) -> XdrResult<bool> {
        Ok(self.extract_u32()? != 0)
    }

    pub fn extract_fixed_opaque(&mut self, len: usize) -> XdrResult<Vec<u8>> {
        let padded = len + padding(len);
        let b = self.take(padded)?;
        Ok(b[..len].to_vec())
    }

    pub fn extract_var_opaque(&mut self) -> XdrResult<Vec<u8>> {
        let len = self.extract_u32()?;
        if len as usize > self.remaining() {
            return Err(XdrError::BadLength(len));
        }
        self.extract_fixed_opaque(len as usize)
    }

    /// Decode a string, dropping the terminating NUL and anything after it.
    pub fn extract_string(&mut self) -> XdrResult<String> {
        let offset = self.pos;
        let mut bytes = self.extract_var_opaque()?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        bytes.truncate(end);
        String::from_utf8(bytes).map_err(|_| XdrError::InvalidUtf8(offset))
    }

    /// All bytes not yet consumed.
    pub fn extract_remainder(&mut self) -> Vec<u8> {
        let rest = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        rest
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xdr_round_trip() {
        let mut enc = XdrEncoder::new();
        enc.append_u32(0xDEAD_BEEF);
        enc.append_i32(-42);
        enc.append_enum(7);
        enc.append_bool(true);
        enc.append_bool(false);
        enc.append_string("TAPE01");
        enc.append_var_opaque(&[1, 2, 3, 4, 5]);
        enc.append_fixed_opaque(&[9, 8, 7]);

        let bytes = enc.into_bytes();
        assert_eq!(bytes.len() % 4, 0);

        let mut dec = XdrDecoder::new(&bytes);
        assert_eq!(dec.extract_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(dec.extract_i32().unwrap(), -42);
        assert_eq!(dec.extract_enum().unwrap(), 7);
        assert!(dec.extract_bool().unwrap());
        assert!(!dec.extract_bool().unwrap());
        assert_eq!(dec.extract_string().unwrap(), "TAPE01");
        assert_eq!(dec.extract_var_opaque().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(dec.extract_fixed_opaque(3).unwrap(), vec![9, 8, 7]);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn test_opaque_padding_is_zero_filled() {
        let mut enc = XdrEncoder::new();
        enc.append_var_opaque(&[0xAA]);
        assert_eq!(enc.as_bytes(), &[0, 0, 0, 1, 0xAA, 0, 0, 0]);

        let mut enc = XdrEncoder::new();
        enc.append_string("AB");
        // "AB\0" padded to four bytes
        assert_eq!(enc.as_bytes(), &[0, 0, 0, 3, b'A', b'B', 0, 0]);
    }

    #[test]
    fn test_extract_past_end_fails() {
        let mut dec = XdrDecoder::new(&[0, 0, 1]);
        assert!(matches!(dec.extract_u32(), Err(XdrError::Underflow { .. })));

        // Length prefix claims more than is present
        let mut dec = XdrDecoder::new(&[0, 0, 0, 16, 1, 2, 3, 4]);
        assert_eq!(dec.extract_var_opaque(), Err(XdrError::BadLength(16)));
    }

    #[test]
    fn test_string_must_be_utf8() {
        let mut enc = XdrEncoder::new();
        enc.append_u32(9);
        enc.append_var_opaque(&[b'T', 0xFF, b'P', 0]);
        let mut dec = XdrDecoder::new(enc.as_bytes());
        dec.extract_u32().unwrap();
        assert_eq!(dec.extract_string(), Err(XdrError::InvalidUtf8(4)));

        // Bytes after the terminating NUL are not checked
        let mut dec = XdrDecoder::new(&[0, 0, 0, 4, b'O', b'K', 0, 0xFF]);
        assert_eq!(dec.extract_string().unwrap(), "OK");
    }

    #[test]
    fn test_remainder_and_set_data() {
        let data = [0, 0, 0, 5, 1, 2, 3];
        let mut dec = XdrDecoder::new(&data);
        assert_eq!(dec.extract_u32().unwrap(), 5);
        assert_eq!(dec.extract_remainder(), vec![1, 2, 3]);
        assert_eq!(dec.remaining(), 0);

        let other = [0, 0, 0, 1];
        dec.set_data(&other);
        assert!(dec.extract_bool().unwrap());
    }
}

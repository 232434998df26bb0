//! Variable-length integer encoding for doclists and node records.
//!
//! Values are encoded little-endian, 7 bits per byte, with the high bit as a
//! continuation flag. A u64 occupies between 1 and 10 bytes. Docids and
//! positions are stored as deltas against a running previous value, handled
//! by the delta helpers at the bottom of this module.

use byteorder::ReadBytesExt;
use std::io::Read;

use crate::error::{Result, SedgeError};

/// Maximum encoded size of a u64 varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Append a u64 value to `buf` using variable-length encoding.
pub fn put_u64(buf: &mut Vec<u8>, value: u64) -> usize {
    let mut val = value;
    let mut n = 0;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        buf.push(byte);
        n += 1;

        if val == 0 {
            break;
        }
    }

    n
}

/// Encode a u64 value as a fresh buffer.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN);
    put_u64(&mut buf, value);
    buf
}

/// Decode a u64 value from variable-length encoding.
///
/// Returns the value and the number of bytes consumed. A truncated or
/// over-long encoding is a corruption error, never a panic.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;
    let mut bytes_read = 0;

    for &byte in bytes {
        bytes_read += 1;

        if shift >= 64 {
            return Err(SedgeError::corrupt("varint overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, bytes_read));
        }

        shift += 7;
    }

    Err(SedgeError::corrupt("truncated varint"))
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 64 {
            return Err(SedgeError::corrupt("varint overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

/// Number of bytes `value` occupies when varint-encoded.
pub fn varint_len(value: u64) -> usize {
    let mut val = value;
    let mut n = 1;
    while val >= 0x80 {
        val >>= 7;
        n += 1;
    }
    n
}

/// A bounds-checked read cursor over a byte slice.
///
/// All node and doclist scanning goes through this type so that a malformed
/// length or truncated varint surfaces as a corruption error instead of a
/// slice panic.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader over `buf` starting at offset 0.
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    /// Current offset into the underlying buffer.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// True when the cursor has consumed the whole buffer.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Bytes remaining after the cursor.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Decode one varint and advance.
    pub fn varint(&mut self) -> Result<u64> {
        let (value, n) = decode_u64(&self.buf[self.pos..])?;
        self.pos += n;
        Ok(value)
    }

    /// Take `n` raw bytes and advance.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(SedgeError::corrupt("record overruns buffer"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}

/// Encode `value` relative to a running previous-value accumulator and
/// update the accumulator. Used for docid and position deltas; callers
/// guarantee `value >= *prev` in the configured order.
pub fn put_delta(buf: &mut Vec<u8>, prev: &mut u64, value: u64) {
    debug_assert!(value >= *prev);
    put_u64(buf, value - *prev);
    *prev = value;
}

/// Decode a delta varint relative to `prev`, updating the accumulator.
pub fn get_delta(reader: &mut ByteReader<'_>, prev: &mut u64) -> Result<u64> {
    let delta = reader.varint()?;
    *prev = prev
        .checked_add(delta)
        .ok_or_else(|| SedgeError::corrupt("delta varint overflow"))?;
    Ok(*prev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let values = [0, 1, 127, 128, 255, 256, 16383, 16384, 1 << 32, u64::MAX];

        for &value in &values {
            let encoded = encode_u64(value);
            let (decoded, n) = decode_u64(&encoded).unwrap();
            assert_eq!(value, decoded);
            assert_eq!(encoded.len(), n);
            assert_eq!(varint_len(value), n);
        }
    }

    #[test]
    fn test_random_round_trip() {
        use rand::Rng;
        let mut rng = rand::rng();

        for _ in 0..1000 {
            let value: u64 = rng.random();
            let encoded = encode_u64(value);
            let (decoded, n) = decode_u64(&encoded).unwrap();
            assert_eq!(value, decoded);
            assert_eq!(encoded.len(), n);
        }
    }

    #[test]
    fn test_encoding_efficiency() {
        assert_eq!(encode_u64(0).len(), 1);
        assert_eq!(encode_u64(127).len(), 1);
        assert_eq!(encode_u64(128).len(), 2);
        assert_eq!(encode_u64(16383).len(), 2);
        assert_eq!(encode_u64(16384).len(), 3);
        assert_eq!(encode_u64(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_truncated_varint() {
        let incomplete = vec![0x80]; // Continuation bit set but no more data
        assert!(decode_u64(&incomplete).is_err());
    }

    #[test]
    fn test_overlong_varint() {
        let overflow = vec![0xFF; 11];
        assert!(decode_u64(&overflow).is_err());
    }

    #[test]
    fn test_read_from_reader() {
        let mut buf = Vec::new();
        put_u64(&mut buf, 300);
        put_u64(&mut buf, 7);

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_u64(&mut cursor).unwrap(), 300);
        assert_eq!(read_u64(&mut cursor).unwrap(), 7);
    }

    #[test]
    fn test_delta_codec() {
        let mut buf = Vec::new();
        let mut prev = 0u64;
        for value in [3u64, 10, 11, 500] {
            put_delta(&mut buf, &mut prev, value);
        }

        let mut reader = ByteReader::new(&buf);
        let mut prev = 0u64;
        for expected in [3u64, 10, 11, 500] {
            assert_eq!(get_delta(&mut reader, &mut prev).unwrap(), expected);
        }
        assert!(reader.is_empty());
    }

    #[test]
    fn test_byte_reader_bounds() {
        let buf = [1u8, 2, 3];
        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.bytes(2).unwrap(), &[1, 2]);
        assert!(reader.bytes(2).is_err());
    }
}

//! Growable byte buffer with varint and zig-zag primitives.
//!
//! Unsigned varints carry 7 bits per byte, least significant group first; a set
//! high bit means another byte follows. Signed values are zig-zag mapped first
//! (`n -> (n << 1) ^ (n >> 63)`) so small negatives stay one or two bytes long.

use std::collections::BTreeMap;

use ntex_bytes::{BufMut, Bytes, BytesMut};

use strato_core::FramingError;

/// Longest varint encoding of a `u64`.
pub const MAX_VARINT_LEN_64: usize = 10;

/// Longest varint encoding of a `u32`.
pub const MAX_VARINT_LEN_32: usize = 5;

/// Map a signed 64-bit value onto an unsigned one, small magnitudes first.
#[inline]
#[must_use]
pub fn zigzag_encode(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
#[inline]
#[must_use]
pub fn zigzag_decode(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Map a signed 32-bit value onto an unsigned one, small magnitudes first.
#[inline]
#[must_use]
pub fn zigzag_encode32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// Inverse of [`zigzag_encode32`].
#[inline]
#[must_use]
pub fn zigzag_decode32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// Growable buffer with a read position.
///
/// Writes append at the end; reads consume from the read position. Multi-byte
/// fixed-width integers are big-endian.
///
/// ## Example
///
/// ```rust
/// use strato_codec::ByteCursor;
///
/// let mut cursor = ByteCursor::new();
/// cursor.write_varint(-3);
/// cursor.write_str("echo");
///
/// assert_eq!(cursor.read_varint().unwrap(), -3);
/// assert_eq!(cursor.read_string().unwrap(), "echo");
/// assert_eq!(cursor.remaining(), 0);
/// ```
#[derive(Debug, Default, Clone)]
pub struct ByteCursor {
    buf: BytesMut,
    pos: usize,
}

impl ByteCursor {
    /// Create an empty cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cursor with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Create a cursor positioned at the start of a copy of `bytes`.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(bytes.len());
        buf.extend_from_slice(bytes);
        Self { buf, pos: 0 }
    }

    /// Total bytes written.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current read position.
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// All written bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Freeze the written bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Append one byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Append a big-endian `u16`.
    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    /// Append a big-endian `u32`.
    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Append a big-endian `u64`.
    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// Append an unsigned varint.
    pub fn write_uvarint(&mut self, mut v: u64) {
        let mut scratch = [0u8; MAX_VARINT_LEN_64];
        let mut n = 0;
        while v >= 0x80 {
            scratch[n] = (v as u8) | 0x80;
            v >>= 7;
            n += 1;
        }
        scratch[n] = v as u8;
        self.buf.extend_from_slice(&scratch[..=n]);
    }

    /// Append a zig-zag encoded signed varint.
    pub fn write_varint(&mut self, v: i64) {
        self.write_uvarint(zigzag_encode(v));
    }

    /// Append a zig-zag encoded signed 32-bit varint.
    pub fn write_varint32(&mut self, v: i32) {
        self.write_uvarint(u64::from(zigzag_encode32(v)));
    }

    /// Append raw bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append varint-length-prefixed bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_uvarint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Append a varint-length-prefixed UTF-8 string.
    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    /// Append a string map: entry count, then key/value pairs.
    pub fn write_map(&mut self, map: &BTreeMap<String, String>) {
        self.write_uvarint(map.len() as u64);
        for (key, value) in map {
            self.write_str(key);
            self.write_str(value);
        }
    }

    fn take(&mut self, n: usize) -> Result<&[u8], FramingError> {
        if self.remaining() < n {
            return Err(FramingError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..self.pos])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], FramingError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, FramingError> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Read a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, FramingError> {
        self.take_array().map(u16::from_be_bytes)
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, FramingError> {
        self.take_array().map(u32::from_be_bytes)
    }

    /// Read a big-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, FramingError> {
        self.take_array().map(u64::from_be_bytes)
    }

    fn read_uvarint_within(&mut self, max_len: usize) -> Result<u64, FramingError> {
        let mut value = 0u64;
        for i in 0..max_len {
            let byte = self.read_u8()?;
            // the tenth byte of a u64 may only hold the top bit
            if i == MAX_VARINT_LEN_64 - 1 && byte > 1 {
                return Err(FramingError::MalformedVarint(max_len));
            }
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(FramingError::MalformedVarint(max_len))
    }

    /// Read an unsigned varint.
    pub fn read_uvarint(&mut self) -> Result<u64, FramingError> {
        self.read_uvarint_within(MAX_VARINT_LEN_64)
    }

    /// Read an unsigned varint that must fit in a `u32`.
    pub fn read_uvarint32(&mut self) -> Result<u32, FramingError> {
        let v = self.read_uvarint_within(MAX_VARINT_LEN_32)?;
        u32::try_from(v).map_err(|_| FramingError::MalformedVarint(MAX_VARINT_LEN_32))
    }

    /// Read a zig-zag encoded signed varint.
    pub fn read_varint(&mut self) -> Result<i64, FramingError> {
        self.read_uvarint().map(zigzag_decode)
    }

    /// Read a zig-zag encoded signed 32-bit varint.
    pub fn read_varint32(&mut self) -> Result<i32, FramingError> {
        self.read_uvarint32().map(zigzag_decode32)
    }

    /// Read varint-length-prefixed bytes.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, FramingError> {
        let len = self.read_len()?;
        self.take(len).map(<[u8]>::to_vec)
    }

    /// Read a varint-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, FramingError> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| FramingError::Deserialization(e.to_string()))
    }

    /// Read a string map written by [`ByteCursor::write_map`].
    pub fn read_map(&mut self) -> Result<BTreeMap<String, String>, FramingError> {
        let count = self.read_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    fn read_len(&mut self) -> Result<usize, FramingError> {
        let len = self.read_uvarint()?;
        // a length can never exceed what is left in the buffer
        match usize::try_from(len) {
            Ok(len) if len <= self.remaining() => Ok(len),
            _ => Err(FramingError::UnexpectedEof {
                needed: usize::try_from(len).unwrap_or(usize::MAX),
                remaining: self.remaining(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_roundtrip(n: i64) {
        let mut cursor = ByteCursor::new();
        cursor.write_varint(n);
        assert_eq!(cursor.read_varint().unwrap(), n, "value {n}");
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_varint_boundaries() {
        for n in [0, 1, -1, 63, -64, 64, -65, i64::from(i32::MAX), i64::from(i32::MIN), i64::MAX, i64::MIN] {
            varint_roundtrip(n);
        }
    }

    #[test]
    fn test_varint_sampled_range() {
        // powers of two and their neighbours cover every encoded length
        for shift in 0..63 {
            let p = 1i64 << shift;
            for n in [p - 1, p, p + 1, -p - 1, -p, -p + 1] {
                varint_roundtrip(n);
            }
        }
        let mut x = 0x9E37_79B9_7F4A_7C15u64;
        for _ in 0..10_000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            varint_roundtrip(x as i64);
        }
    }

    #[test]
    fn test_zigzag_keeps_small_negatives_compact() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_encode(i64::MIN), u64::MAX);
        assert_eq!(zigzag_encode32(-1), 1);
        assert_eq!(zigzag_decode32(zigzag_encode32(i32::MIN)), i32::MIN);

        let mut cursor = ByteCursor::new();
        cursor.write_varint(-1);
        assert_eq!(cursor.len(), 1);
    }

    #[test]
    fn test_uvarint_encoding() {
        let mut cursor = ByteCursor::new();
        cursor.write_uvarint(300);
        assert_eq!(cursor.as_slice(), &[0xAC, 0x02]);

        let mut cursor = ByteCursor::new();
        cursor.write_uvarint(u64::MAX);
        assert_eq!(cursor.len(), MAX_VARINT_LEN_64);
        assert_eq!(cursor.read_uvarint().unwrap(), u64::MAX);
    }

    #[test]
    fn test_unterminated_varint_is_framing_error() {
        let mut cursor = ByteCursor::from_slice(&[0xFF; 11]);
        assert_eq!(
            cursor.read_uvarint(),
            Err(FramingError::MalformedVarint(MAX_VARINT_LEN_64))
        );

        let mut cursor = ByteCursor::from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert_eq!(
            cursor.read_uvarint32(),
            Err(FramingError::MalformedVarint(MAX_VARINT_LEN_32))
        );
    }

    #[test]
    fn test_overlong_tenth_byte_rejected() {
        let mut bytes = [0xFFu8; 10];
        bytes[9] = 0x02;
        let mut cursor = ByteCursor::from_slice(&bytes);
        assert!(matches!(
            cursor.read_uvarint(),
            Err(FramingError::MalformedVarint(_))
        ));
    }

    #[test]
    fn test_truncated_varint_is_eof() {
        let mut cursor = ByteCursor::from_slice(&[0x80, 0x80]);
        assert!(matches!(
            cursor.read_uvarint(),
            Err(FramingError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_strings_and_maps() {
        let mut map = BTreeMap::new();
        map.insert("timeout".to_string(), "500".to_string());
        map.insert("trace-id".to_string(), "abc".to_string());

        let mut cursor = ByteCursor::with_capacity(64);
        cursor.write_str("héllo");
        cursor.write_map(&map);
        cursor.write_bytes(&[1, 2, 3]);
        cursor.write_u32(0xDEAD_BEEF);

        assert_eq!(cursor.read_string().unwrap(), "héllo");
        assert_eq!(cursor.read_map().unwrap(), map);
        assert_eq!(cursor.read_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(cursor.read_u32().unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_length_prefix_past_end_rejected() {
        let mut cursor = ByteCursor::new();
        cursor.write_uvarint(1000);
        cursor.write_raw(b"short");
        assert!(matches!(
            cursor.read_bytes(),
            Err(FramingError::UnexpectedEof { .. })
        ));
    }
}

#![forbid(unsafe_code)]
//! Little-endian field access, varints, and a checked read cursor.

pub mod le {
    //! Fixed-width little-endian accessors for record fields.
    //!
    //! Callers pass slices whose bounds were checked against the record size,
    //! so short input is a programming error.

    /// Writes `v` at `dst[off..off + 4]`.
    #[inline]
    pub fn put_u32(dst: &mut [u8], off: usize, v: u32) {
        dst[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes `v` at `dst[off..off + 8]`.
    #[inline]
    pub fn put_u64(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a u32 from `src[off..off + 4]`.
    #[inline]
    pub fn get_u32(src: &[u8], off: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&src[off..off + 4]);
        u32::from_le_bytes(buf)
    }

    /// Reads a u64 from `src[off..off + 8]`.
    #[inline]
    pub fn get_u64(src: &[u8], off: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&src[off..off + 8]);
        u64::from_le_bytes(buf)
    }
}

pub mod var {
    //! LEB128 varints, with ZigZag for signed values.

    use crate::types::{IavlError, Result};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Encodes an i64 as a ZigZag varint.
    pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
        let zigzag = ((v << 1) ^ (v >> 63)) as u64;
        encode_u64(zigzag, out);
    }

    /// Number of bytes `encode_u64(v)` produces.
    pub fn encoded_len_u64(mut v: u64) -> usize {
        let mut len = 1;
        while v >= 0x80 {
            v >>= 7;
            len += 1;
        }
        len
    }

    /// Decodes an unsigned varint at `*off`, advancing the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(IavlError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if i == 9 && payload > 1 {
                return Err(IavlError::Corruption("varint exceeds 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(IavlError::Corruption("varint longer than 10 bytes"))
    }

    /// Decodes a ZigZag varint at `*off`, advancing the offset.
    pub fn decode_i64(src: &[u8], off: &mut usize) -> Result<i64> {
        let zigzag = decode_u64(src, off)?;
        Ok(((zigzag >> 1) as i64) ^ (-((zigzag & 1) as i64)))
    }
}

pub mod buf {
    //! A slice-backed cursor that reports short input as corruption.

    use core::fmt;

    use crate::types::{IavlError, Result};

    use super::var;

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        /// The underlying byte slice.
        pub buf: &'a [u8],
        /// Current read offset.
        pub off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or(IavlError::Corruption("cursor read past end of buffer"))?;
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads an unsigned varint.
        pub fn uvarint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads a varint length prefix followed by that many bytes.
        pub fn len_prefixed(&mut self) -> Result<&'a [u8]> {
            let len = usize::try_from(self.uvarint()?)
                .map_err(|_| IavlError::Corruption("length prefix exceeds usize"))?;
            self.take(len)
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}

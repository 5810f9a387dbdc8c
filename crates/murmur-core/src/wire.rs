//! Unsigned-varint framing helpers.
//!
//! The overlay frame headers (fragment ids, part counters, channel ids) are
//! encoded as LEB128 unsigned varints: seven value bits per byte, high bit
//! set on every byte except the last.

use bytes::BufMut;
use thiserror::Error;

/// Maximum encoded length of a 32-bit unsigned varint.
pub const MAX_UVARINT32_LEN: usize = 5;

/// Maximum encoded length of a 64-bit unsigned varint.
pub const MAX_UVARINT64_LEN: usize = 10;

/// Errors from varint decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended in the middle of a varint
    #[error("truncated varint")]
    Truncated,

    /// Varint encoded a value larger than 64 bits
    #[error("varint overflows u64")]
    Overflow,
}

/// Appends `x` to `buf` as an unsigned varint.
pub fn put_uvarint(buf: &mut impl BufMut, mut x: u64) {
    while x >= 0x80 {
        buf.put_u8((x as u8) | 0x80);
        x >>= 7;
    }
    buf.put_u8(x as u8);
}

/// Returns the encoded length of `x` as an unsigned varint.
pub fn uvarint_len(mut x: u64) -> usize {
    let mut n = 1;
    while x >= 0x80 {
        x >>= 7;
        n += 1;
    }
    n
}

/// Reads an unsigned varint from the front of `data`.
///
/// Returns the value and the number of bytes consumed.
pub fn read_uvarint(data: &[u8]) -> Result<(u64, usize), WireError> {
    let mut x: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &b) in data.iter().enumerate() {
        if i >= MAX_UVARINT64_LEN {
            return Err(WireError::Overflow);
        }
        if b < 0x80 {
            if i == MAX_UVARINT64_LEN - 1 && b > 1 {
                return Err(WireError::Overflow);
            }
            return Ok((x | (u64::from(b) << shift), i + 1));
        }
        x |= u64::from(b & 0x7F) << shift;
        shift += 7;
    }
    Err(WireError::Truncated)
}

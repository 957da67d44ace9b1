//! Variable-length integer encoding
//!
//! Unsigned 64-bit integers are encoded in one to nine bytes. The first byte
//! either holds the value directly or a tag announcing how many big-endian
//! bytes follow:
//!
//! | first byte    | tail bytes | value range           |
//! |---------------|------------|-----------------------|
//! | `0x00..=0xFB` | 0          | 0 ..= 251             |
//! | `0xFC`        | 1          | 252 ..= 255           |
//! | `0xFD`        | 2          | 256 ..= 65535         |
//! | `0xFE`        | 4          | 65536 ..= 2^32 - 1    |
//! | `0xFF`        | 8          | 2^32 ..= 2^64 - 1     |
//!
//! Only the shortest encoding of a value is accepted when decoding.

use super::error::{DecodeError, EncodeError, IntError};
use super::packet::PacketKind;
use bytes::BufMut;

/// Largest value stored directly in the first byte
pub const MAX_INLINE: u64 = 0xFB;

const TAG_U8: u8 = 0xFC;
const TAG_U16: u8 = 0xFD;
const TAG_U32: u8 = 0xFE;
const TAG_U64: u8 = 0xFF;

/// Maximum encoded length of any value
pub const MAX_ENCODED_LEN: usize = 9;

/// Number of bytes needed to encode `value`
pub const fn encoded_len(value: u64) -> usize {
    if value <= MAX_INLINE {
        1
    } else if value <= u8::MAX as u64 {
        2
    } else if value <= u16::MAX as u64 {
        3
    } else if value <= u32::MAX as u64 {
        5
    } else {
        9
    }
}

/// Encode `value` using the shortest representation
pub fn encode<B: BufMut>(value: u64, buf: &mut B) {
    match encoded_len(value) {
        1 => buf.put_u8(value as u8),
        2 => {
            buf.put_u8(TAG_U8);
            buf.put_u8(value as u8);
        }
        3 => {
            buf.put_u8(TAG_U16);
            buf.put_u16(value as u16);
        }
        5 => {
            buf.put_u8(TAG_U32);
            buf.put_u32(value as u32);
        }
        _ => {
            buf.put_u8(TAG_U64);
            buf.put_u64(value);
        }
    }
}

/// Encode a value that the protocol requires to be at least one
pub fn encode_non_zero<B: BufMut>(
    value: u64,
    kind: PacketKind,
    buf: &mut B,
) -> Result<(), EncodeError> {
    if value == 0 {
        return Err(EncodeError::ZeroAmount(kind));
    }
    encode(value, buf);
    Ok(())
}

/// Decode a value from the start of `buf`
///
/// Returns `(value, bytes_consumed)`.
pub fn decode(buf: &[u8]) -> Result<(u64, usize), IntError> {
    let first = *buf.first().ok_or(IntError::Truncated)?;
    let (tail, min) = match first {
        TAG_U8 => (1, MAX_INLINE + 1),
        TAG_U16 => (2, u8::MAX as u64 + 1),
        TAG_U32 => (4, u16::MAX as u64 + 1),
        TAG_U64 => (8, u32::MAX as u64 + 1),
        inline => return Ok((inline as u64, 1)),
    };

    let bytes = buf.get(1..1 + tail).ok_or(IntError::Truncated)?;
    let value = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
    if value < min {
        return Err(IntError::NonMinimal);
    }

    Ok((value, 1 + tail))
}

/// Decode a value that must be at least one
pub fn decode_non_zero(buf: &[u8]) -> Result<(u64, usize), IntError> {
    match decode(buf)? {
        (0, _) => Err(IntError::Zero),
        ok => Ok(ok),
    }
}

/// Decode a value and report errors as [`DecodeError`]
pub(crate) fn read(buf: &[u8], non_zero: bool) -> Result<(u64, usize), DecodeError> {
    let result = if non_zero {
        decode_non_zero(buf)
    } else {
        decode(buf)
    };
    result.map_err(DecodeError::from)
}

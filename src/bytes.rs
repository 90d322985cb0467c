//! Little-endian scalar codec and hex text helpers.
//!
//! # Endianness
//! Every integer and float in a plugin file is little-endian.  There is no
//! runtime negotiation.  The `read_*` helpers take the leading bytes of a
//! slice and fail with [`ByteError::Short`] when too few are present; the
//! `*_bytes` helpers are their exact inverses.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ByteError {
    #[error("Need {needed} bytes, got {got}")]
    Short { needed: usize, got: usize },
    #[error("Invalid hex text: {0}")]
    Hex(#[from] hex::FromHexError),
}

fn need(bytes: &[u8], n: usize) -> Result<&[u8], ByteError> {
    bytes.get(..n).ok_or(ByteError::Short { needed: n, got: bytes.len() })
}

pub fn read_u16(bytes: &[u8]) -> Result<u16, ByteError> {
    Ok(LittleEndian::read_u16(need(bytes, 2)?))
}

pub fn read_u32(bytes: &[u8]) -> Result<u32, ByteError> {
    Ok(LittleEndian::read_u32(need(bytes, 4)?))
}

pub fn read_i32(bytes: &[u8]) -> Result<i32, ByteError> {
    Ok(LittleEndian::read_i32(need(bytes, 4)?))
}

pub fn read_f32(bytes: &[u8]) -> Result<f32, ByteError> {
    Ok(LittleEndian::read_f32(need(bytes, 4)?))
}

pub fn u16_bytes(v: u16) -> [u8; 2] {
    let mut out = [0u8; 2];
    LittleEndian::write_u16(&mut out, v);
    out
}

pub fn u32_bytes(v: u32) -> [u8; 4] {
    let mut out = [0u8; 4];
    LittleEndian::write_u32(&mut out, v);
    out
}

pub fn i32_bytes(v: i32) -> [u8; 4] {
    let mut out = [0u8; 4];
    LittleEndian::write_i32(&mut out, v);
    out
}

pub fn f32_bytes(v: f32) -> [u8; 4] {
    let mut out = [0u8; 4];
    LittleEndian::write_f32(&mut out, v);
    out
}

/// Formats bytes as upper-case, space-separated hex (`"0A FF 12"`).
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&hex::encode_upper([*b]));
    }
    out
}

/// Parses hex text, ignoring any whitespace between digit pairs.
pub fn from_hex(text: &str) -> Result<Vec<u8>, ByteError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(hex::decode(compact)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reads_little_endian() {
        assert_eq!(read_u32(&[0xB7, 0x2E, 0x01, 0x00]).unwrap(), 0x0001_2EB7);
        assert_eq!(read_u16(&[0x34, 0x12, 0xFF]).unwrap(), 0x1234);
        assert_eq!(read_f32(&f32_bytes(1.7)).unwrap(), 1.7);
    }

    #[test]
    fn short_input_is_reported() {
        assert_eq!(read_u32(&[1, 2, 3]), Err(ByteError::Short { needed: 4, got: 3 }));
    }

    #[test]
    fn hex_text_format() {
        assert_eq!(to_hex(&[0x0A, 0xFF, 0x12]), "0A FF 12");
        assert_eq!(from_hex("0a ff\n12").unwrap(), vec![0x0A, 0xFF, 0x12]);
        assert!(from_hex("0G").is_err());
        assert_eq!(from_hex("0G"), Err(ByteError::Hex(hex::FromHexError::InvalidHexCharacter { c: 'G', index: 1 })));
    }

    proptest! {
        #[test]
        fn u32_round_trip(v: u32) {
            prop_assert_eq!(read_u32(&u32_bytes(v)).unwrap(), v);
        }

        #[test]
        fn i32_round_trip(v: i32) {
            prop_assert_eq!(read_i32(&i32_bytes(v)).unwrap(), v);
        }

        #[test]
        fn u16_round_trip(v: u16) {
            prop_assert_eq!(read_u16(&u16_bytes(v)).unwrap(), v);
        }

        #[test]
        fn f32_round_trip_bits(bits: u32) {
            let v = f32::from_bits(bits);
            prop_assert_eq!(read_f32(&f32_bytes(v)).unwrap().to_bits(), bits);
        }

        #[test]
        fn hex_round_trip(data: Vec<u8>) {
            prop_assert_eq!(from_hex(&to_hex(&data)).unwrap(), data);
        }
    }
}

//! Subrecord codec: type-tagged, length-prefixed fields inside a record.
//!
//! # Layout
//! ```text
//! signature  [u8; 4]
//! length     u16 LE
//! payload    [u8; length]
//! ```
//! A payload longer than `u16::MAX` is preceded by an `XXXX` subrecord whose
//! 4-byte payload is the real length; the long subrecord then stores 0 in its
//! own length field.

pub mod registry;

pub use registry::{FormIdSlots, Layout, SubrecordRegistry, UnmappedPolicy};

use std::borrow::Cow;
use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use thiserror::Error;

use crate::bytes::{read_u16, read_u32};
use crate::signature::{Signature, XXXX};

/// Bytes taken by a subrecord's signature and length.
pub const SUBRECORD_HEADER_SIZE: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubrecordError {
    #[error("Subrecord {signature} declares {declared} bytes but only {available} remain")]
    Truncated { signature: Signature, declared: usize, available: usize },
    #[error("Subrecord {signature} payload is {got} bytes, layout needs at least {needed}")]
    PayloadTooShort { signature: Signature, needed: usize, got: usize },
    #[error("Subrecord {signature} payload length {got} matches no known layout")]
    UnexpectedLength { signature: Signature, got: usize },
    #[error("Subrecord {signature} holds {expected} FormIds, {got} replacements given")]
    CountMismatch { signature: Signature, expected: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subrecord {
    pub signature: Signature,
    pub data:      Vec<u8>,
}

impl Subrecord {
    pub fn new(signature: Signature, data: Vec<u8>) -> Self {
        Self { signature, data }
    }

    /// A null-terminated text subrecord.
    pub fn zstring(signature: Signature, text: &str) -> Self {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(0);
        Self { signature, data }
    }

    /// Payload as text, up to the first NUL.
    pub fn as_zstring(&self) -> Cow<'_, str> {
        let end = self.data.iter().position(|&b| b == 0).unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end])
    }

    /// Size on disk, including a leading `XXXX` when one is needed.
    pub fn encoded_len(&self) -> usize {
        let long = if self.data.len() > u16::MAX as usize { SUBRECORD_HEADER_SIZE + 4 } else { 0 };
        long + SUBRECORD_HEADER_SIZE + self.data.len()
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        if self.data.len() > u16::MAX as usize {
            writer.write_all(XXXX.as_bytes())?;
            writer.write_u16::<LittleEndian>(4)?;
            writer.write_u32::<LittleEndian>(self.data.len() as u32)?;
            writer.write_all(self.signature.as_bytes())?;
            writer.write_u16::<LittleEndian>(0)?;
        } else {
            writer.write_all(self.signature.as_bytes())?;
            writer.write_u16::<LittleEndian>(self.data.len() as u16)?;
        }
        writer.write_all(&self.data)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        // Writing into a Vec cannot fail.
        let _ = self.write(&mut out);
        out
    }
}

/// Reads subrecords until fewer than [`SUBRECORD_HEADER_SIZE`] bytes remain,
/// returning them with the unconsumed tail.
pub fn parse_all(mut bytes: &[u8]) -> Result<(Vec<Subrecord>, &[u8]), SubrecordError> {
    let mut out = Vec::new();
    let mut long_len: Option<usize> = None;

    while bytes.len() >= SUBRECORD_HEADER_SIZE {
        let signature = Signature([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let short_len = read_u16(&bytes[4..]).map(usize::from).unwrap_or(0);
        let declared = long_len.take().unwrap_or(short_len);
        let body = &bytes[SUBRECORD_HEADER_SIZE..];
        if declared > body.len() {
            return Err(SubrecordError::Truncated { signature, declared, available: body.len() });
        }
        let (data, rest) = body.split_at(declared);
        bytes = rest;

        if signature == XXXX && declared == 4 {
            long_len = read_u32(data).ok().map(|v| v as usize);
            continue;
        }
        out.push(Subrecord { signature, data: data.to_vec() });
    }
    if let Some(declared) = long_len {
        return Err(SubrecordError::Truncated { signature: XXXX, declared, available: bytes.len() });
    }
    Ok((out, bytes))
}

/// Renders subrecords back to back.
pub fn render_all(subrecords: &[Subrecord]) -> Vec<u8> {
    let total = subrecords.iter().map(Subrecord::encoded_len).sum();
    let mut out = Vec::with_capacity(total);
    for sub in subrecords {
        let _ = sub.write(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::from_hex;
    use crate::signature::EDID;

    #[test]
    fn parses_sequence_and_keeps_duplicates() {
        let bytes = from_hex("45 44 49 44 03 00 41 42 00  4B 57 44 41 00 00  4B 57 44 41 01 00 07").unwrap();
        let (subs, rest) = parse_all(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0].as_zstring(), "AB");
        assert_eq!(subs[1].signature, subs[2].signature);
        assert_eq!(subs[2].data, vec![7]);
        assert_eq!(render_all(&subs), bytes);
    }

    #[test]
    fn short_tail_is_returned() {
        let bytes = from_hex("45 44 49 44 01 00 00 FF FF").unwrap();
        let (subs, rest) = parse_all(&bytes).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(rest, &[0xFF, 0xFF]);
    }

    #[test]
    fn overrunning_length_is_an_error() {
        let bytes = from_hex("45 44 49 44 09 00 41 42").unwrap();
        let err = parse_all(&bytes).unwrap_err();
        assert_eq!(err, SubrecordError::Truncated { signature: EDID, declared: 9, available: 2 });
    }

    #[test]
    fn long_payload_uses_xxxx() {
        let sub = Subrecord::new(Signature(*b"NVNM"), vec![0xAB; 70_000]);
        let bytes = sub.to_bytes();
        assert_eq!(&bytes[..4], b"XXXX");
        assert_eq!(bytes.len(), sub.encoded_len());
        let (subs, rest) = parse_all(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(subs, vec![sub]);
    }

    #[test]
    fn dangling_xxxx_is_truncated() {
        let bytes = from_hex("45 44 49 44 01 00 00  58 58 58 58 04 00 70 11 01 00").unwrap();
        let err = parse_all(&bytes).unwrap_err();
        assert_eq!(err, SubrecordError::Truncated { signature: XXXX, declared: 0x0001_1170, available: 0 });
    }

    #[test]
    fn zstring_round_trip() {
        let sub = Subrecord::zstring(EDID, "IronSword");
        assert_eq!(sub.data.last(), Some(&0));
        assert_eq!(sub.as_zstring(), "IronSword");
    }
}

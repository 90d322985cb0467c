//! zlib payloads of compressed records.
//!
//! On disk a compressed record body is `decompressed_size: u32 LE` followed
//! by a zlib stream of the subrecord bytes.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::bytes::{read_u32, u32_bytes};

/// Level used when a record has to be recompressed.
pub const DEFAULT_ZLIB_LEVEL: u32 = 6;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Compressed payload is missing its size prefix")]
    MissingSize,
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompressed {actual} bytes, size prefix declared {declared}")]
    SizeMismatch { declared: usize, actual: usize },
}

/// Upper bound on what a size prefix may reserve up front.
const PREALLOC_LIMIT: usize = 1 << 24;

/// Inflates a size-prefixed zlib body.
pub fn inflate(body: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let declared = read_u32(body).map_err(|_| CompressionError::MissingSize)? as usize;
    let mut out = Vec::with_capacity(declared.min(PREALLOC_LIMIT));
    ZlibDecoder::new(&body[4..])
        .read_to_end(&mut out)
        .map_err(|e| CompressionError::Decompression(e.to_string()))?;
    if out.len() != declared {
        return Err(CompressionError::SizeMismatch { declared, actual: out.len() });
    }
    Ok(out)
}

/// Deflates `data` into a size-prefixed zlib body.
pub fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = ZlibEncoder::new(u32_bytes(data.len() as u32).to_vec(), Compression::new(level.min(9)));
    encoder.write_all(data).map_err(|e| CompressionError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| CompressionError::Compression(e.to_string()))
}

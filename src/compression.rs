// src/compression.rs

//! Compression format detection and decompression
//!
//! Upstream package indices and archives arrive gzip, xz, or zstd
//! compressed depending on the distribution. Format is detected from the
//! URL extension when available and from magic bytes otherwise.

use crate::error::{Error, Result};
use std::fmt;
use std::io::Read;

/// Supported compression formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// No compression (raw data)
    None,
    /// Gzip (.gz)
    Gzip,
    /// XZ/LZMA (.xz)
    Xz,
    /// Zstandard (.zst)
    Zstd,
}

impl CompressionFormat {
    /// Detect compression format from a filename or URL
    pub fn from_extension(path: &str) -> Self {
        if path.ends_with(".gz") || path.ends_with(".tgz") {
            Self::Gzip
        } else if path.ends_with(".xz") {
            Self::Xz
        } else if path.ends_with(".zst") || path.ends_with(".zstd") {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Detect compression format from leading magic bytes
    ///
    /// - Gzip: `1f 8b`
    /// - XZ: `fd 37 7a 58 5a 00`
    /// - Zstd: `28 b5 2f fd`
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
            Self::Gzip
        } else if data.len() >= 6 && data[..6] == [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00] {
            Self::Xz
        } else if data.len() >= 4 && data[..4] == [0x28, 0xb5, 0x2f, 0xfd] {
            Self::Zstd
        } else {
            Self::None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Wrap a reader in a decompressor for the given format
///
/// `CompressionFormat::None` returns the reader unchanged.
pub fn create_decoder<'a, R: Read + 'a>(
    reader: R,
    format: CompressionFormat,
) -> Result<Box<dyn Read + 'a>> {
    match format {
        CompressionFormat::None => Ok(Box::new(reader)),
        CompressionFormat::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
        CompressionFormat::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        CompressionFormat::Zstd => {
            let decoder = zstd::Decoder::new(reader).map_err(|e| Error::Parse {
                what: "zstd stream".into(),
                reason: e.to_string(),
            })?;
            Ok(Box::new(decoder))
        }
    }
}

/// Decompress a byte slice using the given format
pub fn decompress(data: &[u8], format: CompressionFormat) -> Result<Vec<u8>> {
    let mut decoder = create_decoder(data, format)?;
    let mut output = Vec::new();
    decoder.read_to_end(&mut output).map_err(|e| Error::Parse {
        what: format!("{} data", format),
        reason: e.to_string(),
    })?;
    Ok(output)
}

/// Decompress a byte slice, detecting the format from magic bytes
pub fn decompress_auto(data: &[u8]) -> Result<Vec<u8>> {
    decompress(data, CompressionFormat::from_magic_bytes(data))
}

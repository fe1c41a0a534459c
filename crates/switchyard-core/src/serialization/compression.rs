//! Optional compression stage applied after encoding and before decoding.

use crate::error::SerializationError;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::str::FromStr;

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Zlib,
}

impl CompressionType {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CompressionType {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zlib" => Ok(Self::Zlib),
            other => Err(SerializationError::new(
                other,
                "unknown compression algorithm",
            )),
        }
    }
}

/// Compress `data` with the given algorithm
pub fn compress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>, SerializationError> {
    let format = compression.name();
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| SerializationError::with_source(format, e))?;
            encoder
                .finish()
                .map_err(|e| SerializationError::with_source(format, e))
        }
        CompressionType::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| SerializationError::with_source(format, e))?;
            encoder
                .finish()
                .map_err(|e| SerializationError::with_source(format, e))
        }
    }
}

/// Reverse [`compress`]
pub fn decompress(
    data: &[u8],
    compression: CompressionType,
) -> Result<Vec<u8>, SerializationError> {
    let format = compression.name();
    let mut output = Vec::new();
    match compression {
        CompressionType::None => return Ok(data.to_vec()),
        CompressionType::Gzip => {
            GzDecoder::new(data)
                .read_to_end(&mut output)
                .map_err(|e| SerializationError::with_source(format, e))?;
        }
        CompressionType::Zlib => {
            ZlibDecoder::new(data)
                .read_to_end(&mut output)
                .map_err(|e| SerializationError::with_source(format, e))?;
        }
    }
    Ok(output)
}

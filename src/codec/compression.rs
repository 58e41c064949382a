//! Body compression for patches and snapshots.
//!
//! Stroke geometry is highly repetitive, so large bodies are zstd-compressed
//! when that makes them smaller. Without the `compression` feature bodies are
//! always written raw and compressed input cannot be read.

use std::io;

use thiserror::Error;

use crate::config::CodecConfig;

/// Errors from compressing or inflating a body.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// The encoder failed.
    #[error("zstd encode: {0}")]
    Encode(io::Error),

    /// The input is not a valid zstd stream.
    #[error("zstd decode: {0}")]
    Decode(io::Error),

    /// Inflating would exceed the configured limit.
    #[error("body inflates past {limit} bytes")]
    TooLarge {
        /// Configured limit.
        limit: usize,
    },

    /// Built without the `compression` feature.
    #[error("built without zstd support")]
    Unsupported,
}

/// Outcome of [`Compressor::compress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressResult {
    /// Smaller zstd body.
    Compressed(Vec<u8>),
    /// Original body; too small or did not shrink.
    Uncompressed(Vec<u8>),
}

impl CompressResult {
    /// Body bytes to store.
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Compressed(body) | Self::Uncompressed(body) => body,
        }
    }

    /// Check if the body was compressed.
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }

    /// Take the body bytes.
    pub fn into_data(self) -> Vec<u8> {
        match self {
            Self::Compressed(body) | Self::Uncompressed(body) => body,
        }
    }
}

/// zstd settings shared by the patch codec and snapshot writer.
#[derive(Debug, Clone)]
pub struct Compressor {
    min_size: usize,
    level: i32,
    limit: usize,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(&CodecConfig::default())
    }
}

impl Compressor {
    /// Compressor using the codec settings.
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            min_size: config.min_compress_size,
            level: config.compression_level.clamp(1, 22),
            limit: config.max_decompressed_size,
        }
    }

    /// zstd level in use.
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Largest body [`decompress`](Self::decompress) will produce.
    pub fn max_decompressed_size(&self) -> usize {
        self.limit
    }

    /// Compress `body` if it is at least the minimum size and shrinks.
    pub fn compress(&self, body: &[u8]) -> Result<CompressResult, CompressionError> {
        if body.len() < self.min_size {
            return Ok(CompressResult::Uncompressed(body.to_vec()));
        }
        let packed = self.encode(body)?;
        Ok(if packed.len() < body.len() {
            CompressResult::Compressed(packed)
        } else {
            CompressResult::Uncompressed(body.to_vec())
        })
    }

    /// Inflate a compressed body, refusing anything past the size limit.
    pub fn decompress(&self, packed: &[u8]) -> Result<Vec<u8>, CompressionError> {
        self.decode(packed, self.limit)
    }

    #[cfg(feature = "compression")]
    fn encode(&self, body: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::encode_all(body, self.level).map_err(CompressionError::Encode)
    }

    #[cfg(not(feature = "compression"))]
    fn encode(&self, _body: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Err(CompressionError::Unsupported)
    }

    #[cfg(feature = "compression")]
    fn decode(&self, packed: &[u8], limit: usize) -> Result<Vec<u8>, CompressionError> {
        use std::io::Read;

        let decoder = zstd::Decoder::new(packed).map_err(CompressionError::Decode)?;
        let mut body = Vec::new();
        // One byte past the limit is enough to detect an oversized body
        decoder
            .take(limit as u64 + 1)
            .read_to_end(&mut body)
            .map_err(CompressionError::Decode)?;
        if body.len() > limit {
            return Err(CompressionError::TooLarge { limit });
        }
        Ok(body)
    }

    #[cfg(not(feature = "compression"))]
    fn decode(&self, _packed: &[u8], _limit: usize) -> Result<Vec<u8>, CompressionError> {
        Err(CompressionError::Unsupported)
    }
}

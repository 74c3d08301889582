//! Compression layer
//!
//! zstd compression of interface packets before fragmentation and
//! encryption. Every packet carries one framing byte:
//!
//! | Byte   | Meaning                          |
//! |--------|----------------------------------|
//! | `0xFA` | stored, payload follows verbatim |
//! | `0x66` | zstd frame follows               |
//!
//! zstd output is used only when strictly smaller than the input.

use thiserror::Error;

use crate::core::BufferError;
use crate::transport::PacketBuffer;

/// Framing byte for an uncompressed payload.
pub const FLAG_STORED: u8 = 0xFA;

/// Framing byte for a zstd payload.
pub const FLAG_ZSTD: u8 = 0x66;

/// Bytes the layer adds to each packet.
pub const COMPRESSION_OVERHEAD: usize = 1;

/// Minimum payload size to attempt compression
pub const MIN_COMPRESS_SIZE: usize = 64;

/// Default zstd compression level (1-22, higher = smaller but slower)
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Errors from compression operations.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Zstd compression failed.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// Zstd decompression failed (corrupt frame or output over the limit).
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// Packet has no framing byte.
    #[error("empty compressed packet")]
    Empty,

    /// Framing byte is neither stored nor zstd.
    #[error("unknown compression flag 0x{0:02x}")]
    UnknownFlag(u8),

    /// Payload exceeds the interface maximum.
    #[error("decompressed size exceeded limit: {size} > {limit}")]
    SizeExceeded {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Result did not fit the packet buffer.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Compression configuration
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum size to attempt compression
    pub min_size: usize,
    /// Compression level (1-22)
    pub level: i32,
    /// Maximum decompressed size, normally the interface maximum read
    pub max_decompressed_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size: MIN_COMPRESS_SIZE,
            level: DEFAULT_COMPRESSION_LEVEL,
            max_decompressed_size: crate::core::DEFAULT_TUN_MTU,
        }
    }
}

/// In-place compressor for the packet pipeline
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
    stats: CompressionStats,
}

impl Compressor {
    /// Create a new compressor with default settings
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    /// Create a compressor with custom config
    pub fn with_config(mut config: CompressionConfig) -> Self {
        config.level = config.level.clamp(1, 22);
        Self {
            config,
            stats: CompressionStats::default(),
        }
    }

    /// Set compression level
    pub fn set_level(&mut self, level: i32) {
        self.config.level = level.clamp(1, 22);
    }

    /// Get compression level
    pub fn level(&self) -> i32 {
        self.config.level
    }

    /// Running totals.
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Compress the buffer content in place and prepend the framing byte.
    ///
    /// Returns whether zstd output was used.
    pub fn compress(&mut self, buf: &mut PacketBuffer) -> Result<bool, CompressionError> {
        let original = buf.len();
        let mut used = false;

        if original >= self.config.min_size {
            let compressed = zstd::bulk::compress(buf.as_slice(), self.config.level)
                .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
            // Only use compression if it actually saves space
            if compressed.len() < original {
                buf.replace(&compressed)?;
                used = true;
            }
        }

        buf.prepend_slice(&[if used { FLAG_ZSTD } else { FLAG_STORED }])?;
        self.stats.record(original, buf.len() - COMPRESSION_OVERHEAD, used);
        Ok(used)
    }

    /// Strip the framing byte and decompress the buffer content in place.
    pub fn decompress(&mut self, buf: &mut PacketBuffer) -> Result<(), CompressionError> {
        let flag = *buf.as_slice().first().ok_or(CompressionError::Empty)?;
        buf.advance(COMPRESSION_OVERHEAD)?;
        let limit = self.config.max_decompressed_size;

        match flag {
            FLAG_STORED => {
                if buf.len() > limit {
                    return Err(CompressionError::SizeExceeded {
                        size: buf.len(),
                        limit,
                    });
                }
                Ok(())
            }
            FLAG_ZSTD => {
                // bulk::decompress refuses output larger than the capacity
                let output = zstd::bulk::decompress(buf.as_slice(), limit)
                    .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;
                buf.replace(&output)?;
                Ok(())
            }
            other => Err(CompressionError::UnknownFlag(other)),
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for compression operations
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionStats {
    /// Total bytes before compression
    pub total_uncompressed: u64,
    /// Total bytes after compression
    pub total_compressed: u64,
    /// Number of payloads compressed
    pub compressed_count: u64,
    /// Number of payloads stored (too small or no benefit)
    pub skipped_count: u64,
}

impl CompressionStats {
    /// Get compression ratio (compressed / uncompressed)
    pub fn ratio(&self) -> f64 {
        if self.total_uncompressed == 0 {
            1.0
        } else {
            self.total_compressed as f64 / self.total_uncompressed as f64
        }
    }

    /// Get bytes saved
    pub fn bytes_saved(&self) -> u64 {
        self.total_uncompressed.saturating_sub(self.total_compressed)
    }

    /// Record one packet.
    pub fn record(&mut self, original_size: usize, output_size: usize, compressed: bool) {
        self.total_uncompressed += original_size as u64;
        self.total_compressed += output_size as u64;
        if compressed {
            self.compressed_count += 1;
        } else {
            self.skipped_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(data: &[u8]) -> PacketBuffer {
        let mut buf = PacketBuffer::new(4096, 16);
        buf.extend_from_slice(data).unwrap();
        buf
    }

    fn compressor(limit: usize) -> Compressor {
        Compressor::with_config(CompressionConfig {
            max_decompressed_size: limit,
            ..Default::default()
        })
    }

    #[test]
    fn test_small_payload_is_stored() {
        let mut c = compressor(1500);
        let mut buf = buffer_with(b"hello");

        assert!(!c.compress(&mut buf).unwrap());
        assert_eq!(buf.as_slice(), &[FLAG_STORED, b'h', b'e', b'l', b'l', b'o']);

        c.decompress(&mut buf).unwrap();
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn test_repetitive_payload_is_compressed() {
        let mut c = compressor(1500);
        let data: Vec<u8> = (0..1000).map(|i| (i % 16) as u8).collect();
        let mut buf = buffer_with(&data);

        assert!(c.compress(&mut buf).unwrap());
        assert_eq!(buf.as_slice()[0], FLAG_ZSTD);
        assert!(buf.len() < data.len());

        c.decompress(&mut buf).unwrap();
        assert_eq!(buf.as_slice(), data.as_slice());
        assert_eq!(c.stats().compressed_count, 1);
        assert!(c.stats().bytes_saved() > 0);
    }

    #[test]
    fn test_incompressible_payload_is_stored() {
        let mut c = compressor(1500);
        let data: Vec<u8> = (0..200u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut buf = buffer_with(&data);

        let used = c.compress(&mut buf).unwrap();
        c.decompress(&mut buf).unwrap();
        assert_eq!(buf.as_slice(), data.as_slice());
        if !used {
            assert_eq!(c.stats().skipped_count, 1);
        }
    }

    #[test]
    fn test_decompress_bounded_by_limit() {
        let mut c = compressor(4000);
        let mut buf = buffer_with(&[0u8; 2000]);
        c.compress(&mut buf).unwrap();

        let mut small = compressor(100);
        assert!(matches!(
            small.decompress(&mut buf),
            Err(CompressionError::DecompressionFailed(_))
        ));
    }

    #[test]
    fn test_stored_payload_over_limit() {
        let mut c = compressor(4);
        let mut buf = buffer_with(&[FLAG_STORED, 1, 2, 3, 4, 5]);
        assert!(matches!(
            c.decompress(&mut buf),
            Err(CompressionError::SizeExceeded { size: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let mut c = compressor(1500);
        let mut buf = buffer_with(&[0x01, 2, 3]);
        assert!(matches!(c.decompress(&mut buf), Err(CompressionError::UnknownFlag(0x01))));

        let mut empty = buffer_with(&[]);
        assert!(matches!(c.decompress(&mut empty), Err(CompressionError::Empty)));
    }

    #[test]
    fn test_compression_level() {
        let mut c = Compressor::new();
        assert_eq!(c.level(), DEFAULT_COMPRESSION_LEVEL);

        c.set_level(10);
        assert_eq!(c.level(), 10);

        // Should clamp to valid range
        c.set_level(100);
        assert_eq!(c.level(), 22);

        c.set_level(0);
        assert_eq!(c.level(), 1);
    }
}

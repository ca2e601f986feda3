//! Compression codecs for snapshot blobs.
//!
//! The snapshot producer appends a codec-specific suffix to the blob name;
//! an empty suffix means the blob is stored raw. Decompression is
//! streaming: the returned reader wraps the remote stream and inflates on
//! the fly.

use async_compression::tokio::bufread::{GzipDecoder, ZlibDecoder, ZstdDecoder};
use snafu::Snafu;
use tokio::io::{AsyncRead, BufReader};

/// Filename suffix for gzip-compressed snapshots.
pub const GZIP_SUFFIX: &str = ".gz";

/// Filename suffix for zlib-compressed snapshots.
pub const ZLIB_SUFFIX: &str = ".zlib";

/// Filename suffix for zstd-compressed snapshots.
pub const ZSTD_SUFFIX: &str = ".zst";

/// Errors raised while resolving a compression policy.
#[derive(Debug, Snafu)]
pub enum CompressionError {
    /// The suffix names no codec this build understands.
    #[snafu(display("unsupported compression suffix {suffix:?}"))]
    UnsupportedSuffix {
        /// The offending suffix.
        suffix: String,
    },
}

/// The codec a snapshot blob was compressed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionPolicy {
    /// gzip (RFC 1952).
    Gzip,
    /// zlib (RFC 1950).
    Zlib,
    /// Zstandard.
    Zstd,
}

impl CompressionPolicy {
    /// The filename suffix this codec contributes to a snapshot name.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Gzip => GZIP_SUFFIX,
            Self::Zlib => ZLIB_SUFFIX,
            Self::Zstd => ZSTD_SUFFIX,
        }
    }
}

impl std::fmt::Display for CompressionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gzip => f.write_str("gzip"),
            Self::Zlib => f.write_str("zlib"),
            Self::Zstd => f.write_str("zstd"),
        }
    }
}

/// Resolves a snapshot's compression suffix to a codec.
///
/// Returns `None` for an empty suffix (uncompressed blob).
///
/// # Errors
///
/// Returns [`CompressionError::UnsupportedSuffix`] for a non-empty suffix
/// that names no known codec.
pub fn is_snapshot_compressed(suffix: &str) -> Result<Option<CompressionPolicy>, CompressionError> {
    match suffix {
        "" => Ok(None),
        GZIP_SUFFIX => Ok(Some(CompressionPolicy::Gzip)),
        ZLIB_SUFFIX => Ok(Some(CompressionPolicy::Zlib)),
        ZSTD_SUFFIX => Ok(Some(CompressionPolicy::Zstd)),
        other => Err(CompressionError::UnsupportedSuffix { suffix: other.to_string() }),
    }
}

/// Wraps a raw blob stream in the decompressor matching `policy`.
pub fn decompress_snapshot<R>(reader: R, policy: CompressionPolicy) -> Box<dyn AsyncRead + Send + Unpin>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    match policy {
        CompressionPolicy::Gzip => Box::new(GzipDecoder::new(BufReader::new(reader))),
        CompressionPolicy::Zlib => Box::new(ZlibDecoder::new(BufReader::new(reader))),
        CompressionPolicy::Zstd => Box::new(ZstdDecoder::new(BufReader::new(reader))),
    }
}

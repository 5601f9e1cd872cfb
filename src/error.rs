//! Error types for LZMA and LZMA2 coding.
//!
//! All fallible operations in this crate return [`Result`]. The reader and
//! writer types latch the first fatal error and keep returning it, so a
//! single [`LzmaError`] value describes why a stream died.

use std::io;
use thiserror::Error;

/// The error type for LZMA/LZMA2 encoding and decoding.
#[derive(Debug, Error)]
pub enum LzmaError {
    /// I/O error from the underlying reader or writer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid LZMA header or properties byte.
    #[error("invalid header: {message}")]
    InvalidHeader {
        /// Description of the header error.
        message: String,
    },

    /// LZMA2 chunk type not permitted in the current chunk-sequence state.
    #[error("chunk control byte {control:#04x} not permitted in state {state}")]
    InvalidChunkSequence {
        /// The offending control byte.
        control: u8,
        /// Name of the chunk-sequence state the stream was in.
        state: &'static str,
    },

    /// A chunk did not produce or consume exactly its declared size.
    #[error("chunk size mismatch: declared {declared}, got {actual}")]
    ChunkSizeMismatch {
        /// Size declared in the chunk header.
        declared: u64,
        /// Size actually produced or consumed.
        actual: u64,
    },

    /// Input ended in the middle of a symbol or before the declared size.
    #[error("unexpected end of input: {message}")]
    UnexpectedEof {
        /// Description of what was being read.
        message: String,
    },

    /// The range decoder detected an impossible encoding.
    #[error("corrupt stream at position {position}: {message}")]
    Corrupt {
        /// Uncompressed position at which corruption was detected.
        position: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A match referenced data outside the dictionary window.
    #[error("match distance {distance} out of range (window {window})")]
    DistanceOutOfRange {
        /// The invalid distance.
        distance: u64,
        /// Number of bytes currently addressable in the window.
        window: u64,
    },

    /// A match length outside the permitted [2, 273] range.
    #[error("match length {length} outside [{min}, {max}]")]
    LengthOutOfRange {
        /// The invalid length.
        length: usize,
        /// Smallest permitted length.
        min: usize,
        /// Largest permitted length.
        max: usize,
    },

    /// Operation on an already-closed reader or writer.
    #[error("reader or writer is closed")]
    Closed,

    /// The writer received more bytes than the declared uncompressed size.
    #[error("write exceeds declared uncompressed size {declared}")]
    WriteExceedsSize {
        /// Uncompressed size declared in the header.
        declared: u64,
    },
}

/// Result type alias for LZMA operations.
pub type Result<T> = std::result::Result<T, LzmaError>;

impl LzmaError {
    /// Create an invalid header error.
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader {
            message: message.into(),
        }
    }

    /// Create an unexpected EOF error.
    pub fn unexpected_eof(message: impl Into<String>) -> Self {
        Self::UnexpectedEof {
            message: message.into(),
        }
    }

    /// Create a corrupt stream error.
    pub fn corrupt(position: u64, message: impl Into<String>) -> Self {
        Self::Corrupt {
            position,
            message: message.into(),
        }
    }

    /// The `std::io::ErrorKind` this error maps to at the `Read`/`Write`
    /// boundary.
    pub fn io_error_kind(&self) -> io::ErrorKind {
        match self {
            Self::Io(e) => e.kind(),
            Self::UnexpectedEof { .. } => io::ErrorKind::UnexpectedEof,
            Self::InvalidHeader { .. }
            | Self::InvalidChunkSequence { .. }
            | Self::ChunkSizeMismatch { .. }
            | Self::Corrupt { .. }
            | Self::DistanceOutOfRange { .. }
            | Self::LengthOutOfRange { .. } => io::ErrorKind::InvalidData,
            Self::WriteExceedsSize { .. } => io::ErrorKind::InvalidInput,
            Self::Closed => io::ErrorKind::BrokenPipe,
        }
    }

    /// Build a fresh `io::Error` describing this error.
    ///
    /// Readers and writers latch their first fatal error and return an
    /// equivalent `io::Error` from every subsequent call; `io::Error` is not
    /// `Clone`, so each call materializes a new one.
    pub fn as_io_error(&self) -> io::Error {
        io::Error::new(self.io_error_kind(), self.to_string())
    }
}

impl From<LzmaError> for io::Error {
    fn from(e: LzmaError) -> io::Error {
        match e {
            LzmaError::Io(inner) => inner,
            other => io::Error::new(other.io_error_kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LzmaError::invalid_header("bad properties byte");
        assert!(err.to_string().contains("bad properties byte"));

        let err = LzmaError::ChunkSizeMismatch {
            declared: 100,
            actual: 99,
        };
        assert!(err.to_string().contains("declared 100"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: LzmaError = io_err.into();
        assert!(matches!(err, LzmaError::Io(_)));
    }

    #[test]
    fn test_io_kind_mapping() {
        let err = LzmaError::unexpected_eof("truncated");
        assert_eq!(err.io_error_kind(), io::ErrorKind::UnexpectedEof);

        let err = LzmaError::corrupt(0, "bad bit");
        assert_eq!(err.io_error_kind(), io::ErrorKind::InvalidData);

        let err = LzmaError::Closed;
        let io_err = err.as_io_error();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);
    }
}

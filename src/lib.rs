//! # ruzma
//!
//! LZMA and LZMA2 compression in pure Rust, with a parallel scheduler for
//! LZMA2 chunk streams.
//!
//! The crate covers three layers:
//!
//! - The **LZMA algorithmic core**: the carry-propagating range coder, the
//!   adaptive probability model with its 12-state context machine, and the
//!   literal/length/distance sub-codecs.
//! - The **sliding-window dictionary** used for back-references by both
//!   sides, with a hash-chain match finder on the encoder side.
//! - The **LZMA2 chunk framing** and a **parallel encode/decode scheduler**
//!   that splits streams at dictionary-reset boundaries so independent
//!   workers can process chunks concurrently while output stays
//!   byte-identical to the single-worker order.
//!
//! ## Formats
//!
//! A raw LZMA1 stream is `<13-byte header><range-coded payload>` with an
//! optional end-of-stream marker. An LZMA2 stream is a sequence of chunks,
//! each either range-coded or stored, terminated by a single `0x00` byte;
//! every stream begins with a full-reset chunk.
//!
//! ## Usage
//!
//! ```
//! use ruzma::{Lzma2Reader, Lzma2ReaderConfig, Lzma2Writer, Lzma2WriterConfig};
//! use std::io::{Cursor, Read, Write};
//!
//! let text = b"The quick brown fox jumps over the lazy dog.\n";
//!
//! let mut writer = Lzma2Writer::new(Vec::new(), Lzma2WriterConfig::default()).unwrap();
//! writer.write_all(text).unwrap();
//! let compressed = writer.finish().unwrap();
//!
//! let mut reader =
//!     Lzma2Reader::new(Cursor::new(compressed), Lzma2ReaderConfig::default()).unwrap();
//! let mut decoded = Vec::new();
//! reader.read_to_end(&mut decoded).unwrap();
//! assert_eq!(decoded, text);
//! ```
//!
//! Writers must be closed ([`Lzma2Writer::close`] or
//! [`Lzma2Writer::finish`]); closing flushes pending chunks, drains the
//! workers and writes the stream terminator.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decoder;
pub mod dict;
pub mod encoder;
pub mod error;
pub mod header;
pub mod lzma2;
pub mod match_finder;
pub mod model;
pub mod parallel;
pub mod range_coder;

// Re-exports
pub use decoder::LzmaReader;
pub use dict::{DecoderDict, MIN_DICT_SIZE};
pub use encoder::LzmaWriter;
pub use error::{LzmaError, Result};
pub use header::{LzmaHeader, LzmaParams};
pub use lzma2::{ChunkReader, dict_size_from_props, props_from_dict_size};
pub use model::{Operation, Properties};
pub use parallel::{
    DEFAULT_DICT_SIZE, DEFAULT_WORKER_BUFFER_SIZE, Lzma2Reader, Lzma2ReaderConfig, Lzma2Writer,
    Lzma2WriterConfig,
};
pub use range_coder::{RangeDecoder, RangeEncoder};

use std::io::{Cursor, Read, Write};

/// Compress `data` into an LZMA2 stream.
pub fn compress_lzma2(data: &[u8], cfg: Lzma2WriterConfig) -> Result<Vec<u8>> {
    let mut writer = Lzma2Writer::new(Vec::new(), cfg)?;
    writer.write_all(data)?;
    writer.finish()
}

/// Decompress a complete LZMA2 stream.
pub fn decompress_lzma2(data: &[u8], cfg: Lzma2ReaderConfig) -> Result<Vec<u8>> {
    let mut reader = Lzma2Reader::new(Cursor::new(data.to_vec()), cfg)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Compress `data` into a raw LZMA1 stream with a 13-byte header.
pub fn compress_lzma(data: &[u8], params: LzmaParams) -> Result<Vec<u8>> {
    let mut writer = LzmaWriter::new(Vec::new(), params)?;
    writer.write_all(data)?;
    writer.finish()
}

/// Decompress a complete raw LZMA1 stream.
pub fn decompress_lzma(data: &[u8]) -> Result<Vec<u8>> {
    let mut reader = LzmaReader::new(Cursor::new(data.to_vec()))?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lzma2_helpers() {
        let data = b"helper roundtrip, helper roundtrip, helper roundtrip";
        let compressed = compress_lzma2(data, Lzma2WriterConfig::default()).unwrap();
        let decoded = decompress_lzma2(&compressed, Lzma2ReaderConfig::default()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_lzma_helpers() {
        let data = b"raw lzma helper roundtrip";
        let compressed = compress_lzma(data, LzmaParams::default()).unwrap();
        let decoded = decompress_lzma(&compressed).unwrap();
        assert_eq!(decoded, data);
    }
}

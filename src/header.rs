//! LZMA1 header codec and stream parameters.
//!
//! A raw LZMA stream starts with a 13-byte header: one properties byte
//! encoding `(PB*5 + LP)*9 + LC`, a little-endian 32-bit dictionary size and
//! a little-endian 64-bit uncompressed size, where all-ones means the size
//! is unknown and the stream is terminated by an end-of-stream marker.

use crate::dict::MIN_DICT_SIZE;
use crate::error::{LzmaError, Result};
use crate::model::Properties;
use std::io::{self, Read, Write};

/// Length of the raw LZMA header in bytes.
pub const HEADER_LEN: usize = 13;

/// On-the-wire sentinel for an unknown uncompressed size.
const UNKNOWN_SIZE: u64 = u64::MAX;

/// Parsed 13-byte LZMA header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzmaHeader {
    /// LC/LP/PB properties.
    pub props: Properties,
    /// Dictionary size in bytes.
    pub dict_size: u32,
    /// Uncompressed size, or `None` when unknown (EOS-terminated).
    pub size: Option<u64>,
}

impl LzmaHeader {
    /// Read and validate a header.
    ///
    /// Dictionary sizes below [`MIN_DICT_SIZE`] are rounded up, matching
    /// what existing encoders emit for tiny windows.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; HEADER_LEN];
        match reader.read_exact(&mut raw) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(LzmaError::unexpected_eof("truncated LZMA header"));
            }
            Err(e) => return Err(e.into()),
        }

        let props = Properties::from_byte(raw[0]).ok_or_else(|| {
            LzmaError::invalid_header(format!("invalid properties byte {:#04x}", raw[0]))
        })?;

        let dict_size = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]).max(MIN_DICT_SIZE);

        let size = u64::from_le_bytes([
            raw[5], raw[6], raw[7], raw[8], raw[9], raw[10], raw[11], raw[12],
        ]);
        let size = if size == UNKNOWN_SIZE { None } else { Some(size) };

        Ok(Self {
            props,
            dict_size,
            size,
        })
    }

    /// Write the 13 header bytes.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = self.props.to_byte();
        raw[1..5].copy_from_slice(&self.dict_size.to_le_bytes());
        raw[5..13].copy_from_slice(&self.size.unwrap_or(UNKNOWN_SIZE).to_le_bytes());
        writer.write_all(&raw)?;
        Ok(())
    }
}

/// Parameters for writing a raw LZMA stream.
#[derive(Debug, Clone, Copy)]
pub struct LzmaParams {
    /// LC/LP/PB properties.
    pub props: Properties,
    /// Dictionary size in bytes.
    pub dict_size: u32,
    /// Uncompressed size, if known up front.
    pub size: Option<u64>,
    /// Whether the header carries the uncompressed size.
    pub size_in_header: bool,
    /// Whether to emit the end-of-stream marker.
    pub eos: bool,
}

impl LzmaParams {
    /// Parameters for a stream of known size: the size goes into the header
    /// and no end-of-stream marker is written.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self.size_in_header = true;
        self.eos = false;
        self
    }

    /// Request an explicit end-of-stream marker.
    #[must_use]
    pub fn with_eos(mut self, eos: bool) -> Self {
        self.eos = eos;
        self
    }

    /// Set the dictionary size.
    #[must_use]
    pub fn with_dict_size(mut self, dict_size: u32) -> Self {
        self.dict_size = dict_size;
        self
    }

    /// Set the properties.
    #[must_use]
    pub fn with_props(mut self, props: Properties) -> Self {
        self.props = props;
        self
    }

    /// Check the parameters for consistency.
    ///
    /// Unlike the read path, undersized dictionaries are rejected here.
    pub fn verify(&self) -> Result<()> {
        self.props.verify()?;
        if self.dict_size < MIN_DICT_SIZE {
            return Err(LzmaError::invalid_header(format!(
                "dictionary size must be at least {} bytes",
                MIN_DICT_SIZE
            )));
        }
        if self.size_in_header && self.size.is_none() {
            return Err(LzmaError::invalid_header(
                "size_in_header requires a known size",
            ));
        }
        if !self.size_in_header && !self.eos {
            return Err(LzmaError::invalid_header(
                "a stream without a size header must carry an end-of-stream marker",
            ));
        }
        Ok(())
    }

    pub(crate) fn header(&self) -> LzmaHeader {
        LzmaHeader {
            props: self.props,
            dict_size: self.dict_size,
            size: if self.size_in_header { self.size } else { None },
        }
    }
}

impl Default for LzmaParams {
    fn default() -> Self {
        Self {
            props: Properties::default(),
            dict_size: 8 << 20,
            size: None,
            size_in_header: false,
            eos: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_roundtrip() {
        let header = LzmaHeader {
            props: Properties::new(3, 0, 2),
            dict_size: 1 << 20,
            size: Some(12345),
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(buf[0], 0x5D);

        let parsed = LzmaHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_unknown_size() {
        let header = LzmaHeader {
            props: Properties::default(),
            dict_size: 1 << 16,
            size: None,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(&buf[5..13], &[0xFF; 8]);

        let parsed = LzmaHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed.size, None);
    }

    #[test]
    fn test_invalid_properties_byte() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = 225;
        let err = LzmaHeader::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, LzmaError::InvalidHeader { .. }));
    }

    #[test]
    fn test_small_dict_rounded_up_on_read() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = 0x5D;
        buf[1..5].copy_from_slice(&100u32.to_le_bytes());
        buf[5..13].copy_from_slice(&[0xFF; 8]);
        let parsed = LzmaHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed.dict_size, MIN_DICT_SIZE);
    }

    #[test]
    fn test_truncated_header() {
        let buf = vec![0x5D, 0, 0];
        let err = LzmaHeader::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, LzmaError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_params_verify() {
        assert!(LzmaParams::default().verify().is_ok());
        assert!(LzmaParams::default().with_size(100).verify().is_ok());

        let small_dict = LzmaParams::default().with_dict_size(100);
        assert!(small_dict.verify().is_err());

        let mut no_end = LzmaParams::default();
        no_end.eos = false;
        assert!(no_end.verify().is_err());
    }
}

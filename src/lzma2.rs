//! LZMA2 chunk framing.
//!
//! LZMA2 is a container format around LZMA that provides:
//! - Support for incompressible chunks (stored as-is)
//! - Dictionary, state and properties resets at chunk boundaries
//! - A chunk-based layout that streams and splits well
//!
//! ## Chunk format
//!
//! Each chunk starts with a control byte:
//! - `0x00`: end of the LZMA2 stream
//! - `0x01`: uncompressed chunk, dictionary reset
//! - `0x02`: uncompressed chunk, no reset
//! - `0x80..=0xFF`: LZMA chunk; bits 5..6 select the reset mode
//!   (none / state / state+properties / dictionary+state+properties)
//!
//! Sizes are stored minus one: uncompressed chunks carry a 16-bit size, LZMA
//! chunks a 21-bit uncompressed size (high five bits in the control byte)
//! and a 16-bit compressed size, all big-endian. A properties byte follows
//! whenever the reset mode replaces the properties.

use crate::decoder::SeqDecoder;
use crate::dict::DecoderDict;
use crate::encoder::SeqEncoder;
use crate::error::{LzmaError, Result};
use crate::match_finder::MatchFinder;
use crate::model::{EOS_DISTANCE, MATCH_LEN_MAX, Operation, Properties};
use crate::range_coder::{RangeDecoder, RangeEncoder};
use std::io::{self, Cursor, Read};

/// Largest uncompressed chunk size this writer emits.
pub const CHUNK_MAX_UNCOMPRESSED: usize = 1 << 16;

/// Largest compressed payload a chunk header can express.
pub const CHUNK_MAX_COMPRESSED: usize = 1 << 16;

/// Reset mode of a compressed chunk, from control-byte bits 5..6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetMode {
    /// Continue dictionary, state and properties.
    None,
    /// Re-initialize the probability model from the current properties.
    State,
    /// Load new properties and re-initialize the model.
    StateProps,
    /// Empty the dictionary as well.
    Full,
}

impl ResetMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::None,
            1 => Self::State,
            2 => Self::StateProps,
            _ => Self::Full,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::State => 1,
            Self::StateProps => 2,
            Self::Full => 3,
        }
    }

    fn carries_props(self) -> bool {
        matches!(self, Self::StateProps | Self::Full)
    }
}

/// Parsed LZMA2 chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkHeader {
    /// The `0x00` stream terminator.
    EndOfStream,
    /// An uncompressed chunk of `size` bytes.
    Uncompressed { reset_dict: bool, size: usize },
    /// A range-coded chunk.
    Compressed {
        reset: ResetMode,
        unpacked: usize,
        packed: usize,
        props: Option<Properties>,
    },
}

impl ChunkHeader {
    /// Whether this chunk may start an independently decodable segment.
    pub(crate) fn starts_segment(&self) -> bool {
        matches!(
            self,
            Self::Uncompressed {
                reset_dict: true,
                ..
            } | Self::Compressed {
                reset: ResetMode::Full,
                ..
            }
        )
    }

    /// Uncompressed bytes this chunk expands to.
    pub(crate) fn unpacked_size(&self) -> usize {
        match self {
            Self::EndOfStream => 0,
            Self::Uncompressed { size, .. } => *size,
            Self::Compressed { unpacked, .. } => *unpacked,
        }
    }

    /// Payload bytes following the header on the wire.
    pub(crate) fn payload_size(&self) -> usize {
        match self {
            Self::EndOfStream => 0,
            Self::Uncompressed { size, .. } => *size,
            Self::Compressed { packed, .. } => *packed,
        }
    }

    /// Read a chunk header, appending the consumed bytes to `raw`.
    ///
    /// Returns `None` when the input is cleanly exhausted before the first
    /// header byte; a partial header is an error.
    pub(crate) fn read_from<R: Read>(reader: &mut R, raw: &mut Vec<u8>) -> Result<Option<Self>> {
        let mut control = [0u8; 1];
        loop {
            match reader.read(&mut control) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let control = control[0];
        raw.push(control);

        fn read_header_bytes<R: Read>(
            reader: &mut R,
            n: usize,
            raw: &mut Vec<u8>,
        ) -> Result<[u8; 2]> {
            let mut buf = [0u8; 2];
            match reader.read_exact(&mut buf[..n]) {
                Ok(()) => {
                    raw.extend_from_slice(&buf[..n]);
                    Ok(buf)
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    Err(LzmaError::unexpected_eof("truncated chunk header"))
                }
                Err(e) => Err(e.into()),
            }
        }

        match control {
            0x00 => Ok(Some(Self::EndOfStream)),
            0x01 | 0x02 => {
                let size = read_header_bytes(reader, 2, raw)?;
                let size = u16::from_be_bytes(size) as usize + 1;
                Ok(Some(Self::Uncompressed {
                    reset_dict: control == 0x01,
                    size,
                }))
            }
            c if c & 0x80 != 0 => {
                let reset = ResetMode::from_bits((c >> 5) & 0x03);
                let size = read_header_bytes(reader, 2, raw)?;
                let unpacked = (((c & 0x1F) as usize) << 16 | u16::from_be_bytes(size) as usize) + 1;
                let size = read_header_bytes(reader, 2, raw)?;
                let packed = u16::from_be_bytes(size) as usize + 1;

                let props = if reset.carries_props() {
                    let byte = read_header_bytes(reader, 1, raw)?[0];
                    let props = Properties::from_byte(byte).ok_or_else(|| {
                        LzmaError::invalid_header(format!("invalid properties byte {byte:#04x}"))
                    })?;
                    Some(props)
                } else {
                    None
                };

                Ok(Some(Self::Compressed {
                    reset,
                    unpacked,
                    packed,
                    props,
                }))
            }
            c => Err(LzmaError::InvalidChunkSequence {
                control: c,
                state: "any",
            }),
        }
    }
}

/// State of the chunk-sequence machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    /// No chunk seen yet; the stream must open with a dictionary reset.
    Start,
    /// Dictionary reset seen, but no properties yet.
    AfterDictReset,
    /// At least one compressed chunk carried properties.
    AfterProps,
    /// Properties known, but the chunk immediately prior was uncompressed;
    /// the next compressed chunk must resend properties.
    AfterUncompressed,
    /// Terminator consumed.
    Stop,
}

impl ChunkState {
    fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AfterDictReset => "after-dict-reset",
            Self::AfterProps => "after-properties-reset",
            Self::AfterUncompressed => "after-uncompressed-chunk",
            Self::Stop => "stop",
        }
    }

    fn reject(self, control: u8) -> LzmaError {
        LzmaError::InvalidChunkSequence {
            control,
            state: self.name(),
        }
    }

    /// Validate `header` against the current state and return the next one.
    pub(crate) fn next(self, header: &ChunkHeader) -> Result<Self> {
        match (self, header) {
            (Self::Stop, _) => Err(self.reject(0x00)),
            (_, ChunkHeader::EndOfStream) => Ok(Self::Stop),

            (
                Self::Start,
                ChunkHeader::Uncompressed {
                    reset_dict: true, ..
                },
            ) => Ok(Self::AfterDictReset),
            (
                Self::Start,
                ChunkHeader::Compressed {
                    reset: ResetMode::Full,
                    ..
                },
            ) => Ok(Self::AfterProps),
            (Self::Start, ChunkHeader::Uncompressed { .. }) => Err(self.reject(0x02)),
            (Self::Start, ChunkHeader::Compressed { reset, .. }) => {
                Err(self.reject(0x80 | (reset.bits() << 5)))
            }

            // An uncompressed chunk invalidates any probability-model
            // continuity, so a compressed chunk may follow one only with a
            // properties reset.
            (
                Self::AfterDictReset | Self::AfterUncompressed,
                ChunkHeader::Uncompressed { .. },
            ) => Ok(self),
            (
                Self::AfterDictReset | Self::AfterUncompressed,
                ChunkHeader::Compressed { reset, .. },
            ) => {
                if reset.carries_props() {
                    Ok(Self::AfterProps)
                } else {
                    Err(self.reject(0x80 | (reset.bits() << 5)))
                }
            }

            (Self::AfterProps, ChunkHeader::Uncompressed { .. }) => Ok(Self::AfterUncompressed),
            (Self::AfterProps, ChunkHeader::Compressed { .. }) => Ok(Self::AfterProps),
        }
    }
}

/// The chunk currently being decoded.
enum ActiveChunk {
    /// Between chunks.
    None,
    /// Copying an uncompressed chunk into the dictionary.
    Uncompressed { remaining: usize },
    /// Driving the LZMA decoder over a bounded payload.
    Compressed {
        rc: Box<RangeDecoder<Cursor<Vec<u8>>>>,
        unpacked: u64,
        remaining: u64,
        packed: u64,
    },
}

/// Streaming single-threaded reader for an LZMA2 chunk sequence.
///
/// Drives the chunk state machine, applies resets and produces exactly the
/// declared number of bytes per chunk. The first fatal error is latched.
pub struct ChunkReader<R> {
    inner: R,
    dict: DecoderDict,
    dict_size: u32,
    seq: Option<SeqDecoder>,
    cstate: ChunkState,
    chunk: ActiveChunk,
    /// Whether a missing `0x00` terminator is an error. Sub-streams cut at
    /// segment boundaries end without one.
    expect_eos: bool,
    scratch: Vec<u8>,
    err: Option<LzmaError>,
    closed: bool,
}

impl<R: Read> ChunkReader<R> {
    /// Create a reader over a chunk sequence.
    pub fn new(inner: R, dict_size: u32) -> Self {
        Self {
            inner,
            dict: DecoderDict::new(dict_size),
            dict_size,
            seq: None,
            cstate: ChunkState::Start,
            chunk: ActiveChunk::None,
            expect_eos: true,
            scratch: Vec::with_capacity(8),
            err: None,
            closed: false,
        }
    }

    pub(crate) fn without_eos_requirement(mut self) -> Self {
        self.expect_eos = false;
        self
    }

    /// The dictionary size in use.
    pub fn dict_size(&self) -> u32 {
        self.dict_size
    }

    /// Whether the stream terminator has been consumed.
    pub fn finished(&self) -> bool {
        self.cstate == ChunkState::Stop
    }

    /// Release buffers. Further reads fail with `Closed`.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn start_chunk(&mut self) -> Result<()> {
        self.scratch.clear();
        let header = match ChunkHeader::read_from(&mut self.inner, &mut self.scratch)? {
            Some(header) => header,
            None => {
                if self.expect_eos {
                    return Err(LzmaError::unexpected_eof(
                        "stream ended without the 0x00 terminator",
                    ));
                }
                self.cstate = ChunkState::Stop;
                return Ok(());
            }
        };

        self.cstate = self.cstate.next(&header)?;
        if self.cstate == ChunkState::Stop {
            return Ok(());
        }

        match header {
            ChunkHeader::EndOfStream => unreachable!("stop state handled above"),
            ChunkHeader::Uncompressed { reset_dict, size } => {
                if reset_dict {
                    self.dict.reset();
                }
                self.chunk = ActiveChunk::Uncompressed { remaining: size };
            }
            ChunkHeader::Compressed {
                reset,
                unpacked,
                packed,
                props,
            } => {
                match reset {
                    ResetMode::Full => {
                        self.dict.reset();
                        self.set_props(props.expect("full reset carries properties"));
                    }
                    ResetMode::StateProps => {
                        self.set_props(props.expect("properties reset carries properties"));
                    }
                    ResetMode::State => {
                        let seq = self.seq.as_mut().ok_or_else(|| {
                            LzmaError::corrupt(self.dict.position(), "state reset before properties")
                        })?;
                        seq.reset_state();
                    }
                    ResetMode::None => {
                        if self.seq.is_none() {
                            return Err(LzmaError::corrupt(
                                self.dict.position(),
                                "compressed chunk before properties",
                            ));
                        }
                    }
                }

                let mut payload = vec![0u8; packed];
                match self.inner.read_exact(&mut payload) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        return Err(LzmaError::unexpected_eof("truncated chunk payload"));
                    }
                    Err(e) => return Err(e.into()),
                }

                let rc = RangeDecoder::new(Cursor::new(payload))?;
                self.chunk = ActiveChunk::Compressed {
                    rc: Box::new(rc),
                    unpacked: unpacked as u64,
                    remaining: unpacked as u64,
                    packed: packed as u64,
                };
            }
        }
        Ok(())
    }

    fn set_props(&mut self, props: Properties) {
        self.seq = Some(SeqDecoder::new(props));
    }

    /// Make decoding progress: start a chunk, copy uncompressed bytes or
    /// decode operations until the dictionary needs draining.
    fn advance(&mut self) -> Result<()> {
        if matches!(self.chunk, ActiveChunk::None) {
            return self.start_chunk();
        }

        match &mut self.chunk {
            ActiveChunk::None => Ok(()),
            ActiveChunk::Uncompressed { remaining } => {
                let mut buf = [0u8; 4096];
                let n = (*remaining).min(self.dict.available()).min(buf.len());
                if n == 0 {
                    if *remaining == 0 {
                        self.chunk = ActiveChunk::None;
                    }
                    return Ok(());
                }
                match self.inner.read_exact(&mut buf[..n]) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        return Err(LzmaError::unexpected_eof("truncated uncompressed chunk"));
                    }
                    Err(e) => return Err(e.into()),
                }
                self.dict.write(&buf[..n]);
                *remaining -= n;
                if *remaining == 0 {
                    self.chunk = ActiveChunk::None;
                }
                Ok(())
            }
            ActiveChunk::Compressed {
                rc,
                unpacked,
                remaining,
                packed,
            } => {
                let seq = self
                    .seq
                    .as_mut()
                    .expect("sequence decoder exists while a chunk is active");

                while *remaining > 0 && self.dict.available() >= MATCH_LEN_MAX {
                    let op = seq.decode_op(rc, &self.dict)?;
                    match op {
                        Operation::Literal(byte) => {
                            self.dict.write_byte(byte);
                            *remaining -= 1;
                        }
                        Operation::Match {
                            distance: EOS_DISTANCE,
                            ..
                        } => {
                            return Err(LzmaError::corrupt(
                                self.dict.position(),
                                "end-of-stream marker inside an LZMA2 chunk",
                            ));
                        }
                        Operation::Match { distance, len } => {
                            if len as u64 > *remaining {
                                return Err(LzmaError::ChunkSizeMismatch {
                                    declared: *unpacked,
                                    actual: *unpacked - *remaining + len as u64,
                                });
                            }
                            self.dict.write_match(len as usize, distance as u64).map_err(
                                |_| {
                                    LzmaError::corrupt(
                                        self.dict.position(),
                                        "match distance exceeds dictionary window",
                                    )
                                },
                            )?;
                            *remaining -= len as u64;
                        }
                    }
                }

                if *remaining == 0 {
                    if rc.bytes_read() != *packed {
                        return Err(LzmaError::ChunkSizeMismatch {
                            declared: *packed,
                            actual: rc.bytes_read(),
                        });
                    }
                    self.chunk = ActiveChunk::None;
                }
                Ok(())
            }
        }
    }
}

impl<R: Read> Read for ChunkReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(LzmaError::Closed.as_io_error());
        }
        if let Some(err) = &self.err {
            return Err(err.as_io_error());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let n = self.dict.read(buf);
            if n > 0 {
                return Ok(n);
            }
            if self.cstate == ChunkState::Stop {
                return Ok(0);
            }
            if let Err(e) = self.advance() {
                let io_err = e.as_io_error();
                self.err = Some(e);
                return Err(io_err);
            }
        }
    }
}

/// Encode one independently decodable segment of LZMA2 chunks.
///
/// The segment starts with a full reset, continues model and dictionary
/// state across its chunks, and falls back to uncompressed framing for any
/// chunk that range coding would expand. No terminator is appended.
pub(crate) fn encode_segment(
    data: &[u8],
    props: Properties,
    dict_size: u32,
    out: &mut Vec<u8>,
) -> Result<()> {
    let mut finder = MatchFinder::new(dict_size as usize);
    let mut seq = SeqEncoder::new(props);

    let mut pos = 0usize;
    let mut first = true;
    let mut state_reset_pending = false;

    while pos < data.len() {
        let chunk_len = (data.len() - pos).min(CHUNK_MAX_UNCOMPRESSED);

        let mut rc = RangeEncoder::new();
        seq.encode_run(&mut rc, data, pos, pos + chunk_len, &mut finder)?;
        let payload = rc.finish();

        if payload.len() < chunk_len {
            // The first compressed chunk after a stored one resends the
            // properties; the chunk sequence rules demand it.
            let reset = if first {
                ResetMode::Full
            } else if state_reset_pending {
                ResetMode::StateProps
            } else {
                ResetMode::None
            };

            push_compressed_header(out, chunk_len, payload.len(), reset, props);
            out.extend_from_slice(&payload);
            state_reset_pending = false;
        } else {
            // Range coding expanded the chunk. Store it raw; the model was
            // already mutated by the discarded attempt, so the next
            // compressed chunk must reset state on both sides.
            push_uncompressed_header(out, chunk_len, first);
            out.extend_from_slice(&data[pos..pos + chunk_len]);
            seq.reset_state();
            state_reset_pending = true;
        }

        first = false;
        pos += chunk_len;
    }

    Ok(())
}

fn push_uncompressed_header(out: &mut Vec<u8>, size: usize, reset_dict: bool) {
    debug_assert!((1..=CHUNK_MAX_UNCOMPRESSED).contains(&size));
    out.push(if reset_dict { 0x01 } else { 0x02 });
    out.extend_from_slice(&((size - 1) as u16).to_be_bytes());
}

fn push_compressed_header(
    out: &mut Vec<u8>,
    unpacked: usize,
    packed: usize,
    reset: ResetMode,
    props: Properties,
) {
    debug_assert!((1..=CHUNK_MAX_UNCOMPRESSED).contains(&unpacked));
    debug_assert!((1..=CHUNK_MAX_COMPRESSED).contains(&packed));

    let unpacked_m1 = unpacked - 1;
    let control = 0x80 | (reset.bits() << 5) | ((unpacked_m1 >> 16) as u8 & 0x1F);
    out.push(control);
    out.extend_from_slice(&((unpacked_m1 & 0xFFFF) as u16).to_be_bytes());
    out.extend_from_slice(&((packed - 1) as u16).to_be_bytes());
    if reset.carries_props() {
        out.push(props.to_byte());
    }
}

/// Decode the dictionary-size property byte used by outer containers.
///
/// The encoding is `(2 | (p & 1)) << (p / 2 + 11)`; byte 40 means the
/// 4 GiB - 1 maximum.
pub fn dict_size_from_props(props: u8) -> Option<u32> {
    if props > 40 {
        return None;
    }
    if props == 40 {
        return Some(u32::MAX);
    }
    let base = 2 | (props as u32 & 1);
    Some(base << (props / 2 + 11))
}

/// Smallest property byte whose dictionary size is at least `dict_size`.
pub fn props_from_dict_size(dict_size: u32) -> u8 {
    for props in 0..=40u8 {
        if dict_size_from_props(props).is_some_and(|size| size >= dict_size) {
            return props;
        }
    }
    40
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(stream: &[u8], dict_size: u32) -> io::Result<Vec<u8>> {
        let mut reader = ChunkReader::new(Cursor::new(stream.to_vec()), dict_size);
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    fn with_terminator(mut segment: Vec<u8>) -> Vec<u8> {
        segment.push(0x00);
        segment
    }

    #[test]
    fn test_chunk_header_parse_eos() {
        let mut raw = Vec::new();
        let header = ChunkHeader::read_from(&mut Cursor::new(vec![0x00]), &mut raw)
            .unwrap()
            .unwrap();
        assert_eq!(header, ChunkHeader::EndOfStream);
        assert_eq!(raw, vec![0x00]);
    }

    #[test]
    fn test_chunk_header_parse_uncompressed() {
        let mut raw = Vec::new();
        let header = ChunkHeader::read_from(&mut Cursor::new(vec![0x01, 0x00, 0x0F]), &mut raw)
            .unwrap()
            .unwrap();
        assert_eq!(
            header,
            ChunkHeader::Uncompressed {
                reset_dict: true,
                size: 16
            }
        );
        assert_eq!(raw.len(), 3);
    }

    #[test]
    fn test_chunk_header_parse_compressed() {
        let props = Properties::default();
        let bytes = vec![0xE0, 0x00, 0x3F, 0x00, 0x09, props.to_byte()];
        let mut raw = Vec::new();
        let header = ChunkHeader::read_from(&mut Cursor::new(bytes.clone()), &mut raw)
            .unwrap()
            .unwrap();
        assert_eq!(
            header,
            ChunkHeader::Compressed {
                reset: ResetMode::Full,
                unpacked: 64,
                packed: 10,
                props: Some(props),
            }
        );
        assert_eq!(raw, bytes);
    }

    #[test]
    fn test_chunk_header_invalid_control() {
        let mut raw = Vec::new();
        let err = ChunkHeader::read_from(&mut Cursor::new(vec![0x03]), &mut raw).unwrap_err();
        assert!(matches!(err, LzmaError::InvalidChunkSequence { .. }));
    }

    #[test]
    fn test_state_machine_first_chunk_rules() {
        let start = ChunkState::Start;
        // Uncompressed without dict reset cannot open a stream.
        let no_reset = ChunkHeader::Uncompressed {
            reset_dict: false,
            size: 1,
        };
        assert!(start.next(&no_reset).is_err());

        // A compressed chunk must open with a full reset.
        let partial = ChunkHeader::Compressed {
            reset: ResetMode::StateProps,
            unpacked: 1,
            packed: 1,
            props: Some(Properties::default()),
        };
        assert!(start.next(&partial).is_err());

        let full = ChunkHeader::Compressed {
            reset: ResetMode::Full,
            unpacked: 1,
            packed: 1,
            props: Some(Properties::default()),
        };
        assert_eq!(start.next(&full).unwrap(), ChunkState::AfterProps);
    }

    #[test]
    fn test_state_machine_props_required_after_uncompressed_start() {
        let state = ChunkState::Start
            .next(&ChunkHeader::Uncompressed {
                reset_dict: true,
                size: 1,
            })
            .unwrap();
        assert_eq!(state, ChunkState::AfterDictReset);

        let continue_chunk = ChunkHeader::Compressed {
            reset: ResetMode::None,
            unpacked: 1,
            packed: 1,
            props: None,
        };
        assert!(state.next(&continue_chunk).is_err());

        let with_props = ChunkHeader::Compressed {
            reset: ResetMode::StateProps,
            unpacked: 1,
            packed: 1,
            props: Some(Properties::default()),
        };
        assert_eq!(state.next(&with_props).unwrap(), ChunkState::AfterProps);
    }

    #[test]
    fn test_state_machine_props_required_after_stored_chunk() {
        let full = ChunkHeader::Compressed {
            reset: ResetMode::Full,
            unpacked: 1,
            packed: 1,
            props: Some(Properties::default()),
        };
        let state = ChunkState::Start.next(&full).unwrap();
        assert_eq!(state, ChunkState::AfterProps);

        let stored = ChunkHeader::Uncompressed {
            reset_dict: false,
            size: 1,
        };
        let state = state.next(&stored).unwrap();
        assert_eq!(state, ChunkState::AfterUncompressed);

        // Another stored chunk keeps the obligation alive.
        assert_eq!(state.next(&stored).unwrap(), ChunkState::AfterUncompressed);

        // Continuing the model, or resetting it from stale properties, is
        // illegal after a stored chunk.
        let continue_chunk = ChunkHeader::Compressed {
            reset: ResetMode::None,
            unpacked: 1,
            packed: 1,
            props: None,
        };
        assert!(state.next(&continue_chunk).is_err());
        let state_reset = ChunkHeader::Compressed {
            reset: ResetMode::State,
            unpacked: 1,
            packed: 1,
            props: None,
        };
        assert!(state.next(&state_reset).is_err());

        let with_props = ChunkHeader::Compressed {
            reset: ResetMode::StateProps,
            unpacked: 1,
            packed: 1,
            props: Some(Properties::default()),
        };
        assert_eq!(state.next(&with_props).unwrap(), ChunkState::AfterProps);

        let full_reset = ChunkHeader::Compressed {
            reset: ResetMode::Full,
            unpacked: 1,
            packed: 1,
            props: Some(Properties::default()),
        };
        assert_eq!(state.next(&full_reset).unwrap(), ChunkState::AfterProps);
    }

    #[test]
    fn test_segment_roundtrip_compressible() {
        let data = vec![b'A'; 100_000];
        let mut segment = Vec::new();
        encode_segment(&data, Properties::default(), 1 << 20, &mut segment).unwrap();
        // First chunk opens with a full reset.
        assert_eq!(segment[0] & 0xE0, 0xE0);

        let decoded = decode_all(&with_terminator(segment), 1 << 20).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_segment_roundtrip_incompressible() {
        // An LCG gives reproducible bytes that do not compress.
        let mut seed = 0x1234_5678_9ABC_DEF0u64;
        let data: Vec<u8> = (0..80_000)
            .map(|_| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                (seed >> 32) as u8
            })
            .collect();

        let mut segment = Vec::new();
        encode_segment(&data, Properties::default(), 1 << 20, &mut segment).unwrap();
        // Incompressible input must fall back to stored chunks.
        assert_eq!(segment[0], 0x01);

        let decoded = decode_all(&with_terminator(segment), 1 << 20).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_segment_roundtrip_mixed() {
        // Compressible text followed by incompressible noise and more text,
        // so the segment interleaves chunk framings.
        let mut data = Vec::new();
        while data.len() < 70_000 {
            data.extend_from_slice(b"mixed chunk framing exercise ");
        }
        let mut seed = 42u64;
        for _ in 0..70_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            data.push((seed >> 32) as u8);
        }
        while data.len() < 200_000 {
            data.extend_from_slice(b"mixed chunk framing exercise ");
        }

        let mut segment = Vec::new();
        encode_segment(&data, Properties::default(), 1 << 22, &mut segment).unwrap();
        let decoded = decode_all(&with_terminator(segment), 1 << 22).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_empty_stream() {
        let decoded = decode_all(&[0x00], 1 << 16).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_missing_terminator() {
        let data = vec![b'B'; 1000];
        let mut segment = Vec::new();
        encode_segment(&data, Properties::default(), 1 << 16, &mut segment).unwrap();
        let err = decode_all(&segment, 1 << 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_truncated_stream() {
        let data = vec![b'C'; 10_000];
        let mut segment = Vec::new();
        encode_segment(&data, Properties::default(), 1 << 16, &mut segment).unwrap();
        let stream = with_terminator(segment);
        for cut in [stream.len() - 2, stream.len() / 2, 3] {
            let err = decode_all(&stream[..cut], 1 << 16).unwrap_err();
            assert!(
                err.kind() == io::ErrorKind::UnexpectedEof
                    || err.kind() == io::ErrorKind::InvalidData,
                "cut at {cut} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_small_dict_streaming() {
        // Chunks larger than the dictionary must stream through it.
        let mut data = Vec::new();
        while data.len() < 150_000 {
            data.extend_from_slice(b"streaming through a small window ");
        }
        let mut segment = Vec::new();
        encode_segment(&data, Properties::default(), 4096, &mut segment).unwrap();
        let decoded = decode_all(&with_terminator(segment), 4096).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_dict_size_props() {
        assert_eq!(dict_size_from_props(0), Some(4096));
        assert_eq!(dict_size_from_props(1), Some(6144));
        assert_eq!(dict_size_from_props(2), Some(8192));
        assert_eq!(dict_size_from_props(40), Some(u32::MAX));
        assert_eq!(dict_size_from_props(41), None);
    }

    #[test]
    fn test_props_from_dict_size() {
        for size in [4096u32, 8192, 1 << 20, 8 << 20, u32::MAX] {
            let props = props_from_dict_size(size);
            assert!(dict_size_from_props(props).unwrap() >= size);
        }
        assert_eq!(props_from_dict_size(4096), 0);
    }
}

//! LZMA operation decoding and the raw LZMA1 reader.
//!
//! [`SeqDecoder`] turns range-coded input into [`Operation`]s by walking the
//! literal/match/rep decision tree; [`LzmaReader`] wraps it with the 13-byte
//! header, the sliding window and the end-of-stream rules.

use crate::dict::DecoderDict;
use crate::error::{LzmaError, Result};
use crate::header::{LzmaHeader, LzmaParams};
use crate::model::{
    DIST_ALIGN_BITS, END_POS_MODEL_INDEX, EOS_DISTANCE, LEN_HIGH_BITS, LEN_LOW_BITS, LEN_MID_BITS,
    LengthModel, LzmaModel, MATCH_LEN_MAX, MATCH_LEN_MIN, Operation, Properties, State,
};
use crate::range_coder::RangeDecoder;
use std::io::{self, Read};

/// Decode a length offset and rebase it to `[MATCH_LEN_MIN, MATCH_LEN_MAX]`.
fn decode_length<R: Read>(
    rc: &mut RangeDecoder<R>,
    len_model: &mut LengthModel,
    pos_state: usize,
) -> Result<u32> {
    if rc.decode_bit(&mut len_model.choice)? == 0 {
        let len = rc.decode_bit_tree(&mut len_model.low[pos_state], LEN_LOW_BITS)?;
        Ok(len + MATCH_LEN_MIN as u32)
    } else if rc.decode_bit(&mut len_model.choice2)? == 0 {
        let len = rc.decode_bit_tree(&mut len_model.mid[pos_state], LEN_MID_BITS)?;
        Ok(len + MATCH_LEN_MIN as u32 + (1 << LEN_LOW_BITS))
    } else {
        let len = rc.decode_bit_tree(&mut len_model.high, LEN_HIGH_BITS)?;
        Ok(len + MATCH_LEN_MIN as u32 + (1 << LEN_LOW_BITS) + (1 << LEN_MID_BITS))
    }
}

/// Decoder half of the operation state machine.
///
/// Holds the probability model, the context state and the four rep
/// registers. The rep registers store distances minus one, as the wire
/// format does.
#[derive(Debug)]
pub(crate) struct SeqDecoder {
    model: LzmaModel,
    state: State,
    reps: [u32; 4],
}

impl SeqDecoder {
    pub(crate) fn new(props: Properties) -> Self {
        Self {
            model: LzmaModel::new(props),
            state: State::new(),
            reps: [0; 4],
        }
    }

    /// Re-initialize probabilities, state and reps, keeping the properties.
    pub(crate) fn reset_state(&mut self) {
        self.model.reset();
        self.state = State::new();
        self.reps = [0; 4];
    }

    /// Decode the next operation.
    ///
    /// `dict` supplies the previous byte and the matched byte for literal
    /// contexts; the position counter is the dictionary position since the
    /// last reset.
    pub(crate) fn decode_op<R: Read>(
        &mut self,
        rc: &mut RangeDecoder<R>,
        dict: &DecoderDict,
    ) -> Result<Operation> {
        let pos = dict.pos_since_reset();
        let pos_state = (pos as usize) & (self.model.props.num_pos_states() - 1);
        let state_idx = self.state.value();

        if rc.decode_bit(&mut self.model.is_match[state_idx][pos_state])? == 0 {
            let byte = self.decode_literal(rc, dict, pos)?;
            self.state.update_literal();
            return Ok(Operation::Literal(byte));
        }

        if rc.decode_bit(&mut self.model.is_rep[state_idx])? == 0 {
            // Simple match: the new distance enters rep0 before the EOS
            // check, exactly as the encoder shifts it.
            let len = decode_length(rc, &mut self.model.match_len, pos_state)?;
            let dist = self.decode_distance(rc, len)?;
            self.reps = [dist, self.reps[0], self.reps[1], self.reps[2]];
            self.state.update_match();

            let distance = if dist >= EOS_DISTANCE - 1 {
                EOS_DISTANCE
            } else {
                dist + 1
            };
            return Ok(Operation::Match { distance, len });
        }

        // Rep match: pick one of the four registers.
        if rc.decode_bit(&mut self.model.is_rep0[state_idx])? == 0 {
            if rc.decode_bit(&mut self.model.is_rep0_long[state_idx][pos_state])? == 0 {
                self.state.update_short_rep();
                return Ok(Operation::Match {
                    distance: self.reps[0] + 1,
                    len: 1,
                });
            }
        } else if rc.decode_bit(&mut self.model.is_rep1[state_idx])? == 0 {
            self.reps.swap(0, 1);
        } else if rc.decode_bit(&mut self.model.is_rep2[state_idx])? == 0 {
            let d = self.reps[2];
            self.reps[2] = self.reps[1];
            self.reps[1] = self.reps[0];
            self.reps[0] = d;
        } else {
            let d = self.reps[3];
            self.reps[3] = self.reps[2];
            self.reps[2] = self.reps[1];
            self.reps[1] = self.reps[0];
            self.reps[0] = d;
        }

        let len = decode_length(rc, &mut self.model.rep_len, pos_state)?;
        self.state.update_rep();
        Ok(Operation::Match {
            distance: self.reps[0] + 1,
            len,
        })
    }

    fn decode_literal<R: Read>(
        &mut self,
        rc: &mut RangeDecoder<R>,
        dict: &DecoderDict,
        pos: u64,
    ) -> Result<u8> {
        let table = self.model.literal.table_index(
            pos,
            dict.prev_byte(),
            self.model.props.lc,
            self.model.props.lp,
        );
        let probs = &mut self.model.literal.probs[table];

        if self.state.is_literal() {
            let mut symbol = 1usize;
            loop {
                let bit = rc.decode_bit(&mut probs[symbol])?;
                symbol = (symbol << 1) | bit as usize;
                if symbol >= 0x100 {
                    break;
                }
            }
            Ok((symbol - 0x100) as u8)
        } else {
            // After a match the decision tree is masked by the byte the
            // match would have produced next.
            let back = self.reps[0] as u64 + 1;
            let mut match_byte = if back <= dict.window_len() {
                dict.byte_at_offset(back) as usize
            } else {
                0
            };

            let mut symbol = 1usize;
            loop {
                let match_bit = (match_byte >> 7) & 1;
                match_byte = (match_byte << 1) & 0xFF;

                let idx = 0x100 + (match_bit << 8) + symbol;
                let bit = rc.decode_bit(&mut probs[idx])?;
                symbol = (symbol << 1) | bit as usize;

                if symbol >= 0x100 {
                    break;
                }

                if bit as usize != match_bit {
                    while symbol < 0x100 {
                        let bit = rc.decode_bit(&mut probs[symbol])?;
                        symbol = (symbol << 1) | bit as usize;
                    }
                    break;
                }
            }
            Ok((symbol - 0x100) as u8)
        }
    }

    /// Decode a distance minus one for a match of length `len`.
    fn decode_distance<R: Read>(&mut self, rc: &mut RangeDecoder<R>, len: u32) -> Result<u32> {
        let len_state = ((len - MATCH_LEN_MIN as u32).min(3)) as usize;

        let slot = rc.decode_bit_tree(&mut self.model.distance.slot[len_state], 6)?;
        if slot < 4 {
            return Ok(slot);
        }

        let num_direct_bits = (slot >> 1) - 1;
        let mut dist = (2 | (slot & 1)) << num_direct_bits;

        if slot < END_POS_MODEL_INDEX as u32 {
            // Shared cells, reversed bit order. The slot's block starts at
            // `dist - slot - 1` in the flat table.
            let mut result = 0u32;
            let mut m = 1usize;
            for i in 0..num_direct_bits {
                let idx = dist as usize + m - slot as usize - 1;
                let bit = rc.decode_bit(&mut self.model.distance.special[idx])?;
                m = (m << 1) | bit as usize;
                result |= bit << i;
            }
            dist += result;
        } else {
            let direct = rc.decode_direct_bits(num_direct_bits - DIST_ALIGN_BITS)?;
            dist += direct << DIST_ALIGN_BITS;
            dist += rc.decode_bit_tree_reverse(&mut self.model.distance.align, DIST_ALIGN_BITS)?;
        }

        Ok(dist)
    }
}

/// Streaming reader for raw LZMA1 streams.
///
/// Parses the 13-byte header, then decodes on demand as the caller reads.
/// The first fatal error is latched and returned from every subsequent
/// call.
pub struct LzmaReader<R> {
    rc: RangeDecoder<R>,
    seq: SeqDecoder,
    dict: DecoderDict,
    dict_size: u32,
    size: Option<u64>,
    eof: bool,
    err: Option<LzmaError>,
    closed: bool,
}

impl<R: Read> LzmaReader<R> {
    /// Create a reader, consuming the header from `inner`.
    pub fn new(mut inner: R) -> Result<Self> {
        let header = LzmaHeader::read_from(&mut inner)?;
        Self::with_header(inner, header)
    }

    /// Create a reader for a headerless stream with explicit parameters.
    pub fn with_params(inner: R, params: &LzmaParams) -> Result<Self> {
        params.props.verify()?;
        Self::with_header(inner, params.header())
    }

    fn with_header(inner: R, header: LzmaHeader) -> Result<Self> {
        Ok(Self {
            rc: RangeDecoder::new(inner)?,
            seq: SeqDecoder::new(header.props),
            dict: DecoderDict::new(header.dict_size),
            dict_size: header.dict_size.max(crate::dict::MIN_DICT_SIZE),
            size: header.size,
            eof: false,
            err: None,
            closed: false,
        })
    }

    /// The properties declared in the header.
    pub fn properties(&self) -> Properties {
        self.seq.model.props
    }

    /// The dictionary size in use.
    pub fn dict_size(&self) -> u32 {
        self.dict_size
    }

    /// Release buffers. Further reads fail with `Closed`.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Decode operations until the dictionary needs draining or the stream
    /// ends.
    fn fill(&mut self) -> Result<()> {
        while !self.eof && self.dict.available() >= MATCH_LEN_MAX {
            if let Some(size) = self.size {
                if self.dict.position() == size {
                    self.finish_known_size()?;
                    break;
                }
            }

            let op = self.seq.decode_op(&mut self.rc, &self.dict)?;
            self.apply(op)?;
        }
        Ok(())
    }

    fn apply(&mut self, op: Operation) -> Result<()> {
        match op {
            Operation::Literal(byte) => {
                self.dict.write_byte(byte);
            }
            Operation::Match {
                distance: EOS_DISTANCE,
                ..
            } => {
                if !self.rc.possibly_at_end() {
                    return Err(LzmaError::corrupt(
                        self.dict.position(),
                        "data after end-of-stream marker",
                    ));
                }
                if let Some(size) = self.size {
                    if self.dict.position() != size {
                        return Err(LzmaError::corrupt(
                            self.dict.position(),
                            "end-of-stream marker before declared size",
                        ));
                    }
                }
                self.eof = true;
            }
            Operation::Match { distance, len } => {
                if let Some(size) = self.size {
                    if self.dict.position() + len as u64 > size {
                        return Err(LzmaError::corrupt(
                            self.dict.position(),
                            "match crosses declared uncompressed size",
                        ));
                    }
                }
                self.dict
                    .write_match(len as usize, distance as u64)
                    .map_err(|_| {
                        LzmaError::corrupt(
                            self.dict.position(),
                            "match distance exceeds dictionary window",
                        )
                    })?;
            }
        }
        Ok(())
    }

    /// Declared size reached: the stream must stop here, optionally with an
    /// end-of-stream marker.
    fn finish_known_size(&mut self) -> Result<()> {
        if !self.rc.possibly_at_end() {
            match self.seq.decode_op(&mut self.rc, &self.dict) {
                Ok(Operation::Match {
                    distance: EOS_DISTANCE,
                    ..
                }) if self.rc.possibly_at_end() => {}
                Ok(_) => {
                    return Err(LzmaError::corrupt(
                        self.dict.position(),
                        "trailing data after declared uncompressed size",
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        self.eof = true;
        Ok(())
    }
}

impl<R: Read> Read for LzmaReader<R> {
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
            if self.eof {
                return Ok(0);
            }
            if let Err(e) = self.fill() {
                let io_err = e.as_io_error();
                self.err = Some(e);
                return Err(io_err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::LzmaWriter;
    use std::io::{Cursor, Write};

    fn lzma_compress(data: &[u8], params: LzmaParams) -> Vec<u8> {
        let mut writer = LzmaWriter::new(Vec::new(), params).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    fn lzma_decompress(data: &[u8]) -> io::Result<Vec<u8>> {
        let mut reader = LzmaReader::new(Cursor::new(data.to_vec())).map_err(io::Error::from)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_roundtrip_eos() {
        let text = b"The quick brown fox jumps over the lazy dog.\n";
        let compressed = lzma_compress(text, LzmaParams::default());
        let decoded = lzma_decompress(&compressed).unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn test_roundtrip_known_size() {
        let text = b"Pack my box with five dozen liquor jugs. Pack my box again.";
        let params = LzmaParams::default().with_size(text.len() as u64);
        let compressed = lzma_compress(text, params);
        let decoded = lzma_decompress(&compressed).unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn test_roundtrip_empty() {
        let compressed = lzma_compress(b"", LzmaParams::default());
        let decoded = lzma_decompress(&compressed).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_roundtrip_repeated() {
        let data = vec![b'A'; 5000];
        let compressed = lzma_compress(&data, LzmaParams::default());
        assert!(compressed.len() < data.len() / 4);
        let decoded = lzma_decompress(&compressed).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_roundtrip_pattern() {
        let mut data = Vec::new();
        while data.len() < 20_000 {
            data.extend_from_slice(b"TOBEORNOTTOBEORTOBEORNOT");
        }
        let compressed = lzma_compress(&data, LzmaParams::default());
        let decoded = lzma_decompress(&compressed).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_truncated_stream() {
        let text = b"some reasonably long text for truncation testing, repeated twice: \
                     some reasonably long text for truncation testing";
        let compressed = lzma_compress(text, LzmaParams::default());
        let truncated = &compressed[..compressed.len() - 1];
        let err = lzma_decompress(truncated).unwrap_err();
        assert!(
            err.kind() == io::ErrorKind::UnexpectedEof
                || err.kind() == io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_closed_reader() {
        let compressed = lzma_compress(b"abc", LzmaParams::default());
        let mut reader = LzmaReader::new(Cursor::new(compressed)).unwrap();
        reader.close();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_error_is_latched() {
        let text = b"latch this error, latch this error, latch this error";
        let compressed = lzma_compress(text, LzmaParams::default());
        let truncated = compressed[..compressed.len() - 2].to_vec();
        let mut reader = LzmaReader::new(Cursor::new(truncated)).unwrap();
        let mut out = Vec::new();
        let first = reader.read_to_end(&mut out).unwrap_err();
        let mut buf = [0u8; 16];
        let second = reader.read(&mut buf).unwrap_err();
        assert_eq!(first.kind(), second.kind());
    }
}

//! LZMA operation encoding and the raw LZMA1 writer.
//!
//! [`SeqEncoder`] runs the operation-selection loop over an input buffer:
//! candidate offsets come from the hash-chain match finder plus the short
//! distances 1..8 and the four rep registers, the longest match wins, and
//! ties go to the candidate encountered last so cheaper encodings prevail.
//! [`LzmaWriter`] wraps it with the 13-byte header and the size/EOS rules.

use crate::error::{LzmaError, Result};
use crate::header::LzmaParams;
use crate::match_finder::{MatchFinder, match_len};
use crate::model::{
    DIST_ALIGN_BITS, END_POS_MODEL_INDEX, EOS_DISTANCE, LEN_HIGH_BITS, LEN_LOW_BITS, LEN_MID_BITS,
    LengthModel, LzmaModel, MATCH_LEN_MAX, MATCH_LEN_MIN, Properties, State,
};
use crate::range_coder::RangeEncoder;
use std::io::{self, Write};

/// Encode a length rebased to the `[MATCH_LEN_MIN, MATCH_LEN_MAX]` range.
fn encode_length(rc: &mut RangeEncoder, len_model: &mut LengthModel, len: u32, pos_state: usize) {
    let len = len - MATCH_LEN_MIN as u32;

    if len < (1 << LEN_LOW_BITS) {
        rc.encode_bit(&mut len_model.choice, 0);
        rc.encode_bit_tree(&mut len_model.low[pos_state], LEN_LOW_BITS, len);
    } else if len < (1 << LEN_LOW_BITS) + (1 << LEN_MID_BITS) {
        rc.encode_bit(&mut len_model.choice, 1);
        rc.encode_bit(&mut len_model.choice2, 0);
        rc.encode_bit_tree(
            &mut len_model.mid[pos_state],
            LEN_MID_BITS,
            len - (1 << LEN_LOW_BITS),
        );
    } else {
        rc.encode_bit(&mut len_model.choice, 1);
        rc.encode_bit(&mut len_model.choice2, 1);
        rc.encode_bit_tree(
            &mut len_model.high,
            LEN_HIGH_BITS,
            len - (1 << LEN_LOW_BITS) - (1 << LEN_MID_BITS),
        );
    }
}

/// Distance slot for a distance minus one.
fn dist_slot(dist: u32) -> u32 {
    if dist < 4 {
        return dist;
    }
    let bits = 32 - dist.leading_zeros();
    ((bits - 1) << 1) | ((dist >> (bits - 2)) & 1)
}

/// Encoder half of the operation state machine.
#[derive(Debug)]
pub(crate) struct SeqEncoder {
    model: LzmaModel,
    state: State,
    /// Rep registers holding distances minus one.
    reps: [u32; 4],
    cand_scratch: Vec<usize>,
}

impl SeqEncoder {
    pub(crate) fn new(props: Properties) -> Self {
        Self {
            model: LzmaModel::new(props),
            state: State::new(),
            reps: [0; 4],
            cand_scratch: Vec::with_capacity(crate::match_finder::MAX_CANDIDATES),
        }
    }

    /// Re-initialize probabilities, state and reps, keeping the properties.
    pub(crate) fn reset_state(&mut self) {
        self.model.reset();
        self.state = State::new();
        self.reps = [0; 4];
    }

    /// Encode operations covering `data[start..end]`.
    ///
    /// Positions in `data` double as the position counter since the last
    /// reset, so `data` must begin at a dictionary-reset boundary. The
    /// finder carries hash entries across calls on the same buffer.
    pub(crate) fn encode_run(
        &mut self,
        rc: &mut RangeEncoder,
        data: &[u8],
        start: usize,
        end: usize,
        finder: &mut MatchFinder,
    ) -> Result<()> {
        let mut pos = start;
        while pos < end {
            let limit = MATCH_LEN_MAX.min(end - pos);
            let advance = match self.find_best(data, pos, limit, finder) {
                Some((offset, len)) => {
                    let dist = (pos - offset - 1) as u32;
                    self.encode_match(rc, pos, dist, len)?;
                    len
                }
                None => {
                    self.encode_literal(rc, data, pos);
                    1
                }
            };

            for i in 0..advance {
                finder.insert(data, pos + i);
            }
            pos += advance;
        }
        Ok(())
    }

    /// Write the end-of-stream marker: a simple match with the reserved
    /// distance and minimum length.
    pub(crate) fn encode_eos(&mut self, rc: &mut RangeEncoder, pos: usize) {
        let pos_state = pos & (self.model.props.num_pos_states() - 1);
        let state_idx = self.state.value();

        rc.encode_bit(&mut self.model.is_match[state_idx][pos_state], 1);
        rc.encode_bit(&mut self.model.is_rep[state_idx], 0);
        encode_length(
            rc,
            &mut self.model.match_len,
            MATCH_LEN_MIN as u32,
            pos_state,
        );
        self.encode_distance(rc, EOS_DISTANCE, MATCH_LEN_MIN as u32);
        self.reps = [EOS_DISTANCE, self.reps[0], self.reps[1], self.reps[2]];
        self.state.update_match();
    }

    /// Pick the best `(offset, length)` candidate at `pos`, or `None` for a
    /// literal.
    ///
    /// Candidates are scanned as distances 1..8, then hash-chain offsets
    /// oldest to newest, then rep registers rep3 down to rep0; an equal
    /// length replaces the incumbent so the later candidate wins.
    fn find_best(
        &mut self,
        data: &[u8],
        pos: usize,
        limit: usize,
        finder: &MatchFinder,
    ) -> Option<(usize, usize)> {
        if limit == 0 {
            return None;
        }
        let window = finder.window();
        let mut best_off = 0usize;
        let mut best_len = 0usize;

        for d in 1..=8usize {
            if d > pos || d > window {
                break;
            }
            let len = match_len(data, pos - d, pos, limit);
            if len > 0 && len >= best_len {
                best_off = pos - d;
                best_len = len;
            }
        }

        let mut cands = std::mem::take(&mut self.cand_scratch);
        finder.candidates(data, pos, &mut cands);
        for &c in cands.iter().rev() {
            let len = match_len(data, c, pos, limit);
            if len > 0 && len >= best_len {
                best_off = c;
                best_len = len;
            }
        }
        self.cand_scratch = cands;

        for g in (0..4).rev() {
            let dist = self.reps[g] as usize + 1;
            if dist > pos || dist > window {
                continue;
            }
            let len = match_len(data, pos - dist, pos, limit);
            if len > 0 && len >= best_len {
                best_off = pos - dist;
                best_len = len;
            }
        }

        if best_len == 0 {
            return None;
        }
        if best_len == 1 {
            // A length-1 reference only pays off as a short rep.
            let rep0_off = pos.checked_sub(self.reps[0] as usize + 1)?;
            if best_off != rep0_off {
                return None;
            }
        }
        Some((best_off, best_len))
    }

    fn encode_literal(&mut self, rc: &mut RangeEncoder, data: &[u8], pos: usize) {
        let pos_state = pos & (self.model.props.num_pos_states() - 1);
        let state_idx = self.state.value();
        rc.encode_bit(&mut self.model.is_match[state_idx][pos_state], 0);

        let prev_byte = if pos > 0 { data[pos - 1] } else { 0 };
        let table = self.model.literal.table_index(
            pos as u64,
            prev_byte,
            self.model.props.lc,
            self.model.props.lp,
        );
        let probs = &mut self.model.literal.probs[table];
        let byte = data[pos];

        if self.state.is_literal() {
            let mut symbol = (byte as usize) | 0x100;
            let mut context = 1usize;
            loop {
                let bit = (symbol >> 7) & 1;
                symbol <<= 1;
                rc.encode_bit(&mut probs[context], bit as u32);
                context = (context << 1) | bit;
                if context >= 0x100 {
                    break;
                }
            }
        } else {
            // The previous op was a match, so pos > rep0 holds and the
            // matched byte exists in the buffer.
            let match_byte = data[pos - self.reps[0] as usize - 1];
            let mut symbol = (byte as usize) | 0x100;
            let mut match_symbol = (match_byte as usize) << 1;
            let mut context = 1usize;
            loop {
                let match_bit = (match_symbol >> 8) & 1;
                match_symbol = (match_symbol << 1) & 0x1FF;

                let bit = (symbol >> 7) & 1;
                symbol <<= 1;

                let idx = 0x100 + (match_bit << 8) + context;
                rc.encode_bit(&mut probs[idx], bit as u32);
                context = (context << 1) | bit;

                if context >= 0x100 {
                    break;
                }

                if bit != match_bit {
                    while context < 0x100 {
                        let bit = (symbol >> 7) & 1;
                        symbol <<= 1;
                        rc.encode_bit(&mut probs[context], bit as u32);
                        context = (context << 1) | bit;
                    }
                    break;
                }
            }
        }

        self.state.update_literal();
    }

    /// Encode a match with distance minus one `dist` and length `len`.
    ///
    /// The reserved end-of-stream distance is rejected here; only
    /// [`SeqEncoder::encode_eos`] emits it.
    fn encode_match(
        &mut self,
        rc: &mut RangeEncoder,
        pos: usize,
        dist: u32,
        len: usize,
    ) -> Result<()> {
        if dist == EOS_DISTANCE {
            return Err(LzmaError::DistanceOutOfRange {
                distance: dist as u64 + 1,
                window: EOS_DISTANCE as u64,
            });
        }

        let pos_state = pos & (self.model.props.num_pos_states() - 1);
        let state_idx = self.state.value();
        let g = self.reps.iter().position(|&r| r == dist);

        if !(MATCH_LEN_MIN..=MATCH_LEN_MAX).contains(&len) && !(len == 1 && g == Some(0)) {
            return Err(LzmaError::LengthOutOfRange {
                length: len,
                min: MATCH_LEN_MIN,
                max: MATCH_LEN_MAX,
            });
        }

        rc.encode_bit(&mut self.model.is_match[state_idx][pos_state], 1);

        match g {
            Some(0) => {
                rc.encode_bit(&mut self.model.is_rep[state_idx], 1);
                rc.encode_bit(&mut self.model.is_rep0[state_idx], 0);
                if len == 1 {
                    rc.encode_bit(&mut self.model.is_rep0_long[state_idx][pos_state], 0);
                    self.state.update_short_rep();
                    return Ok(());
                }
                rc.encode_bit(&mut self.model.is_rep0_long[state_idx][pos_state], 1);
                encode_length(rc, &mut self.model.rep_len, len as u32, pos_state);
                self.state.update_rep();
            }
            Some(idx) => {
                rc.encode_bit(&mut self.model.is_rep[state_idx], 1);
                rc.encode_bit(&mut self.model.is_rep0[state_idx], 1);
                if idx == 1 {
                    rc.encode_bit(&mut self.model.is_rep1[state_idx], 0);
                } else {
                    rc.encode_bit(&mut self.model.is_rep1[state_idx], 1);
                    rc.encode_bit(&mut self.model.is_rep2[state_idx], (idx != 2) as u32);
                }

                // Rotate the used register to the front.
                let d = self.reps[idx];
                for j in (1..=idx).rev() {
                    self.reps[j] = self.reps[j - 1];
                }
                self.reps[0] = d;

                encode_length(rc, &mut self.model.rep_len, len as u32, pos_state);
                self.state.update_rep();
            }
            None => {
                rc.encode_bit(&mut self.model.is_rep[state_idx], 0);
                encode_length(rc, &mut self.model.match_len, len as u32, pos_state);
                self.encode_distance(rc, dist, len as u32);
                self.reps = [dist, self.reps[0], self.reps[1], self.reps[2]];
                self.state.update_match();
            }
        }
        Ok(())
    }

    /// Encode a distance minus one for a match of length `len`.
    fn encode_distance(&mut self, rc: &mut RangeEncoder, dist: u32, len: u32) {
        let len_state = ((len - MATCH_LEN_MIN as u32).min(3)) as usize;
        let slot = dist_slot(dist);

        rc.encode_bit_tree(&mut self.model.distance.slot[len_state], 6, slot);

        if slot >= 4 {
            let num_direct_bits = (slot >> 1) - 1;
            let base = (2 | (slot & 1)) << num_direct_bits;
            let reduced = dist - base;

            if slot < END_POS_MODEL_INDEX as u32 {
                // The slot's cell block starts at `base - slot - 1` in the
                // flat table, mirroring the decoder.
                let mut m = 1usize;
                for i in 0..num_direct_bits {
                    let bit = (reduced >> i) & 1;
                    let idx = base as usize + m - slot as usize - 1;
                    rc.encode_bit(&mut self.model.distance.special[idx], bit);
                    m = (m << 1) | bit as usize;
                }
            } else {
                rc.encode_direct_bits(reduced >> DIST_ALIGN_BITS, num_direct_bits - DIST_ALIGN_BITS);
                rc.encode_bit_tree_reverse(
                    &mut self.model.distance.align,
                    DIST_ALIGN_BITS,
                    reduced & ((1 << DIST_ALIGN_BITS) - 1),
                );
            }
        }
    }
}

/// Streaming writer for raw LZMA1 streams.
///
/// Input is buffered and encoded when the writer is finished, which lets the
/// match finder see the whole stream. The declared size, when present,
/// bounds what `write` accepts.
pub struct LzmaWriter<W: Write> {
    inner: Option<W>,
    params: LzmaParams,
    buf: Vec<u8>,
    err: Option<LzmaError>,
    closed: bool,
}

impl<W: Write> LzmaWriter<W> {
    /// Create a writer with the given parameters.
    pub fn new(inner: W, params: LzmaParams) -> Result<Self> {
        params.verify()?;
        Ok(Self {
            inner: Some(inner),
            params,
            buf: Vec::new(),
            err: None,
            closed: false,
        })
    }

    /// The dictionary size that will be declared in the header.
    pub fn dict_size(&self) -> u32 {
        self.params.dict_size
    }

    fn write_inner(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(LzmaError::Closed);
        }
        if let Some(size) = self.params.size.filter(|_| self.params.size_in_header) {
            let room = (size - self.buf.len() as u64).min(data.len() as u64) as usize;
            if room < data.len() {
                self.buf.extend_from_slice(&data[..room]);
                return Err(LzmaError::WriteExceedsSize { declared: size });
            }
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    /// Encode the buffered input and emit the complete stream.
    ///
    /// Consumes the writer and returns the underlying sink.
    pub fn finish(mut self) -> Result<W> {
        self.close()?;
        Ok(self.inner.take().expect("inner writer present after close"))
    }

    /// Encode the buffered input and emit the complete stream, keeping the
    /// writer around in its closed state.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(LzmaError::Closed);
        }
        self.closed = true;

        let inner = self.inner.as_mut().expect("inner writer present");
        self.params.header().write_to(inner)?;

        let mut finder = MatchFinder::new(self.params.dict_size as usize);
        let mut seq = SeqEncoder::new(self.params.props);
        let mut rc = RangeEncoder::new();
        seq.encode_run(&mut rc, &self.buf, 0, self.buf.len(), &mut finder)?;
        if self.params.eos {
            seq.encode_eos(&mut rc, self.buf.len());
        }
        inner.write_all(&rc.finish())?;
        inner.flush()?;
        Ok(())
    }
}

impl<W: Write> Write for LzmaWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if let Some(err) = &self.err {
            return Err(err.as_io_error());
        }
        match self.write_inner(data) {
            Ok(n) => Ok(n),
            Err(e) => {
                let io_err = e.as_io_error();
                self.err = Some(e);
                Err(io_err)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(LzmaError::Closed.as_io_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dist_slot() {
        assert_eq!(dist_slot(0), 0);
        assert_eq!(dist_slot(1), 1);
        assert_eq!(dist_slot(2), 2);
        assert_eq!(dist_slot(3), 3);
        assert_eq!(dist_slot(4), 4);
        assert_eq!(dist_slot(5), 4);
        assert_eq!(dist_slot(6), 5);
        assert_eq!(dist_slot(7), 5);
        assert_eq!(dist_slot(8), 6);
        assert_eq!(dist_slot(u32::MAX), 63);
    }

    #[test]
    fn test_write_exceeds_declared_size() {
        let params = LzmaParams::default().with_size(4);
        let mut writer = LzmaWriter::new(Vec::new(), params).unwrap();
        writer.write_all(b"ab").unwrap();
        let err = writer.write(b"cde").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_double_close() {
        let mut writer = LzmaWriter::new(Vec::new(), LzmaParams::default()).unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.close(), Err(LzmaError::Closed)));
    }

    #[test]
    fn test_rejects_small_dict() {
        let params = LzmaParams::default().with_dict_size(512);
        assert!(LzmaWriter::new(Vec::new(), params).is_err());
    }

    #[test]
    fn test_length_out_of_range() {
        let mut seq = SeqEncoder::new(Properties::default());
        let mut rc = RangeEncoder::new();
        let err = seq.encode_match(&mut rc, 0, 100, 300).unwrap_err();
        assert!(matches!(err, LzmaError::LengthOutOfRange { .. }));
    }

    #[test]
    fn test_distance_out_of_range() {
        let mut seq = SeqEncoder::new(Properties::default());
        let mut rc = RangeEncoder::new();
        let err = seq.encode_match(&mut rc, 0, EOS_DISTANCE, 4).unwrap_err();
        assert!(matches!(err, LzmaError::DistanceOutOfRange { .. }));
    }

    #[test]
    fn test_header_written_first() {
        let params = LzmaParams::default().with_size(3);
        let mut writer = LzmaWriter::new(Vec::new(), params).unwrap();
        writer.write_all(b"abc").unwrap();
        let out = writer.finish().unwrap();
        assert_eq!(out[0], 0x5D);
        assert_eq!(&out[1..5], &(8u32 << 20).to_le_bytes());
        assert_eq!(&out[5..13], &3u64.to_le_bytes());
    }
}

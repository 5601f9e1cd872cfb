//! Decoder-side sliding window (dictionary).
//!
//! The dictionary is logically an append-only stream of emitted bytes
//! addressed by absolute 64-bit position, backed by a ring buffer of the
//! configured window size. A byte at absolute position `p` is readable while
//! `head - window <= p < head`; `head` only ever grows.
//!
//! The buffer doubles as the decoder's output queue: decoded bytes stay in
//! the ring until the caller drains them through [`DecoderDict::read`], and
//! the decode loop only runs while [`DecoderDict::available`] leaves room for
//! a maximal match.

use crate::error::{LzmaError, Result};

/// Smallest permitted dictionary size.
pub const MIN_DICT_SIZE: u32 = 4096;

/// Sliding window used by the LZMA and LZMA2 decoders.
#[derive(Debug)]
pub struct DecoderDict {
    buf: Vec<u8>,
    capacity: u64,
    /// Absolute position of the next byte to be written.
    head: u64,
    /// Absolute position of the next byte to be drained.
    read_pos: u64,
    /// Absolute position of the most recent dictionary reset.
    window_start: u64,
}

impl DecoderDict {
    /// Create a dictionary with the given window size.
    ///
    /// Sizes below [`MIN_DICT_SIZE`] are rounded up.
    pub fn new(dict_size: u32) -> Self {
        let capacity = dict_size.max(MIN_DICT_SIZE) as usize;
        Self {
            buf: vec![0u8; capacity],
            capacity: capacity as u64,
            head: 0,
            read_pos: 0,
            window_start: 0,
        }
    }

    /// Absolute position of the write head. Monotonically non-decreasing.
    pub fn position(&self) -> u64 {
        self.head
    }

    /// Bytes written since the last dictionary reset.
    ///
    /// This is the position counter the probability model contexts use.
    pub fn pos_since_reset(&self) -> u64 {
        self.head - self.window_start
    }

    /// Number of decoded bytes waiting to be drained.
    pub fn buffered(&self) -> usize {
        (self.head - self.read_pos) as usize
    }

    /// Remaining capacity before undrained output would be overwritten.
    pub fn available(&self) -> usize {
        (self.capacity - (self.head - self.read_pos)) as usize
    }

    /// Number of bytes currently addressable by a match.
    pub fn window_len(&self) -> u64 {
        (self.head - self.window_start).min(self.capacity)
    }

    /// Empty the match window. The absolute position keeps growing.
    pub fn reset(&mut self) {
        self.window_start = self.head;
    }

    /// Peek the byte `back` positions behind the head.
    ///
    /// `back` must be in `1..=window_len()`; this is checked by the match
    /// paths before they get here.
    #[inline]
    pub fn byte_at_offset(&self, back: u64) -> u8 {
        debug_assert!(back >= 1 && back <= self.window_len());
        self.buf[((self.head - back) % self.capacity) as usize]
    }

    /// The byte most recently written, or 0 right after a reset.
    #[inline]
    pub fn prev_byte(&self) -> u8 {
        if self.head == self.window_start {
            0
        } else {
            self.byte_at_offset(1)
        }
    }

    /// Append a single byte.
    #[inline]
    pub fn write_byte(&mut self, byte: u8) {
        debug_assert!(self.available() > 0);
        self.buf[(self.head % self.capacity) as usize] = byte;
        self.head += 1;
    }

    /// Append bytes from `data`, limited by the free capacity.
    ///
    /// Returns the number of bytes written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available());
        for &byte in &data[..n] {
            self.buf[(self.head % self.capacity) as usize] = byte;
            self.head += 1;
        }
        n
    }

    /// Replay `len` bytes starting `distance` positions behind the head.
    ///
    /// Self-overlap is allowed: `len > distance` repeats the trailing
    /// pattern, byte by byte.
    pub fn write_match(&mut self, len: usize, distance: u64) -> Result<()> {
        if distance == 0 || distance > self.window_len() {
            return Err(LzmaError::DistanceOutOfRange {
                distance,
                window: self.window_len(),
            });
        }
        debug_assert!(len <= self.available());
        for _ in 0..len {
            let byte = self.byte_at_offset(distance);
            self.write_byte(byte);
        }
        Ok(())
    }

    /// Drain decoded bytes into `out`, returning how many were copied.
    ///
    /// Never fails; returns 0 only when nothing is buffered.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buffered());
        for slot in &mut out[..n] {
            *slot = self.buf[(self.read_pos % self.capacity) as usize];
            self.read_pos += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let mut dict = DecoderDict::new(4096);
        assert_eq!(dict.write(b"hello"), 5);
        assert_eq!(dict.position(), 5);
        assert_eq!(dict.buffered(), 5);

        let mut out = [0u8; 8];
        assert_eq!(dict.read(&mut out), 5);
        assert_eq!(&out[..5], b"hello");
        assert_eq!(dict.buffered(), 0);
        assert_eq!(dict.position(), 5);
    }

    #[test]
    fn test_byte_at_offset() {
        let mut dict = DecoderDict::new(4096);
        dict.write(b"abcdef");
        assert_eq!(dict.byte_at_offset(1), b'f');
        assert_eq!(dict.byte_at_offset(6), b'a');
        assert_eq!(dict.prev_byte(), b'f');
    }

    #[test]
    fn test_write_match_overlap() {
        let mut dict = DecoderDict::new(4096);
        dict.write(b"ab");
        // length > distance repeats the pattern
        dict.write_match(6, 2).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(dict.read(&mut out), 8);
        assert_eq!(&out, b"abababab");
    }

    #[test]
    fn test_write_match_invalid_distance() {
        let mut dict = DecoderDict::new(4096);
        dict.write(b"xy");
        assert!(matches!(
            dict.write_match(1, 0),
            Err(LzmaError::DistanceOutOfRange { .. })
        ));
        assert!(matches!(
            dict.write_match(1, 3),
            Err(LzmaError::DistanceOutOfRange { .. })
        ));
    }

    #[test]
    fn test_reset_keeps_position_monotonic() {
        let mut dict = DecoderDict::new(4096);
        dict.write(b"abc");
        dict.reset();
        assert_eq!(dict.position(), 3);
        assert_eq!(dict.pos_since_reset(), 0);
        assert_eq!(dict.window_len(), 0);
        assert_eq!(dict.prev_byte(), 0);

        // matches must not reach behind the reset
        dict.write(b"z");
        assert!(dict.write_match(1, 2).is_err());
        dict.write_match(1, 1).unwrap();
    }

    #[test]
    fn test_reset_preserves_undrained_output() {
        let mut dict = DecoderDict::new(4096);
        dict.write(b"keep");
        dict.reset();
        dict.write(b"me");
        let mut out = [0u8; 6];
        assert_eq!(dict.read(&mut out), 6);
        assert_eq!(&out, b"keepme");
    }

    #[test]
    fn test_ring_wraparound() {
        let mut dict = DecoderDict::new(4096);
        let mut out = vec![0u8; 4096];
        // Fill and drain the window several times over.
        for round in 0u8..4 {
            let chunk = vec![round; 4096];
            assert_eq!(dict.write(&chunk), 4096);
            assert_eq!(dict.available(), 0);
            assert_eq!(dict.read(&mut out), 4096);
            assert_eq!(out, chunk);
        }
        assert_eq!(dict.position(), 4 * 4096);
        assert_eq!(dict.window_len(), 4096);
    }

    #[test]
    fn test_min_size_rounding() {
        let dict = DecoderDict::new(16);
        assert_eq!(dict.available(), MIN_DICT_SIZE as usize);
    }
}

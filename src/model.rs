//! LZMA probability models and stream parameters.
//!
//! LZMA uses context-dependent probability models for:
//! - Literal coding (context = previous byte + position)
//! - Match length coding
//! - Distance coding
//! - State machine transitions
//!
//! All cells share the adaptive update rule of the range coder; contexts
//! differ only in which cell is consulted.

use crate::error::{LzmaError, Result};
use crate::range_coder::PROB_INIT;

/// Default literal context bits.
pub const LC_DEFAULT: u32 = 3;

/// Default literal position bits.
pub const LP_DEFAULT: u32 = 0;

/// Default position bits.
pub const PB_DEFAULT: u32 = 2;

/// Maximum number of position states.
pub const POS_STATES_MAX: usize = 1 << 4;

/// Number of states in the LZMA state machine.
pub const NUM_STATES: usize = 12;

/// Number of bits for low length coding.
pub const LEN_LOW_BITS: u32 = 3;
/// Number of bits for mid length coding.
pub const LEN_MID_BITS: u32 = 3;
/// Number of bits for high length coding.
pub const LEN_HIGH_BITS: u32 = 8;

/// Number of low length symbols.
pub const LEN_LOW_SYMBOLS: usize = 1 << LEN_LOW_BITS;
/// Number of mid length symbols.
pub const LEN_MID_SYMBOLS: usize = 1 << LEN_MID_BITS;
/// Number of high length symbols.
pub const LEN_HIGH_SYMBOLS: usize = 1 << LEN_HIGH_BITS;

/// Minimum match length.
pub const MATCH_LEN_MIN: usize = 2;

/// Maximum match length.
pub const MATCH_LEN_MAX: usize = 273;

/// Number of distance slots.
pub const DIST_SLOTS: usize = 64;

/// Number of alignment bits for distance coding.
pub const DIST_ALIGN_BITS: u32 = 4;
/// Size of the alignment table.
pub const DIST_ALIGN_SIZE: usize = 1 << DIST_ALIGN_BITS;

/// Number of full distance symbols covered by the shared cell table.
pub const FULL_DISTANCES: usize = 128;

/// First distance slot coded with direct bits instead of shared cells.
pub const END_POS_MODEL_INDEX: usize = 14;

/// Distance value reserved for the end-of-stream marker.
///
/// A simple match with this distance and length 2 terminates an LZMA stream.
pub const EOS_DISTANCE: u32 = u32::MAX;

/// A single coding step of the operation stream.
///
/// The encoder and decoder both dispatch on this tag; sub-codec selection is
/// purely data-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// A single literal byte.
    Literal(u8),
    /// A back-reference replaying `len` bytes from `distance` bytes back.
    Match {
        /// Real distance in `[1, 2^32 - 1]`; [`EOS_DISTANCE`] is reserved
        /// for the end-of-stream marker.
        distance: u32,
        /// Match length in `[2, 273]`, or 1 for a short rep.
        len: u32,
    },
}

/// LZMA state machine state, an integer in `[0, 12)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State(u8);

impl State {
    /// Initial state.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Get the state value.
    pub fn value(self) -> usize {
        self.0 as usize
    }

    /// Whether the previous operation was a literal.
    pub fn is_literal(self) -> bool {
        self.0 < 7
    }

    /// Update state after a literal.
    pub fn update_literal(&mut self) {
        self.0 = match self.0 {
            0..=3 => 0,
            4..=9 => self.0 - 3,
            _ => self.0 - 6,
        };
    }

    /// Update state after a simple match.
    pub fn update_match(&mut self) {
        self.0 = if self.0 < 7 { 7 } else { 10 };
    }

    /// Update state after a rep match.
    pub fn update_rep(&mut self) {
        self.0 = if self.0 < 7 { 8 } else { 11 };
    }

    /// Update state after a short rep.
    pub fn update_short_rep(&mut self) {
        self.0 = if self.0 < 7 { 9 } else { 11 };
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// LZMA properties (LC, LP, PB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Properties {
    /// Literal context bits, `0..=8`.
    pub lc: u32,
    /// Literal position bits, `0..=4`.
    pub lp: u32,
    /// Position bits, `0..=4`.
    pub pb: u32,
}

impl Properties {
    /// Create new properties. Call [`Properties::verify`] to validate.
    pub fn new(lc: u32, lp: u32, pb: u32) -> Self {
        Self { lc, lp, pb }
    }

    /// Parse from a properties byte. Bytes above 224 are invalid.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let pb = byte as u32 / 45;
        let remaining = byte as u32 - pb * 45;
        let lp = remaining / 9;
        let lc = remaining - lp * 9;

        let props = Self { lc, lp, pb };
        props.verify().ok()?;
        Some(props)
    }

    /// Encode to a properties byte.
    pub fn to_byte(self) -> u8 {
        ((self.pb * 45) + (self.lp * 9) + self.lc) as u8
    }

    /// Check the field ranges and the `LC + LP <= 4` invariant.
    pub fn verify(self) -> Result<()> {
        if self.lc > 8 {
            return Err(LzmaError::invalid_header("LC out of range 0..8"));
        }
        if self.lp > 4 {
            return Err(LzmaError::invalid_header("LP out of range 0..4"));
        }
        if self.pb > 4 {
            return Err(LzmaError::invalid_header("PB out of range 0..4"));
        }
        if self.lc + self.lp > 4 {
            return Err(LzmaError::invalid_header("LC + LP must not exceed 4"));
        }
        Ok(())
    }

    /// Number of literal context tables.
    pub fn num_literal_tables(self) -> usize {
        1 << (self.lc + self.lp)
    }

    /// Number of position states.
    pub fn num_pos_states(self) -> usize {
        1 << self.pb
    }
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            lc: LC_DEFAULT,
            lp: LP_DEFAULT,
            pb: PB_DEFAULT,
        }
    }
}

/// Length coding model.
///
/// A choice tree selects one of three ranges: a 3-bit value at offset 0, a
/// 3-bit value at offset 8, or an 8-bit value at offset 16. Low and mid
/// trees are instantiated per position state.
#[derive(Debug, Clone)]
pub struct LengthModel {
    /// Choice bit (low vs mid+high).
    pub choice: u16,
    /// Choice2 bit (mid vs high).
    pub choice2: u16,
    /// Low length probabilities, per position state.
    pub low: Vec<[u16; LEN_LOW_SYMBOLS]>,
    /// Mid length probabilities, per position state.
    pub mid: Vec<[u16; LEN_MID_SYMBOLS]>,
    /// High length probabilities, shared across position states.
    pub high: [u16; LEN_HIGH_SYMBOLS],
}

impl LengthModel {
    /// Create a new length model.
    pub fn new(num_pos_states: usize) -> Self {
        Self {
            choice: PROB_INIT,
            choice2: PROB_INIT,
            low: vec![[PROB_INIT; LEN_LOW_SYMBOLS]; num_pos_states],
            mid: vec![[PROB_INIT; LEN_MID_SYMBOLS]; num_pos_states],
            high: [PROB_INIT; LEN_HIGH_SYMBOLS],
        }
    }

    /// Reset all cells to the initial probability.
    pub fn reset(&mut self) {
        self.choice = PROB_INIT;
        self.choice2 = PROB_INIT;
        for arr in &mut self.low {
            arr.fill(PROB_INIT);
        }
        for arr in &mut self.mid {
            arr.fill(PROB_INIT);
        }
        self.high.fill(PROB_INIT);
    }
}

/// Literal coding model.
///
/// Holds `1 << (LC + LP)` independent tables of 0x300 cells: 0x100 for the
/// plain binary tree plus two banks used after a match, where the matched
/// byte masks the descent.
#[derive(Debug, Clone)]
pub struct LiteralModel {
    /// Probability tables, one per literal context.
    pub probs: Vec<[u16; 0x300]>,
}

impl LiteralModel {
    /// Create a new literal model.
    pub fn new(num_tables: usize) -> Self {
        Self {
            probs: vec![[PROB_INIT; 0x300]; num_tables],
        }
    }

    /// Reset all cells to the initial probability.
    pub fn reset(&mut self) {
        for table in &mut self.probs {
            table.fill(PROB_INIT);
        }
    }

    /// Select the table index for a position and previous byte.
    #[inline]
    pub fn table_index(&self, pos: u64, prev_byte: u8, lc: u32, lp: u32) -> usize {
        let lit_pos = pos & ((1 << lp) - 1);
        let prev_bits = (prev_byte as usize) >> (8 - lc as usize);
        ((lit_pos as usize) << lc as usize) + prev_bits
    }
}

/// Distance coding model.
#[derive(Debug, Clone)]
pub struct DistanceModel {
    /// Distance slot trees, one per length category `min(len - 2, 3)`.
    pub slot: [[u16; DIST_SLOTS]; 4],
    /// Shared cells for slots 4..14, flat indexed.
    pub special: [u16; FULL_DISTANCES - END_POS_MODEL_INDEX],
    /// Alignment tree for slots >= 14.
    pub align: [u16; DIST_ALIGN_SIZE],
}

impl DistanceModel {
    /// Create a new distance model.
    pub fn new() -> Self {
        Self {
            slot: [[PROB_INIT; DIST_SLOTS]; 4],
            special: [PROB_INIT; FULL_DISTANCES - END_POS_MODEL_INDEX],
            align: [PROB_INIT; DIST_ALIGN_SIZE],
        }
    }

    /// Reset all cells to the initial probability.
    pub fn reset(&mut self) {
        for s in &mut self.slot {
            s.fill(PROB_INIT);
        }
        self.special.fill(PROB_INIT);
        self.align.fill(PROB_INIT);
    }
}

impl Default for DistanceModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete LZMA probability model.
#[derive(Debug, Clone)]
pub struct LzmaModel {
    /// The properties the model was built for.
    pub props: Properties,

    /// Literal-vs-match decision, per `(state, pos_state)`.
    pub is_match: [[u16; POS_STATES_MAX]; NUM_STATES],
    /// Simple-vs-rep match decision, per state.
    pub is_rep: [u16; NUM_STATES],
    /// Rep0-vs-other decision, per state.
    pub is_rep0: [u16; NUM_STATES],
    /// Rep1-vs-rep2/3 decision, per state.
    pub is_rep1: [u16; NUM_STATES],
    /// Rep2-vs-rep3 decision, per state.
    pub is_rep2: [u16; NUM_STATES],
    /// Short-rep decision, per `(state, pos_state)`.
    pub is_rep0_long: [[u16; POS_STATES_MAX]; NUM_STATES],

    /// Simple match length model.
    pub match_len: LengthModel,
    /// Rep match length model.
    pub rep_len: LengthModel,

    /// Literal model.
    pub literal: LiteralModel,

    /// Distance model.
    pub distance: DistanceModel,
}

impl LzmaModel {
    /// Create a new model for the given properties.
    pub fn new(props: Properties) -> Self {
        let num_pos_states = props.num_pos_states();
        let num_tables = props.num_literal_tables();

        Self {
            props,
            is_match: [[PROB_INIT; POS_STATES_MAX]; NUM_STATES],
            is_rep: [PROB_INIT; NUM_STATES],
            is_rep0: [PROB_INIT; NUM_STATES],
            is_rep1: [PROB_INIT; NUM_STATES],
            is_rep2: [PROB_INIT; NUM_STATES],
            is_rep0_long: [[PROB_INIT; POS_STATES_MAX]; NUM_STATES],
            match_len: LengthModel::new(num_pos_states),
            rep_len: LengthModel::new(num_pos_states),
            literal: LiteralModel::new(num_tables),
            distance: DistanceModel::new(),
        }
    }

    /// Reset all probabilities to their initial values.
    pub fn reset(&mut self) {
        for state in &mut self.is_match {
            state.fill(PROB_INIT);
        }
        self.is_rep.fill(PROB_INIT);
        self.is_rep0.fill(PROB_INIT);
        self.is_rep1.fill(PROB_INIT);
        self.is_rep2.fill(PROB_INIT);
        for state in &mut self.is_rep0_long {
            state.fill(PROB_INIT);
        }
        self.match_len.reset();
        self.rep_len.reset();
        self.literal.reset();
        self.distance.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let mut state = State::new();
        assert!(state.is_literal());

        state.update_match();
        assert_eq!(state.value(), 7);
        assert!(!state.is_literal());

        state.update_literal();
        assert_eq!(state.value(), 4);

        state.update_rep();
        assert_eq!(state.value(), 8);

        state.update_short_rep();
        assert_eq!(state.value(), 11);

        state.update_literal();
        assert_eq!(state.value(), 5);
        state.update_literal();
        assert_eq!(state.value(), 2);
        state.update_literal();
        assert_eq!(state.value(), 0);
    }

    #[test]
    fn test_properties_roundtrip() {
        let props = Properties::new(3, 0, 2);
        let byte = props.to_byte();
        assert_eq!(byte, 0x5D);
        let decoded = Properties::from_byte(byte).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn test_properties_invalid_byte() {
        assert!(Properties::from_byte(225).is_none());
        assert!(Properties::from_byte(255).is_none());
    }

    #[test]
    fn test_properties_lc_lp_sum() {
        assert!(Properties::new(4, 1, 2).verify().is_err());
        assert!(Properties::new(4, 0, 2).verify().is_ok());
        // (PB*5 + LP)*9 + LC with LC=8, LP=4 is a valid byte but an
        // invalid combination.
        assert!(Properties::from_byte(44).is_none());
    }

    #[test]
    fn test_model_creation() {
        let model = LzmaModel::new(Properties::default());
        assert_eq!(model.literal.probs.len(), 8);
        assert_eq!(model.match_len.low.len(), 4);
        assert_eq!(model.is_match.len(), NUM_STATES);
    }

    #[test]
    fn test_literal_table_index() {
        let model = LiteralModel::new(16);
        // LC=2, LP=2: two position bits shifted over two context bits.
        assert_eq!(model.table_index(0, 0x00, 2, 2), 0);
        assert_eq!(model.table_index(1, 0x00, 2, 2), 4);
        assert_eq!(model.table_index(1, 0xFF, 2, 2), 7);
    }
}

//! Exponent bits from square / multiply / reduce hit sequences.
//!
//! Square-and-multiply runs square, reduce for every bit and adds multiply,
//! reduce for a one. A square hit opens a bit window; a multiply hit within
//! the lookahead makes it a one. Best effort: no error correction, a missed
//! or spurious hit becomes a wrong or missing bit.

use crate::config::DecoderConfig;
use crate::TraceError;
use cache_side_channel::time_series::TraceStore;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One decoded bit and the rounds it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitSymbol {
    pub position: usize,
    pub value: bool,
    /// From the square hit to the end of the last reduce slot, clamped to the
    /// capture.
    pub rounds: Range<u64>,
    /// A reduce hit was seen after the square (and after the multiply for a one).
    pub reduce_seen: bool,
}

enum Step {
    Advance,
    Bit {
        value: bool,
        next: usize,
        reduce_seen: bool,
    },
    Incomplete,
}

#[derive(Debug, Clone)]
pub struct PatternDecoder {
    config: DecoderConfig,
}

impl PatternDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        PatternDecoder { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    // `at_end`: no more rounds will come, decide with what is there.
    fn step(&self, s: &[bool], m: &[bool], r: &[bool], i: usize, at_end: bool) -> Step {
        let n = s.len();
        if !s[i] {
            return Step::Advance;
        }
        let horizon = i + 1 + self.config.lookahead;
        let mut multiply = None;
        let mut next_square = None;
        for j in i + 1..horizon.min(n) {
            // next window already started
            if s[j] {
                next_square = Some(j);
                break;
            }
            if m[j] {
                multiply = Some(j);
                break;
            }
        }
        let decided = multiply.is_some() || next_square.is_some();
        if !decided && horizon > n && !at_end {
            return Step::Incomplete;
        }
        let next = match multiply {
            Some(j) => j + 2,
            None => next_square.map_or(i + 2, |j| j.min(i + 2)),
        };
        if next > n && !at_end {
            return Step::Incomplete;
        }
        let end = next.min(n);
        let reduce_in = |range: Range<usize>| r[range].iter().any(|&hit| hit);
        let reduce_seen = match multiply {
            Some(j) => reduce_in(i + 1..j) && reduce_in(j + 1..end),
            None => reduce_in(i + 1..end),
        };
        Step::Bit {
            value: multiply.is_some(),
            next,
            reduce_seen,
        }
    }

    /// Decodes aligned hit sequences whose first element is round
    /// `first_round`. Extra rounds of a longer sequence are ignored.
    pub fn decode(
        &self,
        square: &[bool],
        multiply: &[bool],
        reduce: &[bool],
        first_round: u64,
    ) -> Vec<BitSymbol> {
        let mut decoder = self.incremental(first_round);
        decoder.extend(square, multiply, reduce);
        decoder.finish()
    }

    pub fn decode_store(&self, store: &TraceStore) -> Result<Vec<BitSymbol>, TraceError> {
        let hits = |name: &String| {
            store
                .hit_sequence(name)
                .ok_or_else(|| TraceError::MissingTarget(name.clone()))
        };
        let square = hits(&self.config.square)?;
        let multiply = hits(&self.config.multiply)?;
        let reduce = hits(&self.config.reduce)?;
        Ok(self.decode(&square, &multiply, &reduce, store.first_round()))
    }

    pub fn incremental(&self, first_round: u64) -> IncrementalDecoder {
        IncrementalDecoder {
            decoder: self.clone(),
            first_round,
            square: Vec::new(),
            multiply: Vec::new(),
            reduce: Vec::new(),
            position: 0,
            bits: Vec::new(),
        }
    }
}

/// Decodes while rounds come in. A window is decided once its whole
/// lookahead is available (or cut short by a hit), so the result after
/// `finish` is the same as decoding the whole sequence at once.
#[derive(Debug, Clone)]
pub struct IncrementalDecoder {
    decoder: PatternDecoder,
    first_round: u64,
    square: Vec<bool>,
    multiply: Vec<bool>,
    reduce: Vec<bool>,
    position: usize,
    bits: Vec<BitSymbol>,
}

impl IncrementalDecoder {
    /// Appends one round and returns the bits it completed.
    pub fn push(&mut self, square: bool, multiply: bool, reduce: bool) -> &[BitSymbol] {
        self.extend(&[square], &[multiply], &[reduce])
    }

    pub fn extend(&mut self, square: &[bool], multiply: &[bool], reduce: &[bool]) -> &[BitSymbol] {
        let n = square.len().min(multiply.len()).min(reduce.len());
        self.square.extend_from_slice(&square[..n]);
        self.multiply.extend_from_slice(&multiply[..n]);
        self.reduce.extend_from_slice(&reduce[..n]);
        self.run(false)
    }

    pub fn bits(&self) -> &[BitSymbol] {
        &self.bits
    }

    /// Decodes the remaining windows with whatever lookahead is left.
    pub fn finish(mut self) -> Vec<BitSymbol> {
        self.run(true);
        self.bits
    }

    fn run(&mut self, at_end: bool) -> &[BitSymbol] {
        let before = self.bits.len();
        while self.position < self.square.len() {
            let i = self.position;
            match self
                .decoder
                .step(&self.square, &self.multiply, &self.reduce, i, at_end)
            {
                Step::Advance => self.position += 1,
                Step::Incomplete => break,
                Step::Bit {
                    value,
                    next,
                    reduce_seen,
                } => {
                    let end = next.min(self.square.len());
                    self.bits.push(BitSymbol {
                        position: self.bits.len(),
                        value,
                        rounds: self.first_round + i as u64..self.first_round + end as u64,
                        reduce_seen,
                    });
                    self.position = next;
                }
            }
        }
        &self.bits[before..]
    }
}

pub fn bits_to_string(bits: &[BitSymbol]) -> String {
    bits.iter().map(|b| if b.value { '1' } else { '0' }).collect()
}

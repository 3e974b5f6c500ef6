//! Tag-to-reader line codes: FM0 and Miller-modulated subcarrier
//!
//! Replies are handled as sequences of half-symbol baseband levels (+1/-1).
//! Each symbol spans `cycles_per_symbol()` link-frequency cycles; Miller
//! symbols are additionally multiplied by a square subcarrier with one period
//! per cycle. The decoder works on the same representation: per-symbol sums
//! of the two halves, after removing the subcarrier.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineCode {
    /// FM0 baseband: inversion at every symbol boundary, extra mid-symbol
    /// inversion for data-0.
    Fm0,
    /// Miller with M = 2, 4 or 8 subcarrier cycles per symbol: mid-symbol
    /// inversion for data-1, boundary inversion between two data-0.
    Miller(u8),
}

impl LineCode {
    pub fn is_valid(self) -> bool {
        match self {
            LineCode::Fm0 => true,
            LineCode::Miller(m) => matches!(m, 2 | 4 | 8),
        }
    }

    pub fn cycles_per_symbol(self) -> usize {
        match self {
            LineCode::Fm0 => 1,
            LineCode::Miller(m) => usize::from(m),
        }
    }

    /// Query `M` field
    pub fn miller_field(self) -> u32 {
        match self {
            LineCode::Fm0 => 0b00,
            LineCode::Miller(2) => 0b01,
            LineCode::Miller(4) => 0b10,
            LineCode::Miller(_) => 0b11,
        }
    }

    /// Standard preamble as half-symbol levels.
    ///
    /// FM0 is `1 0 1 0 v 1` (v = violation), Miller is a run of unmodulated
    /// subcarrier followed by `010111`. `trext` selects the long pilot.
    pub fn default_preamble(self, trext: bool) -> Vec<i8> {
        match self {
            LineCode::Fm0 => {
                let mut halves = Vec::new();
                if trext {
                    for _ in 0..12 {
                        halves.extend([1, -1]);
                    }
                }
                halves.extend([1, 1, -1, 1, -1, -1, 1, -1, -1, -1, 1, 1]);
                halves
            }
            LineCode::Miller(_) => {
                let pilot = if trext { 16 } else { 4 };
                let mut halves = vec![1; pilot * 2];
                let mut encoder = Encoder::new(self, 1);
                for bit in [false, true, false, true, true, true] {
                    halves.extend(encoder.symbol(bit));
                }
                halves
            }
        }
    }

    /// Half-symbol levels of a full reply: preamble, data, trailing dummy 1.
    pub fn encode(self, preamble: &[i8], bits: &[bool]) -> Vec<i8> {
        let last = preamble.last().copied().unwrap_or(1);
        let mut encoder = Encoder::new(self, last);
        let mut halves = preamble.to_vec();
        for &bit in bits.iter().chain(std::iter::once(&true)) {
            halves.extend(encoder.symbol(bit));
        }
        halves
    }

    /// Square subcarrier value at `offset` samples into a symbol.
    #[inline]
    pub fn subcarrier(self, offset: usize, samples_per_cycle: usize) -> f32 {
        match self {
            LineCode::Fm0 => 1.0,
            LineCode::Miller(_) => {
                if offset % samples_per_cycle < samples_per_cycle / 2 {
                    1.0
                } else {
                    -1.0
                }
            }
        }
    }

    /// Expand half-symbol levels into real baseband samples.
    pub fn to_samples(self, halves: &[i8], samples_per_cycle: usize) -> Vec<f32> {
        let symbol_len = samples_per_cycle * self.cycles_per_symbol();
        let half_len = symbol_len / 2;
        let mut samples = Vec::with_capacity(halves.len() * half_len);
        for (h, &level) in halves.iter().enumerate() {
            let first_offset = (h % 2) * half_len;
            samples.extend(
                (first_offset..first_offset + half_len)
                    .map(|n| f32::from(level) * self.subcarrier(n, samples_per_cycle)),
            );
        }
        samples
    }

    /// Decide one symbol from the sums over its two halves.
    ///
    /// Returns the bit and a confidence in 0..=1: 1 when the halves are
    /// exactly equal or exactly opposite, 0 when they cannot be told apart.
    pub fn decide(self, first: f32, second: f32) -> (bool, f32) {
        let same = (first + second).abs();
        let opposite = (first - second).abs();
        let total = first.abs() + second.abs();
        let confidence = if total > 0.0 {
            ((same - opposite).abs() / total).min(1.0)
        } else {
            0.0
        };
        let halves_agree = same > opposite;
        let bit = match self {
            LineCode::Fm0 => halves_agree,
            LineCode::Miller(_) => !halves_agree,
        };
        (bit, confidence)
    }
}

impl fmt::Display for LineCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LineCode::Fm0 => write!(f, "FM0"),
            LineCode::Miller(m) => write!(f, "Miller-{}", m),
        }
    }
}

/// Stateful symbol encoder, used for preambles and synthesised replies.
struct Encoder {
    line_code: LineCode,
    level: i8,
    previous_zero: bool,
}

impl Encoder {
    fn new(line_code: LineCode, last_level: i8) -> Self {
        Self {
            line_code,
            level: if last_level < 0 { -1 } else { 1 },
            previous_zero: false,
        }
    }

    fn symbol(&mut self, bit: bool) -> [i8; 2] {
        let halves = match self.line_code {
            LineCode::Fm0 => {
                let start = -self.level;
                if bit { [start, start] } else { [start, -start] }
            }
            LineCode::Miller(_) => {
                let start = if !bit && self.previous_zero {
                    -self.level
                } else {
                    self.level
                };
                if bit { [start, -start] } else { [start, start] }
            }
        };
        self.level = halves[1];
        self.previous_zero = !bit;
        halves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fm0_inverts_at_every_boundary() {
        let preamble = LineCode::Fm0.default_preamble(false);
        let halves = LineCode::Fm0.encode(&preamble, &[true, false, false, true]);
        let data = &halves[preamble.len()..];
        assert_eq!(data.len(), 10);
        for s in 0..5 {
            let previous = if s == 0 { preamble[preamble.len() - 1] } else { data[2 * s - 1] };
            assert_eq!(data[2 * s], -previous);
        }
        assert_eq!(&data[..4], &[-1, -1, 1, -1]);
    }

    #[test]
    fn miller_inverts_between_zeros_only() {
        let code = LineCode::Miller(4);
        let halves = code.encode(&[1, 1], &[false, false, true, false]);
        assert_eq!(&halves[2..4], &[1, 1]);
        assert_eq!(&halves[4..6], &[-1, -1]);
        assert_eq!(&halves[6..8], &[-1, 1]);
        assert_eq!(&halves[8..10], &[1, 1]);
    }

    #[test]
    fn decisions_follow_the_line_code() {
        assert_eq!(LineCode::Fm0.decide(5.0, 5.0), (true, 1.0));
        assert_eq!(LineCode::Fm0.decide(5.0, -5.0), (false, 1.0));
        assert_eq!(LineCode::Miller(2).decide(-5.0, 5.0), (true, 1.0));
        let (_, weak) = LineCode::Fm0.decide(5.0, 0.0);
        assert_eq!(weak, 0.0);
    }

    #[test]
    fn miller_samples_carry_the_subcarrier() {
        let code = LineCode::Miller(2);
        let samples = code.to_samples(&[1, 1], 4);
        assert_eq!(samples, vec![1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0]);
    }

    #[test]
    fn preamble_lengths() {
        assert_eq!(LineCode::Fm0.default_preamble(false).len(), 12);
        assert_eq!(LineCode::Fm0.default_preamble(true).len(), 36);
        assert_eq!(LineCode::Miller(4).default_preamble(false).len(), 20);
        assert!(!LineCode::Miller(3).is_valid());
    }
}

//! Pulse-interval encoding of reader commands
//!
//! Every symbol is carrier-on followed by a fixed-width low pulse; data-0
//! lasts one Tari, data-1 two. A command opens with a delimiter, data-0 and
//! RTcal, plus TRcal for Query.

use super::command::Command;

/// Delimiter length in microseconds
pub const DELIMITER_US: f64 = 12.5;

/// PIE symbol lengths in transmit (DAC) samples
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PieTiming {
    pub delimiter: usize,
    pub tari: usize,
    pub pulse_width: usize,
    pub rtcal: usize,
    pub trcal: usize,
    /// Carrier-on level
    pub amplitude: f32,
}

impl PieTiming {
    pub fn data_len(&self, bit: bool) -> usize {
        if bit { 2 * self.tari } else { self.tari }
    }

    fn preamble_len(&self, command: &Command) -> usize {
        let trcal = if command.needs_trcal() { self.trcal } else { 0 };
        self.delimiter + self.tari + self.rtcal + trcal
    }

    /// Waveform length of `command` without any trailing carrier
    pub fn command_len(&self, command: &Command) -> usize {
        self.preamble_len(command)
            + command.bits().iter().map(|&b| self.data_len(b)).sum::<usize>()
    }

    pub fn modulate(&self, command: &Command) -> Vec<f32> {
        let bits = command.bits();
        let mut wave = Vec::with_capacity(self.command_len(command));

        wave.resize(self.delimiter, 0.0);
        self.push_symbol(&mut wave, self.tari);
        self.push_symbol(&mut wave, self.rtcal);
        if command.needs_trcal() {
            self.push_symbol(&mut wave, self.trcal);
        }
        for bit in bits {
            self.push_symbol(&mut wave, self.data_len(bit));
        }
        wave
    }

    fn push_symbol(&self, wave: &mut Vec<f32>, len: usize) {
        let high = len.saturating_sub(self.pulse_width);
        wave.extend(std::iter::repeat_n(self.amplitude, high));
        wave.extend(std::iter::repeat_n(0.0, len - high));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::{DivideRatio, Select, Session, Target};
    use crate::protocol::line_code::LineCode;

    fn timing() -> PieTiming {
        PieTiming {
            delimiter: 13,
            tari: 25,
            pulse_width: 12,
            rtcal: 75,
            trcal: 200,
            amplitude: 0.5,
        }
    }

    fn rising_edges(wave: &[f32]) -> Vec<usize> {
        (1..wave.len()).filter(|&i| wave[i - 1] == 0.0 && wave[i] > 0.0).collect()
    }

    #[test]
    fn query_symbol_intervals() {
        let pie = timing();
        let query = Command::Query {
            divide_ratio: DivideRatio::Dr8,
            line_code: LineCode::Fm0,
            trext: false,
            select: Select::All,
            session: Session::S0,
            target: Target::A,
            q: 0,
        };
        let mut wave = pie.modulate(&query);
        assert_eq!(wave.len(), pie.command_len(&query));
        assert!(wave[..13].iter().all(|&s| s == 0.0));

        wave.push(pie.amplitude);
        let edges = rising_edges(&wave);
        assert_eq!(edges[0], 13);
        let intervals: Vec<usize> = edges.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(&intervals[..3], &[25, 75, 200]);
        let expected: Vec<usize> = query.bits().iter().map(|&b| pie.data_len(b)).collect();
        assert_eq!(&intervals[3..], expected.as_slice());
    }

    #[test]
    fn ack_has_no_trcal() {
        let pie = timing();
        let ack = Command::Ack { rn16: 0 };
        // 01 followed by sixteen zeros: 17 data-0 and one data-1
        assert_eq!(pie.command_len(&ack), 13 + 25 + 75 + 17 * 25 + 50);
        let wave = pie.modulate(&ack);
        assert_eq!(wave.last().copied(), Some(0.0));
        assert_eq!(wave.iter().filter(|&&s| s == 0.5).count(), wave.len() - 13 - 20 * 12);
    }
}

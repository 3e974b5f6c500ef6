//! Tag reply decoder
//!
//! Each burst from the gate is matched against the reader's receive windows
//! and, when one is open, demodulated as the frame kind the reader expects:
//!
//! 1. optional DC removal (burst mean)
//! 2. normalised complex correlation of the preamble template over the first
//!    `search_len` offsets; the best offset gives frame timing, the phase of
//!    the correlation gives the carrier phase
//! 3. derotation, subcarrier removal (Miller) and a decision per symbol from
//!    the sums over its two halves
//! 4. CRC-16 over the frame bits
//!
//! Expectations arrive from the reader on a feedback input. A burst that finds
//! no expectation yet is held back and a watermark at its start is emitted
//! instead, so the reader can close earlier windows before it answers with the
//! next expectation. Without a feedback connection every burst is decoded as
//! `FrameKind::Unknown`.

use num_complex::Complex32;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info, trace};

use super::gate::GateEvent;
use crate::config::{Config, Derived};
use crate::protocol::crc::crc16_check;
use crate::protocol::{Burst, DecodedFrame, FrameKind, LineCode};
use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkError, WorkResult};
use crate::runtime::{PortSchema, Sender};

/// Receive-sample interval `[start, end)` in which a reply may begin
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiveWindow {
    pub start: u64,
    pub end: u64,
}

impl ReceiveWindow {
    pub fn contains(&self, index: u64) -> bool {
        (self.start..self.end).contains(&index)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// What the reader is listening for, and when
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expectation {
    pub kind: FrameKind,
    pub window: ReceiveWindow,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeFailure {
    #[error("no receive window is open")]
    NoExpectation,

    #[error("burst starts outside the receive window")]
    OutsideWindow,

    #[error("preamble correlation {peak:.3} below threshold")]
    SyncFailure { peak: f32 },

    #[error("burst ends after {available} of {expected} symbols")]
    PrematureEnd { available: usize, expected: usize },

    #[error("burst holds {available} symbols, expected {expected}")]
    FrameLengthMismatch { available: usize, expected: usize },
}

#[derive(Clone, Debug)]
pub enum DecoderEvent {
    Frame(DecodedFrame),
    /// A burst that produced no frame
    Miss { start_index: u64, failure: DecodeFailure },
    /// Every burst starting before this index has been reported
    Watermark(u64),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    pub crc_failures: u64,
    pub misses: u64,
}

/// Samples of a reply carrying `bits` (CRC included): preamble, data and the
/// dummy 1, scaled by `amplitude` and rotated by `phase`.
pub fn synthesize_reply(
    derived: &Derived,
    line_code: LineCode,
    bits: &[bool],
    amplitude: f32,
    phase: f32,
) -> Vec<Complex32> {
    let halves = line_code.encode(&derived.preamble, bits);
    let carrier = Complex32::from_polar(amplitude, phase);
    line_code
        .to_samples(&halves, derived.samples_per_cycle)
        .into_iter()
        .map(|level| carrier * level)
        .collect()
}

pub struct TagDecoder {
    name: String,
    line_code: LineCode,
    samples_per_cycle: usize,
    symbol_len: usize,
    half_len: usize,
    template: Vec<f32>,
    template_energy: f32,
    threshold: f32,
    search_len: usize,
    tolerance: usize,
    remove_dc: bool,
    rn16_has_crc: bool,
    derived: Derived,

    expectations: VecDeque<Expectation>,
    last_watermark: u64,
    stats: DecoderStats,

    event_buffer: VecDeque<GateEvent>,
    expectation_buffer: VecDeque<Expectation>,
}

impl TagDecoder {
    pub fn new(config: &Config) -> crate::Result<Self> {
        let derived = config.derived()?;
        let line_code = config.link().line_code;
        let template = line_code.to_samples(&derived.preamble, derived.samples_per_cycle);
        let template_energy = template.iter().map(|t| t * t).sum();
        Ok(Self {
            name: "decoder".to_string(),
            line_code,
            samples_per_cycle: derived.samples_per_cycle,
            symbol_len: derived.symbol_len,
            half_len: derived.half_symbol_len,
            template,
            template_energy,
            threshold: config.decoder().correlation_threshold,
            search_len: derived.search_len,
            tolerance: config.decoder().length_tolerance_symbols,
            remove_dc: config.decoder().remove_dc,
            rn16_has_crc: config.link().rn16_has_crc,
            derived: derived.clone(),
            expectations: VecDeque::new(),
            last_watermark: 0,
            stats: DecoderStats::default(),
            event_buffer: VecDeque::new(),
            expectation_buffer: VecDeque::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Best preamble offset within the search range, with its normalised
    /// correlation magnitude and the raw correlation value.
    fn synchronise(&self, samples: &[Complex32]) -> Option<(usize, f32, Complex32)> {
        let len = self.template.len();
        let last = samples.len().checked_sub(len)?.min(self.search_len);
        let mut best: Option<(usize, f32, Complex32)> = None;
        for offset in 0..=last {
            let window = &samples[offset..offset + len];
            let mut correlation = Complex32::new(0.0, 0.0);
            let mut energy = 0.0f32;
            for (x, &t) in window.iter().zip(&self.template) {
                correlation += *x * t;
                energy += x.norm_sqr();
            }
            let norm = (energy * self.template_energy).sqrt();
            let peak = if norm > 0.0 { correlation.norm() / norm } else { 0.0 };
            if best.is_none_or(|(_, p, _)| peak > p) {
                best = Some((offset, peak, correlation));
            }
        }
        best
    }

    /// Demodulate `burst` as a frame of `kind`.
    pub fn decode(&self, burst: &Burst, kind: FrameKind) -> Result<DecodedFrame, DecodeFailure> {
        let mut samples = burst.samples.to_vec();
        if self.remove_dc && !samples.is_empty() {
            let mean = samples.iter().sum::<Complex32>() / samples.len() as f32;
            samples.iter_mut().for_each(|s| *s -= mean);
        }

        let preamble_symbols = self.template.len() / self.symbol_len;
        let Some((offset, peak, correlation)) = self.synchronise(&samples) else {
            return Err(DecodeFailure::PrematureEnd {
                available: samples.len() / self.symbol_len,
                expected: preamble_symbols + self.derived.frame_bits(kind).unwrap_or(1),
            });
        };
        if peak < self.threshold {
            return Err(DecodeFailure::SyncFailure { peak });
        }

        let phase = correlation.arg();
        let derotate = Complex32::from_polar(1.0, -phase);
        let data_start = offset + self.template.len();
        let available = (samples.len() - data_start) / self.symbol_len;

        let n_bits = match self.derived.frame_bits(kind) {
            Some(expected) => {
                if available < expected {
                    return Err(DecodeFailure::PrematureEnd { available, expected });
                }
                if available > expected + 1 + self.tolerance {
                    return Err(DecodeFailure::FrameLengthMismatch { available, expected });
                }
                expected
            }
            None => match available.checked_sub(1) {
                Some(n) if n > 0 => n,
                _ => return Err(DecodeFailure::PrematureEnd { available, expected: 1 }),
            },
        };

        let mut bits = Vec::with_capacity(n_bits);
        let mut confidence = 0.0f32;
        for symbol in 0..n_bits {
            let base = data_start + symbol * self.symbol_len;
            let mut halves = [0.0f32; 2];
            for n in 0..self.symbol_len {
                let level = (samples[base + n] * derotate).re * self.line_code.subcarrier(n, self.samples_per_cycle);
                halves[n / self.half_len] += level;
            }
            let (bit, c) = self.line_code.decide(halves[0], halves[1]);
            trace!("[{}] symbol {} halves {:?} -> {}", self.name, symbol, halves, u8::from(bit));
            bits.push(bit);
            confidence += c;
        }
        let confidence = confidence / n_bits as f32;

        let (crc_valid, payload_len) = match kind {
            FrameKind::Rn16 if !self.rn16_has_crc => (true, n_bits),
            FrameKind::Rn16 | FrameKind::Epc => (crc16_check(&bits), n_bits - 16),
            FrameKind::Unknown => {
                if crc16_check(&bits) {
                    (true, n_bits - 16)
                } else {
                    (false, n_bits)
                }
            }
        };
        bits.truncate(payload_len);

        Ok(DecodedFrame {
            kind,
            bits,
            crc_valid,
            start_index: burst.start_index,
            confidence,
            phase,
        })
    }

    /// Drop expectations whose window closed before `index`.
    fn expire(&mut self, index: u64) {
        while let Some(front) = self.expectations.front() {
            if front.window.end > index {
                break;
            }
            trace!("[{}] {} window {:?} expired", self.name, front.kind, front.window);
            self.expectations.pop_front();
        }
    }

    fn poll_expectations(&mut self, port: &InputPort, block: bool) -> WorkResult<()> {
        let mut input = port
            .get::<Expectation>(&mut self.expectation_buffer)
            .ok_or_else(|| WorkError::NodeError("Expectations input has the wrong type".into()))?;
        if block {
            let expectation = input.recv()?;
            self.expectations.push_back(expectation);
        }
        while let Some(expectation) = input.try_recv()? {
            self.expectations.push_back(expectation);
        }
        Ok(())
    }

    fn forward_watermark(&mut self, output: &Sender<DecoderEvent>, watermark: u64) -> WorkResult<usize> {
        if watermark <= self.last_watermark {
            return Ok(0);
        }
        self.last_watermark = watermark;
        output.deliver(DecoderEvent::Watermark(watermark))?;
        Ok(1)
    }

    fn report(&mut self, burst: &Burst, result: Result<DecodedFrame, DecodeFailure>) -> DecoderEvent {
        match result {
            Ok(frame) => {
                self.stats.frames += 1;
                if !frame.crc_valid {
                    self.stats.crc_failures += 1;
                }
                debug!(
                    "[{}] {} at {}: {} (crc {}, confidence {:.2})",
                    self.name,
                    frame.kind,
                    frame.start_index,
                    frame.bit_string(),
                    if frame.crc_valid { "ok" } else { "bad" },
                    frame.confidence
                );
                DecoderEvent::Frame(frame)
            }
            Err(failure) => {
                self.stats.misses += 1;
                debug!("[{}] Burst at {}: {}", self.name, burst.start_index, failure);
                DecoderEvent::Miss {
                    start_index: burst.start_index,
                    failure,
                }
            }
        }
    }
}

enum Route {
    Decode(FrameKind),
    Reject(DecodeFailure),
    Wait,
}

impl ProcessNode for TagDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> Vec<PortSchema> {
        vec![
            PortSchema::input::<GateEvent>("events", 0),
            PortSchema::input::<Expectation>("expectations", 1),
        ]
    }

    fn output_schema(&self) -> Vec<PortSchema> {
        vec![
            PortSchema::output::<DecoderEvent>("events", 0),
            PortSchema::output::<Burst>("raw", 1),
        ]
    }

    fn work(&mut self, inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize> {
        let events_out = outputs
            .first()
            .and_then(|p| p.get::<DecoderEvent>())
            .ok_or_else(|| WorkError::NodeError("Missing events output".into()))?;
        let raw_out = outputs.get(1).and_then(|p| p.get::<Burst>());
        let feedback = inputs.get(1).filter(|p| p.is_connected());

        if let Some(port) = feedback {
            self.poll_expectations(port, false)?;
        }

        let event = {
            let mut input = inputs
                .first()
                .and_then(|p| p.get::<GateEvent>(&mut self.event_buffer))
                .ok_or_else(|| WorkError::NodeError("Missing events input".into()))?;
            input.recv()?
        };

        let burst = match event {
            GateEvent::Watermark(watermark) => {
                // no burst can start inside a window that closed before the watermark
                self.expire(watermark);
                return self.forward_watermark(&events_out, watermark);
            }
            GateEvent::Burst(burst) => burst,
        };

        self.expire(burst.start_index);
        let route = match (feedback, self.expectations.front()) {
            (None, _) => Route::Decode(FrameKind::Unknown),
            (Some(_), Some(e)) if e.window.contains(burst.start_index) => Route::Decode(e.kind),
            (Some(_), Some(_)) => Route::Reject(DecodeFailure::OutsideWindow),
            (Some(_), None) => Route::Wait,
        };

        let result = match route {
            Route::Wait => {
                let produced = self.forward_watermark(&events_out, burst.start_index)?;
                let Some(port) = feedback else {
                    return Ok(produced);
                };
                match self.poll_expectations(port, true) {
                    Ok(()) => {
                        self.event_buffer.push_front(GateEvent::Burst(burst));
                        return Ok(produced);
                    }
                    // reader finished: account for the burst, then stop
                    Err(WorkError::Shutdown) => {
                        let event = self.report(&burst, Err(DecodeFailure::NoExpectation));
                        if let Some(raw) = raw_out {
                            raw.deliver(burst)?;
                        }
                        events_out.deliver(event)?;
                        return Err(WorkError::Shutdown);
                    }
                    Err(e) => return Err(e),
                }
            }
            Route::Decode(kind) => self.decode(&burst, kind),
            Route::Reject(failure) => Err(failure),
        };

        let event = self.report(&burst, result);
        if let Some(raw) = raw_out {
            raw.deliver(burst)?;
        }
        events_out.deliver(event)?;
        Ok(1)
    }
}

impl Drop for TagDecoder {
    fn drop(&mut self) {
        info!(
            "[{}] {} frames ({} failed CRC), {} bursts without a frame",
            self.name, self.stats.frames, self.stats.crc_failures, self.stats.misses
        );
    }
}

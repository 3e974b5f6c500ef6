//! Burst gate: isolates reply bursts from the continuous receive stream
//!
//! The gate keeps a running noise floor (exponential average of the sample
//! magnitude, updated only while no burst is open) and two thresholds derived
//! from it. A burst opens on the first sample above `floor * enter_factor` and
//! closes once the magnitude has stayed below `floor * exit_factor` for the
//! dwell length; the dwell itself is not part of the burst. Bursts that reach
//! the maximum length are closed on the spot, bursts shorter than the minimum
//! are dropped and counted.
//!
//! Besides bursts the gate emits watermarks: `Watermark(w)` promises that every
//! burst starting before sample `w` has already been emitted. While a burst is
//! open the watermark is held at its start. Downstream stages use watermarks to
//! learn that a receive window has closed without a reply.

use num_complex::Complex32;
use std::collections::VecDeque;
use tracing::{debug, info, trace};

use crate::config::{Config, GateTiming};
use crate::protocol::Burst;
use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkError, WorkResult};
use crate::runtime::{PortSchema, SampleBlock};

#[derive(Clone, Debug)]
pub enum GateEvent {
    Burst(Burst),
    Watermark(u64),
}

#[derive(Debug)]
enum GateState {
    /// Collecting the first magnitudes to seed the noise floor
    WarmingUp { magnitudes: Vec<f32> },
    Searching,
    Accumulating {
        start: u64,
        samples: Vec<Complex32>,
        below: usize,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateStats {
    pub bursts: u64,
    pub too_short: u64,
    pub forced: u64,
    /// Warm-up samples above the enter threshold; a reply there is lost
    pub masked: u64,
}

pub struct Gate {
    name: String,
    enter_factor: f32,
    exit_factor: f32,
    noise_alpha: f32,
    min_noise_floor: f32,
    noise_window: usize,
    timing: GateTiming,

    noise_floor: f32,
    state: GateState,
    last_watermark: u64,
    stream_end: u64,
    stats: GateStats,

    /// Putback buffer for the sample input, persisted across work() calls.
    input_buffer: VecDeque<SampleBlock>,
}

impl Gate {
    pub fn new(config: &Config) -> crate::Result<Self> {
        let derived = config.derived()?;
        let gate = config.gate();
        Ok(Self {
            name: "gate".to_string(),
            enter_factor: gate.enter_factor,
            exit_factor: gate.exit_factor,
            noise_alpha: gate.noise_alpha,
            min_noise_floor: gate.min_noise_floor,
            noise_window: gate.noise_window,
            timing: derived.gate,
            noise_floor: gate.min_noise_floor,
            state: GateState::WarmingUp {
                magnitudes: Vec::with_capacity(gate.noise_window),
            },
            last_watermark: 0,
            stream_end: 0,
            stats: GateStats::default(),
            input_buffer: VecDeque::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }

    fn floor(&self) -> f32 {
        self.noise_floor.max(self.min_noise_floor)
    }

    /// Run one block through the gate, returning the bursts it completed and,
    /// if it advanced, a trailing watermark.
    pub fn process(&mut self, block: &SampleBlock) -> Vec<GateEvent> {
        let mut events = Vec::new();
        for (index, sample) in block.indexed() {
            if let Some(burst) = self.step(index, sample) {
                events.push(GateEvent::Burst(burst));
            }
        }
        self.stream_end = self.stream_end.max(block.end_index());

        let watermark = match &self.state {
            GateState::Accumulating { start, .. } => *start,
            _ => block.end_index(),
        };
        if watermark > self.last_watermark {
            self.last_watermark = watermark;
            events.push(GateEvent::Watermark(watermark));
        }
        events
    }

    fn step(&mut self, index: u64, sample: Complex32) -> Option<Burst> {
        let magnitude = sample.norm();
        let floor = self.floor();
        let (enter, exit) = (floor * self.enter_factor, floor * self.exit_factor);
        match &mut self.state {
            GateState::WarmingUp { magnitudes } => {
                magnitudes.push(magnitude);
                if magnitudes.len() >= self.noise_window {
                    let sum: f64 = magnitudes.iter().map(|&m| f64::from(m)).sum();
                    self.noise_floor = (sum / magnitudes.len() as f64) as f32;
                    debug!("[{}] Initial noise floor {:.3e}", self.name, self.noise_floor);

                    let enter = self.noise_floor.max(self.min_noise_floor) * self.enter_factor;
                    let masked = magnitudes.iter().filter(|&&m| m > enter).count();
                    if masked > 0 {
                        self.stats.masked += masked as u64;
                        debug!(
                            "[{}] {} samples above threshold before {} went unexamined",
                            self.name, masked, index
                        );
                    }
                    self.state = GateState::Searching;
                }
                None
            }
            GateState::Searching => {
                if magnitude > enter {
                    trace!("[{}] Burst opens at {}", self.name, index);
                    self.state = GateState::Accumulating {
                        start: index,
                        samples: vec![sample],
                        below: 0,
                    };
                } else {
                    self.noise_floor += self.noise_alpha * (magnitude - self.noise_floor);
                }
                None
            }
            GateState::Accumulating { samples, below, .. } => {
                samples.push(sample);
                if magnitude < exit {
                    *below += 1;
                } else {
                    *below = 0;
                }

                if *below >= self.timing.dwell {
                    let keep = samples.len() - *below;
                    samples.truncate(keep);
                    self.close(false)
                } else if samples.len() >= self.timing.max_burst {
                    self.close(true)
                } else {
                    None
                }
            }
        }
    }

    fn close(&mut self, forced: bool) -> Option<Burst> {
        let GateState::Accumulating { start, samples, .. } =
            std::mem::replace(&mut self.state, GateState::Searching)
        else {
            return None;
        };

        if samples.len() < self.timing.min_burst {
            self.stats.too_short += 1;
            debug!(
                "[{}] Burst at {} too short ({} < {} samples), discarded",
                self.name,
                start,
                samples.len(),
                self.timing.min_burst
            );
            return None;
        }

        if forced {
            self.stats.forced += 1;
            debug!("[{}] Burst at {} reached the maximum length", self.name, start);
        }
        self.stats.bursts += 1;
        let burst = Burst::new(start, samples);
        debug!(
            "[{}] Burst {}..{} ({} samples)",
            self.name,
            burst.start_index,
            burst.end_index,
            burst.len()
        );
        Some(burst)
    }

    /// Drop any open burst. Returns a final watermark if one is now due.
    pub fn flush(&mut self) -> Option<GateEvent> {
        if let GateState::Accumulating { start, samples, .. } = &self.state {
            debug!(
                "[{}] Discarding unfinished burst at {} ({} samples)",
                self.name,
                start,
                samples.len()
            );
            self.state = GateState::Searching;
        }
        (self.stream_end > self.last_watermark).then(|| {
            self.last_watermark = self.stream_end;
            GateEvent::Watermark(self.stream_end)
        })
    }
}

impl ProcessNode for Gate {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> Vec<PortSchema> {
        vec![PortSchema::input::<SampleBlock>("samples", 0)]
    }

    fn output_schema(&self) -> Vec<PortSchema> {
        vec![PortSchema::output::<GateEvent>("events", 0)]
    }

    fn work(&mut self, inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize> {
        let output = outputs
            .first()
            .and_then(|p| p.get::<GateEvent>())
            .ok_or_else(|| WorkError::NodeError("Missing events output".into()))?;

        let received = {
            let mut input = inputs
                .first()
                .and_then(|p| p.get::<SampleBlock>(&mut self.input_buffer))
                .ok_or_else(|| WorkError::NodeError("Missing samples input".into()))?;
            input.recv()
        };

        let block = match received {
            Ok(block) => block,
            Err(WorkError::Shutdown) => {
                if let Some(event) = self.flush() {
                    output.deliver(event)?;
                }
                return Err(WorkError::Shutdown);
            }
            Err(e) => return Err(e),
        };

        let events = self.process(&block);
        let produced = events.len();
        for event in events {
            output.deliver(event)?;
        }
        Ok(produced)
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        info!(
            "[{}] {} bursts, {} too short, {} cut at maximum length, {} samples masked by warm-up",
            self.name, self.stats.bursts, self.stats.too_short, self.stats.forced, self.stats.masked
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoderConfig, GateConfig, LinkConfig, RadioConfig};
    use crate::runtime::into_blocks;

    fn config(gate: GateConfig) -> Config {
        Config::new(RadioConfig::default(), LinkConfig::default(), gate, DecoderConfig::default()).unwrap()
    }

    fn noise(len: usize, level: f32) -> Vec<Complex32> {
        (0..len).map(|k| Complex32::from_polar(level, 0.7 * k as f32)).collect()
    }

    /// Noise with a constant-magnitude rectangle of `len` samples at `start`.
    fn rectangle(total: usize, start: usize, len: usize) -> Vec<Complex32> {
        let mut samples = noise(total, 0.01);
        for (k, s) in samples[start..start + len].iter_mut().enumerate() {
            *s = Complex32::from_polar(1.0, 0.3 + 0.01 * k as f32);
        }
        samples
    }

    fn bursts(events: &[GateEvent]) -> Vec<&Burst> {
        events
            .iter()
            .filter_map(|e| match e {
                GateEvent::Burst(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    fn run(gate: &mut Gate, samples: &[Complex32], block_len: usize) -> Vec<GateEvent> {
        into_blocks(samples, block_len, 0)
            .iter()
            .flat_map(|b| gate.process(b))
            .collect()
    }

    #[test]
    fn rectangular_envelope_yields_exact_burst() {
        let mut gate = Gate::new(&config(GateConfig::default())).unwrap();
        let samples = rectangle(3000, 1000, 390);
        let events = run(&mut gate, &samples, 128);
        let found = bursts(&events);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_index, 1000);
        assert_eq!(found[0].end_index, 1390);
        assert_eq!(found[0].len(), 390);
        assert!((gate.noise_floor() - 0.01).abs() < 1e-3);
        assert_eq!(gate.stats().masked, 0);
    }

    #[test]
    fn subthreshold_envelope_emits_nothing() {
        let mut gate = Gate::new(&config(GateConfig::default())).unwrap();
        // twice the noise floor: above the exit factor, below the enter factor
        let mut samples = noise(3000, 0.01);
        for s in &mut samples[1000..2000] {
            *s = Complex32::from_polar(0.02, 0.5);
        }
        let events = run(&mut gate, &samples, 256);
        assert!(bursts(&events).is_empty());
        assert_eq!(gate.stats().too_short, 0);
        assert_eq!(gate.stats().bursts, 0);
        assert!(matches!(events.last(), Some(GateEvent::Watermark(3000))));
    }

    #[test]
    fn activity_during_warm_up_is_counted() {
        let mut gate = Gate::new(&config(GateConfig::default())).unwrap();
        let samples = rectangle(2000, 100, 50);
        let events = run(&mut gate, &samples, 512);
        assert!(bursts(&events).is_empty());
        assert_eq!(gate.stats().masked, 50);
        assert_eq!(gate.stats().too_short, 0);
    }

    #[test]
    fn short_bursts_are_counted_and_dropped() {
        let mut gate = Gate::new(&config(GateConfig::default())).unwrap();
        // minimum is 8 symbols of 10 samples
        let samples = rectangle(2000, 1000, 50);
        let events = run(&mut gate, &samples, 256);
        assert!(bursts(&events).is_empty());
        assert_eq!(gate.stats().too_short, 1);
    }

    #[test]
    fn long_activity_is_cut_at_maximum() {
        let gate_config = GateConfig {
            max_burst_symbols: 140,
            ..GateConfig::default()
        };
        let mut gate = Gate::new(&config(gate_config)).unwrap();
        let samples = rectangle(4000, 500, 2000);
        let events = run(&mut gate, &samples, 4000);
        let found = bursts(&events);
        assert_eq!(found[0].start_index, 500);
        assert_eq!(found[0].len(), 1400);
        assert_eq!(gate.stats().forced, 1);
    }

    #[test]
    fn watermark_is_held_at_open_burst() {
        let mut gate = Gate::new(&config(GateConfig::default())).unwrap();
        let samples = rectangle(2000, 700, 390);
        let blocks = into_blocks(&samples, 800, 0);

        let first = gate.process(&blocks[0]);
        assert!(matches!(first.last(), Some(GateEvent::Watermark(700))));

        let second = gate.process(&blocks[1]);
        assert!(matches!(second[0], GateEvent::Burst(ref b) if b.start_index == 700));
        assert!(matches!(second.last(), Some(GateEvent::Watermark(1600))));
    }

    #[test]
    fn flush_discards_open_burst_and_releases_watermark() {
        let mut gate = Gate::new(&config(GateConfig::default())).unwrap();
        let samples = rectangle(1200, 1000, 200);
        let events = run(&mut gate, &samples, 1200);
        assert!(bursts(&events).is_empty());
        assert!(matches!(events.last(), Some(GateEvent::Watermark(1000))));
        assert!(matches!(gate.flush(), Some(GateEvent::Watermark(1200))));
        assert_eq!(gate.stats().bursts, 0);
    }
}

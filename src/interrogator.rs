//! Static pipeline assembly
//!
//! ```text
//! source ─▶ gate ─▶ decoder ─▶ reader ─▶ tag_log
//!                    ▲   │       │  │
//!                    │   └▶ raw  │  └▶ tx capture
//!                    └───────────┘ expectations
//! ```
//!
//! The receive path and the reader's feedback path are separate channels.
//! The feedback channel is sized so the reader never waits on the decoder.

use std::path::PathBuf;
use tracing::info;

use crate::config::Config;
use crate::nodes::{CaptureSink, Gate, Reader, TagDecoder, TagLog, Transmission};
use crate::protocol::Burst;
use crate::runtime::{Pipeline, ProcessNode, Scheduler};

/// Capacity of the reader → decoder expectation channel
const FEEDBACK_BUFFER_SIZE: usize = 4096;

pub struct Interrogator {
    config: Config,
    raw_capture: Option<PathBuf>,
    tx_capture: Option<PathBuf>,
    csv: Option<PathBuf>,
    max_reads: usize,
    buffer_size: Option<usize>,
}

impl Interrogator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            raw_capture: None,
            tx_capture: None,
            csv: None,
            max_reads: 0,
            buffer_size: None,
        }
    }

    /// Write the samples of every processed burst to `path`.
    pub fn with_raw_capture(mut self, path: impl Into<PathBuf>) -> Self {
        self.raw_capture = Some(path.into());
        self
    }

    /// Write the transmit waveform (DAC rate, I only) to `path`.
    pub fn with_tx_capture(mut self, path: impl Into<PathBuf>) -> Self {
        self.tx_capture = Some(path.into());
        self
    }

    pub fn with_csv(mut self, path: impl Into<PathBuf>) -> Self {
        self.csv = Some(path.into());
        self
    }

    /// Stop the tag log after `max_reads` identities (0 = unlimited).
    pub fn with_max_reads(mut self, max_reads: usize) -> Self {
        self.max_reads = max_reads;
        self
    }

    /// Capacity of the forward channels
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Assemble the pipeline around `source`, which must provide a
    /// `"samples"` output of `SampleBlock`s.
    pub fn pipeline<S: ProcessNode + 'static>(&self, source: S) -> crate::Result<Pipeline> {
        let mut pipeline = Pipeline::new();
        if let Some(size) = self.buffer_size {
            pipeline = pipeline.with_default_buffer_size(size);
        }

        pipeline.add_process("source", source)?;
        pipeline.add_process("gate", Gate::new(&self.config)?)?;
        pipeline.add_process("decoder", TagDecoder::new(&self.config)?)?;
        pipeline.add_process("reader", Reader::new(&self.config)?)?;

        let mut tag_log = TagLog::new().with_max_reads(self.max_reads);
        if let Some(path) = &self.csv {
            info!("Tag CSV: {}", path.display());
            tag_log = tag_log.with_csv(path)?;
        }
        pipeline.add_process("tag_log", tag_log)?;

        pipeline.connect("source", "samples", "gate", "samples")?;
        pipeline.connect("gate", "events", "decoder", "events")?;
        pipeline.connect("decoder", "events", "reader", "events")?;
        pipeline.connect_with_buffer("reader", "expectations", "decoder", "expectations", FEEDBACK_BUFFER_SIZE)?;
        pipeline.connect("reader", "identities", "tag_log", "identities")?;

        if let Some(path) = &self.raw_capture {
            info!("Raw burst capture: {}", path.display());
            pipeline.add_process("raw_capture", CaptureSink::<Burst>::create(path)?.with_name("raw_capture"))?;
            pipeline.connect("decoder", "raw", "raw_capture", "in")?;
        }
        if let Some(path) = &self.tx_capture {
            info!("Transmit capture: {}", path.display());
            pipeline.add_process(
                "tx_capture",
                CaptureSink::<Transmission>::create(path)?.with_name("tx_capture"),
            )?;
            pipeline.connect("reader", "tx", "tx_capture", "in")?;
        }

        Ok(pipeline)
    }

    /// Assemble and start the pipeline.
    pub fn build<S: ProcessNode + 'static>(self, source: S) -> crate::Result<Scheduler> {
        let pipeline = self.pipeline(source)?;
        info!("Starting nodes: {:?}", pipeline.list_nodes());
        Ok(pipeline.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoderConfig, GateConfig, LinkConfig, RadioConfig};
    use crate::nodes::{DecoderEvent, FileSource, ReaderAction, synthesize_reply};
    use crate::protocol::crc::{push_bits, with_crc16};
    use crate::protocol::{DecodedFrame, FrameKind};
    use num_complex::Complex32;
    use std::io::Write;

    fn config() -> Config {
        let link = LinkConfig {
            initial_q: 0,
            max_rounds: Some(1),
            ..LinkConfig::default()
        };
        Config::new(RadioConfig::default(), link, GateConfig::default(), DecoderConfig::default()).unwrap()
    }

    fn window_of(actions: &[ReaderAction]) -> crate::nodes::ReceiveWindow {
        actions
            .iter()
            .find_map(|a| match a {
                ReaderAction::Expect(e) => Some(e.window),
                _ => None,
            })
            .unwrap()
    }

    fn frame(kind: FrameKind, bits: &[bool], start_index: u64) -> DecoderEvent {
        DecoderEvent::Frame(DecodedFrame {
            kind,
            bits: bits.to_vec(),
            crc_valid: true,
            start_index,
            confidence: 1.0,
            phase: 0.0,
        })
    }

    #[test]
    fn singulates_a_tag_replying_in_its_windows() {
        let config = config();
        let derived = config.derived().unwrap().clone();
        let line_code = config.link().line_code;

        let mut rn16 = Vec::new();
        push_bits(&mut rn16, 0x5A3C, 16);
        let mut epc = Vec::new();
        push_bits(&mut epc, 0x3000, 16);
        for word in [0xE280u32, 0x1160, 0x6000, 0x0209, 0x2A3B, 0x4C5D] {
            push_bits(&mut epc, word, 16);
        }

        // where a reader with this configuration listens
        let mut planner = Reader::new(&config).unwrap();
        let rn16_window = window_of(&planner.start(0));
        let rn16_at = rn16_window.start + 20;
        planner.handle(&frame(FrameKind::Rn16, &rn16, rn16_at));
        let epc_window = window_of(&planner.handle(&DecoderEvent::Watermark(rn16_window.end)));
        let epc_at = epc_window.start + 20;

        let total = (epc_window.end + 2_000) as usize;
        let mut samples: Vec<Complex32> = (0..total)
            .map(|k| Complex32::from_polar(0.01, 0.9 * k as f32))
            .collect();
        for (at, bits, phase) in [(rn16_at, with_crc16(&rn16), 0.4), (epc_at, with_crc16(&epc), 0.4)] {
            let reply = synthesize_reply(&derived, line_code, &bits, 1.0, phase);
            samples[at as usize..at as usize + reply.len()].copy_from_slice(&reply);
        }

        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("rx.cf32");
        {
            let mut file = std::fs::File::create(&capture).unwrap();
            for s in &samples {
                file.write_all(&s.re.to_le_bytes()).unwrap();
                file.write_all(&s.im.to_le_bytes()).unwrap();
            }
        }
        let csv = dir.path().join("tags.csv");
        let tx = dir.path().join("tx.cf32");
        let raw = dir.path().join("raw.cf32");

        let source = FileSource::open(&capture, 512).unwrap();
        let scheduler = Interrogator::new(config.clone())
            .with_csv(&csv)
            .with_tx_capture(&tx)
            .with_raw_capture(&raw)
            .build(source)
            .unwrap();
        scheduler.wait();

        let rows = std::fs::read_to_string(&csv).unwrap();
        let rows: Vec<&str> = rows.lines().skip(1).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], format!("1,{},3000,E2801160600002092A3B4C5D,ok", epc_at));

        let tx_samples = std::fs::metadata(&tx).unwrap().len() / 8;
        assert_eq!(tx_samples, derived.rx_to_dac(epc_window.end));

        let raw_samples = std::fs::metadata(&raw).unwrap().len() / 8;
        let reply_len = |bits: usize| ((derived.preamble_symbols() + bits + 1) * derived.symbol_len) as u64;
        assert_eq!(raw_samples, reply_len(32) + reply_len(128));
    }

    #[test]
    fn stale_configuration_is_rejected() {
        let mut config = config();
        let radio = config.radio().clone();
        config.set_radio(radio);
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("one.cf32");
        std::fs::write(&capture, [0u8; 8]).unwrap();
        let source = FileSource::open(&capture, 64).unwrap();
        assert!(Interrogator::new(config).pipeline(source).is_err());
    }
}

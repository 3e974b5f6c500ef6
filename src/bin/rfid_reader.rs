//! Run the interrogator over a recorded receive stream.
//!
//! Usage:
//!   cargo run --release --bin rfid_reader -- \
//!       --file capture.cf32 \
//!       --line-code fm0 -q 4 --rounds 50
//!
//! With outputs:
//!   cargo run --release --bin rfid_reader -- \
//!       --file capture.cf32 \
//!       --csv-output tags.csv --tx-output tx.cf32 --raw-output bursts.cf32

use clap::{Parser, ValueEnum};
use rfid::protocol::{DivideRatio, Session, Target};
use rfid::{Config, DecoderConfig, FileSource, GateConfig, Interrogator, LineCode, LinkConfig, RadioConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LineCodeArg {
    Fm0,
    Miller2,
    Miller4,
    Miller8,
}

impl From<LineCodeArg> for LineCode {
    fn from(arg: LineCodeArg) -> Self {
        match arg {
            LineCodeArg::Fm0 => LineCode::Fm0,
            LineCodeArg::Miller2 => LineCode::Miller(2),
            LineCodeArg::Miller4 => LineCode::Miller(4),
            LineCodeArg::Miller8 => LineCode::Miller(8),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DivideRatioArg {
    #[value(name = "8")]
    Dr8,
    #[value(name = "64/3")]
    Dr64Over3,
}

impl From<DivideRatioArg> for DivideRatio {
    fn from(arg: DivideRatioArg) -> Self {
        match arg {
            DivideRatioArg::Dr8 => DivideRatio::Dr8,
            DivideRatioArg::Dr64Over3 => DivideRatio::Dr64Over3,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TargetArg {
    A,
    B,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Receive capture (cf32_le at adc_rate / decimation)
    #[arg(short, long)]
    file: PathBuf,

    /// Samples per block read from the capture
    #[arg(long, default_value = "4096")]
    block_len: usize,

    /// Stop reading after this many samples
    #[arg(long)]
    max_samples: Option<usize>,

    /// Backscatter link frequency in Hz
    #[arg(long, default_value = "40000")]
    blf: u32,

    #[arg(long, default_value = "2000000")]
    adc_rate: u32,

    #[arg(long, default_value = "5")]
    decimation: u32,

    #[arg(long, default_value = "1000000")]
    dac_rate: u32,

    #[arg(long, default_value = "910000000")]
    carrier_frequency: f64,

    #[arg(long, default_value = "0")]
    tx_gain: f64,

    #[arg(long, default_value = "20")]
    rx_gain: f64,

    /// Carrier level of the transmit waveform, (0, 1]
    #[arg(long, default_value = "0.5")]
    amplitude: f32,

    #[arg(long, value_enum, default_value = "fm0")]
    line_code: LineCodeArg,

    #[arg(long, value_enum, default_value = "8")]
    divide_ratio: DivideRatioArg,

    /// Ask tags for the extended pilot tone
    #[arg(long)]
    trext: bool,

    /// Inventory session 0-3
    #[arg(long, default_value = "0")]
    session: u8,

    #[arg(long, value_enum, default_value = "a")]
    target: TargetArg,

    /// Slot-count exponent of the first round
    #[arg(short, long, default_value = "4")]
    q: u8,

    #[arg(long, default_value = "0.3")]
    q_step: f32,

    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Number of inventory rounds (default: until the capture ends)
    #[arg(long)]
    rounds: Option<u64>,

    /// Flip the target after a round without replies
    #[arg(long)]
    alternate_target: bool,

    #[arg(long, default_value = "25")]
    tari_us: f64,

    #[arg(long, default_value = "100")]
    turnaround_us: f64,

    #[arg(long, default_value = "1500")]
    rn16_window_us: f64,

    #[arg(long, default_value = "4000")]
    epc_window_us: f64,

    #[arg(long, default_value = "96")]
    epc_bits: usize,

    /// RN16 replies carry no CRC-16
    #[arg(long)]
    rn16_no_crc: bool,

    #[arg(long, default_value = "3.0")]
    enter_factor: f32,

    #[arg(long, default_value = "1.5")]
    exit_factor: f32,

    /// Minimum normalised preamble correlation
    #[arg(long, default_value = "0.9")]
    threshold: f32,

    /// Number of tag reads before stopping (0 = unlimited)
    #[arg(short, long, default_value = "0")]
    n: usize,

    /// CSV output file path (optional)
    #[arg(long)]
    csv_output: Option<PathBuf>,

    /// Transmit waveform capture (cf32_le at dac_rate)
    #[arg(long)]
    tx_output: Option<PathBuf>,

    /// Raw samples of every processed burst (cf32_le)
    #[arg(long)]
    raw_output: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> rfid::Result<Config> {
        let radio = RadioConfig {
            backscatter_link_frequency: self.blf,
            adc_rate: self.adc_rate,
            decimation_factor: self.decimation,
            dac_rate: self.dac_rate,
            carrier_frequency: self.carrier_frequency,
            transmit_gain: self.tx_gain,
            receive_gain: self.rx_gain,
            transmit_amplitude: self.amplitude,
        };
        let session = Session::new(self.session).ok_or_else(|| {
            rfid::RfidError::ConfigurationInvalid(format!("session {} outside 0..=3", self.session))
        })?;
        let link = LinkConfig {
            line_code: self.line_code.into(),
            divide_ratio: self.divide_ratio.into(),
            trext: self.trext,
            session,
            target: match self.target {
                TargetArg::A => Target::A,
                TargetArg::B => Target::B,
            },
            initial_q: self.q,
            q_step: self.q_step,
            max_retries: self.max_retries,
            max_rounds: self.rounds,
            alternate_target: self.alternate_target,
            tari_us: self.tari_us,
            turnaround_us: self.turnaround_us,
            rn16_window_us: self.rn16_window_us,
            epc_window_us: self.epc_window_us,
            epc_bits: self.epc_bits,
            rn16_has_crc: !self.rn16_no_crc,
            ..LinkConfig::default()
        };
        let gate = GateConfig {
            enter_factor: self.enter_factor,
            exit_factor: self.exit_factor,
            ..GateConfig::default()
        };
        let decoder = DecoderConfig {
            correlation_threshold: self.threshold,
            ..DecoderConfig::default()
        };
        Config::new(radio, link, gate, decoder)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("=== RFID Reader ===");
    info!("Capture: {}", args.file.display());
    let config = args.config()?;
    info!(
        "{} at BLF {} Hz, Q={}, session {}",
        config.link().line_code,
        config.radio().backscatter_link_frequency,
        config.link().initial_q,
        config.link().session
    );

    let mut source = FileSource::open(&args.file, args.block_len)?;
    if let Some(max) = args.max_samples {
        source = source.with_max_samples(max);
    }

    let mut interrogator = Interrogator::new(config).with_max_reads(args.n);
    if let Some(path) = &args.csv_output {
        interrogator = interrogator.with_csv(path);
    }
    if let Some(path) = &args.tx_output {
        interrogator = interrogator.with_tx_capture(path);
    }
    if let Some(path) = &args.raw_output {
        interrogator = interrogator.with_raw_capture(path);
    }

    info!("Building pipeline...");
    let scheduler = interrogator.build(source)?;

    info!("Running...");
    scheduler.wait();

    info!("Done!");
    Ok(())
}

//! Interrogator configuration and derived timing
//!
//! Options are grouped by concern. Everything the nodes actually use
//! (sample-clock lengths, PIE symbol lengths, the preamble template) lives in
//! [`Derived`], which is computed by [`Config::recompute`]. Changing an option
//! marks the derived values stale; nodes refuse a stale configuration instead
//! of silently mixing old and new timing.

use tracing::{debug, info};

use crate::protocol::pie::DELIMITER_US;
use crate::protocol::{DivideRatio, FrameKind, LineCode, PieTiming, Select, Session, Target};
use crate::{Result, RfidError};

/// Radio front-end rates and gains
#[derive(Clone, Debug, PartialEq)]
pub struct RadioConfig {
    /// Tag backscatter link frequency, Hz
    pub backscatter_link_frequency: u32,
    /// Receive ADC rate before the channel filter, Hz
    pub adc_rate: u32,
    /// Channel-filter decimation; the receive sample rate is `adc_rate / decimation_factor`
    pub decimation_factor: u32,
    /// Transmit sample rate, Hz
    pub dac_rate: u32,
    pub carrier_frequency: f64,
    /// dB
    pub transmit_gain: f64,
    /// dB
    pub receive_gain: f64,
    /// Carrier-on level of the command waveform, 0..=1
    pub transmit_amplitude: f32,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            backscatter_link_frequency: 40_000,
            adc_rate: 2_000_000,
            decimation_factor: 5,
            dac_rate: 1_000_000,
            carrier_frequency: 910e6,
            transmit_gain: 0.0,
            receive_gain: 20.0,
            transmit_amplitude: 0.5,
        }
    }
}

/// MAC-layer and timing options of the inventory
#[derive(Clone, Debug, PartialEq)]
pub struct LinkConfig {
    pub line_code: LineCode,
    pub divide_ratio: DivideRatio,
    pub trext: bool,
    pub select: Select,
    pub session: Session,
    pub target: Target,
    /// Slot-count exponent of the first round
    pub initial_q: u8,
    /// Q-algorithm step C
    pub q_step: f32,
    /// Corrupt EPC replies tolerated per slot; the slot is abandoned on the last
    pub max_retries: u32,
    /// Stop after this many rounds; `None` runs until the input ends
    pub max_rounds: Option<u64>,
    /// Flip the target after a round in which no tag answered
    pub alternate_target: bool,
    pub tari_us: f64,
    /// Silence between the end of a command and the opening of its receive window
    pub turnaround_us: f64,
    pub rn16_window_us: f64,
    pub epc_window_us: f64,
    pub epc_bits: usize,
    /// RN16 replies carry a trailing CRC-16
    pub rn16_has_crc: bool,
    /// Warn after this many consecutive rounds without a singulation
    pub starvation_rounds: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            line_code: LineCode::Fm0,
            divide_ratio: DivideRatio::Dr8,
            trext: false,
            select: Select::All,
            session: Session::S0,
            target: Target::A,
            initial_q: 4,
            q_step: 0.3,
            max_retries: 3,
            max_rounds: None,
            alternate_target: false,
            tari_us: 25.0,
            turnaround_us: 100.0,
            rn16_window_us: 1_500.0,
            epc_window_us: 4_000.0,
            epc_bits: 96,
            rn16_has_crc: true,
            starvation_rounds: 10,
        }
    }
}

/// Burst gate options; lengths are in symbols of the configured link
#[derive(Clone, Debug, PartialEq)]
pub struct GateConfig {
    pub enter_factor: f32,
    pub exit_factor: f32,
    /// Samples averaged to seed the noise floor
    pub noise_window: usize,
    /// Weight of each new magnitude in the running noise floor
    pub noise_alpha: f32,
    pub min_noise_floor: f32,
    pub dwell_symbols: usize,
    pub min_burst_symbols: usize,
    pub max_burst_symbols: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enter_factor: 3.0,
            exit_factor: 1.5,
            noise_window: 256,
            noise_alpha: 0.001,
            min_noise_floor: 1e-4,
            dwell_symbols: 2,
            min_burst_symbols: 8,
            max_burst_symbols: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecoderConfig {
    /// Half-symbol preamble levels; `None` uses the line code's standard preamble
    pub preamble: Option<Vec<i8>>,
    /// Minimum normalised preamble correlation, 0..=1
    pub correlation_threshold: f32,
    /// How far into a burst the preamble may start, in symbols
    pub search_symbols: usize,
    /// Extra symbols tolerated after the trailing dummy bit
    pub length_tolerance_symbols: usize,
    /// Subtract the burst mean before correlating
    pub remove_dc: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            preamble: None,
            correlation_threshold: 0.9,
            search_symbols: 2,
            length_tolerance_symbols: 2,
            remove_dc: true,
        }
    }
}

/// Sample-clock lengths used by the gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateTiming {
    pub dwell: usize,
    pub min_burst: usize,
    pub max_burst: usize,
}

/// Values computed from the options by `Config::recompute`
#[derive(Clone, Debug, PartialEq)]
pub struct Derived {
    pub rx_sample_rate: u32,
    pub dac_rate: u32,
    pub samples_per_cycle: usize,
    pub symbol_len: usize,
    pub half_symbol_len: usize,
    /// Boxcar taps for the external decimating channel filter
    pub channel_filter_taps: usize,
    pub pie: PieTiming,
    pub turnaround: u64,
    pub rn16_window: u64,
    pub epc_window: u64,
    pub gate: GateTiming,
    pub preamble: Vec<i8>,
    pub search_len: usize,
    pub rn16_frame_bits: usize,
    pub epc_frame_bits: usize,
}

impl Derived {
    /// Transmit sample index at (or just before) receive sample `rx_index`
    pub fn rx_to_dac(&self, rx_index: u64) -> u64 {
        (u128::from(rx_index) * u128::from(self.dac_rate) / u128::from(self.rx_sample_rate)) as u64
    }

    /// Receive samples covering `dac_len` transmit samples, rounded up
    pub fn dac_len_to_rx(&self, dac_len: u64) -> u64 {
        let num = u128::from(dac_len) * u128::from(self.rx_sample_rate);
        num.div_ceil(u128::from(self.dac_rate)) as u64
    }

    /// Expected frame length including CRC, in bits
    pub fn frame_bits(&self, kind: FrameKind) -> Option<usize> {
        match kind {
            FrameKind::Rn16 => Some(self.rn16_frame_bits),
            FrameKind::Epc => Some(self.epc_frame_bits),
            FrameKind::Unknown => None,
        }
    }

    pub fn preamble_symbols(&self) -> usize {
        self.preamble.len() / 2
    }
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    radio: RadioConfig,
    link: LinkConfig,
    gate: GateConfig,
    decoder: DecoderConfig,
    derived: Option<Derived>,
}

impl Config {
    /// Validate the options and compute the derived values.
    pub fn new(
        radio: RadioConfig,
        link: LinkConfig,
        gate: GateConfig,
        decoder: DecoderConfig,
    ) -> Result<Self> {
        let mut config = Self {
            radio,
            link,
            gate,
            decoder,
            derived: None,
        };
        config.recompute()?;
        Ok(config)
    }

    pub fn radio(&self) -> &RadioConfig {
        &self.radio
    }

    pub fn link(&self) -> &LinkConfig {
        &self.link
    }

    pub fn gate(&self) -> &GateConfig {
        &self.gate
    }

    pub fn decoder(&self) -> &DecoderConfig {
        &self.decoder
    }

    pub fn set_radio(&mut self, radio: RadioConfig) {
        self.radio = radio;
        self.derived = None;
    }

    pub fn set_link(&mut self, link: LinkConfig) {
        self.link = link;
        self.derived = None;
    }

    pub fn set_gate(&mut self, gate: GateConfig) {
        self.gate = gate;
        self.derived = None;
    }

    pub fn set_decoder(&mut self, decoder: DecoderConfig) {
        self.decoder = decoder;
        self.derived = None;
    }

    pub fn is_stale(&self) -> bool {
        self.derived.is_none()
    }

    pub fn derived(&self) -> Result<&Derived> {
        self.derived.as_ref().ok_or_else(|| {
            RfidError::ConfigurationInvalid("derived parameters are stale; call recompute()".into())
        })
    }

    /// Recompute the derived values. On error the configuration stays stale.
    pub fn recompute(&mut self) -> Result<&Derived> {
        self.derived = None;
        let derived = derive(&self.radio, &self.link, &self.gate, &self.decoder)?;
        info!(
            "Receive rate {} Hz, {} samples per symbol ({}), turnaround {} samples, filter taps {}",
            derived.rx_sample_rate,
            derived.symbol_len,
            self.link.line_code,
            derived.turnaround,
            derived.channel_filter_taps
        );
        debug!("Derived configuration: {:?}", derived);
        let derived = self.derived.insert(derived);
        Ok(&*derived)
    }
}

fn invalid<T>(message: String) -> Result<T> {
    Err(RfidError::ConfigurationInvalid(message))
}

fn us_to_samples(us: f64, rate: u32) -> u64 {
    (us * f64::from(rate) / 1e6).round() as u64
}

fn derive(radio: &RadioConfig, link: &LinkConfig, gate: &GateConfig, decoder: &DecoderConfig) -> Result<Derived> {
    let blf = radio.backscatter_link_frequency;
    if blf == 0 || radio.adc_rate == 0 || radio.decimation_factor == 0 || radio.dac_rate == 0 {
        return invalid("rates and decimation factor must be positive".into());
    }
    if radio.adc_rate % radio.decimation_factor != 0 {
        return invalid(format!(
            "adc rate {} is not a multiple of decimation factor {}",
            radio.adc_rate, radio.decimation_factor
        ));
    }
    let rx_sample_rate = radio.adc_rate / radio.decimation_factor;
    if rx_sample_rate % blf != 0 {
        return invalid(format!(
            "receive rate {} Hz is not an integer multiple of the link frequency {} Hz",
            rx_sample_rate, blf
        ));
    }
    let samples_per_cycle = (rx_sample_rate / blf) as usize;
    if samples_per_cycle < 2 || samples_per_cycle % 2 != 0 {
        return invalid(format!(
            "{} samples per link cycle; need an even count of at least 2",
            samples_per_cycle
        ));
    }
    if !(radio.transmit_amplitude > 0.0 && radio.transmit_amplitude <= 1.0) {
        return invalid(format!("transmit amplitude {} outside (0, 1]", radio.transmit_amplitude));
    }

    if !link.line_code.is_valid() {
        return invalid(format!("unsupported line code {}", link.line_code));
    }
    if link.initial_q > 15 {
        return invalid(format!("initial Q {} above 15", link.initial_q));
    }
    if !(0.1..=0.5).contains(&link.q_step) {
        return invalid(format!("Q step {} outside 0.1..=0.5", link.q_step));
    }
    if !(6.25..=25.0).contains(&link.tari_us) {
        return invalid(format!("Tari {} us outside 6.25..=25", link.tari_us));
    }
    if link.epc_bits == 0 || link.epc_bits % 16 != 0 {
        return invalid(format!("EPC length {} bits is not a whole number of words", link.epc_bits));
    }

    let tari = us_to_samples(link.tari_us, radio.dac_rate) as usize;
    if tari < 4 {
        return invalid(format!("Tari is only {} transmit samples", tari));
    }
    let rtcal = 3 * tari;
    let trcal_s = link.divide_ratio.value() / f64::from(blf);
    let trcal = (trcal_s * f64::from(radio.dac_rate)).round() as usize;
    if (trcal as f64) < 1.1 * rtcal as f64 || trcal > 3 * rtcal {
        return invalid(format!(
            "TRcal of {} samples must lie within 1.1..=3 RTcal ({} samples); adjust divide ratio or link frequency",
            trcal, rtcal
        ));
    }
    let pie = PieTiming {
        delimiter: us_to_samples(DELIMITER_US, radio.dac_rate) as usize,
        tari,
        pulse_width: tari / 2,
        rtcal,
        trcal,
        amplitude: radio.transmit_amplitude,
    };

    let turnaround = us_to_samples(link.turnaround_us, rx_sample_rate);
    let rn16_window = us_to_samples(link.rn16_window_us, rx_sample_rate);
    let epc_window = us_to_samples(link.epc_window_us, rx_sample_rate);
    if rn16_window == 0 || epc_window == 0 {
        return invalid("receive windows must be longer than one sample".into());
    }

    let symbol_len = samples_per_cycle * link.line_code.cycles_per_symbol();
    let preamble = match &decoder.preamble {
        Some(p) => p.clone(),
        None => link.line_code.default_preamble(link.trext),
    };
    if preamble.is_empty() || preamble.len() % 2 != 0 || preamble.iter().any(|&l| l != 1 && l != -1) {
        return invalid("preamble must be a non-empty even number of +1/-1 half symbols".into());
    }
    if !(decoder.correlation_threshold > 0.0 && decoder.correlation_threshold <= 1.0) {
        return invalid(format!(
            "correlation threshold {} outside (0, 1]",
            decoder.correlation_threshold
        ));
    }

    let rn16_frame_bits = 16 + if link.rn16_has_crc { 16 } else { 0 };
    let epc_frame_bits = 16 + link.epc_bits + 16;

    if !(gate.enter_factor > gate.exit_factor && gate.exit_factor > 0.0) {
        return invalid(format!(
            "gate factors need enter ({}) > exit ({}) > 0",
            gate.enter_factor, gate.exit_factor
        ));
    }
    if !(gate.noise_alpha > 0.0 && gate.noise_alpha <= 1.0) {
        return invalid(format!("noise alpha {} outside (0, 1]", gate.noise_alpha));
    }
    if gate.noise_window == 0 || gate.dwell_symbols == 0 || gate.min_burst_symbols == 0 {
        return invalid("noise window, dwell and minimum burst length must be positive".into());
    }
    let longest_reply = preamble.len() / 2 + epc_frame_bits + 1;
    if gate.max_burst_symbols < longest_reply {
        return invalid(format!(
            "maximum burst of {} symbols cannot hold an EPC reply of {} symbols",
            gate.max_burst_symbols, longest_reply
        ));
    }
    if gate.min_burst_symbols > gate.max_burst_symbols {
        return invalid("minimum burst length exceeds the maximum".into());
    }

    Ok(Derived {
        rx_sample_rate,
        dac_rate: radio.dac_rate,
        samples_per_cycle,
        symbol_len,
        half_symbol_len: symbol_len / 2,
        channel_filter_taps: (f64::from(radio.adc_rate) / f64::from(blf) * 0.5) as usize,
        pie,
        turnaround,
        rn16_window,
        epc_window,
        gate: GateTiming {
            dwell: gate.dwell_symbols * symbol_len,
            min_burst: gate.min_burst_symbols * symbol_len,
            max_burst: gate.max_burst_symbols * symbol_len,
        },
        preamble,
        search_len: decoder.search_symbols * symbol_len,
        rn16_frame_bits,
        epc_frame_bits,
    })
}

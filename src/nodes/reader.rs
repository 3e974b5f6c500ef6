//! Inventory state machine
//!
//! The reader issues Query / ACK / QueryRep commands and judges each receive
//! window once the decoder's watermark has passed its end. All timing is in
//! receive-sample indices: a command starting at `s` ends at
//! `s + len(command)`, its window opens exactly one turnaround later and has a
//! fixed length, and the next command starts where that window ends. The
//! transmit waveform of each command is padded with carrier up to the end of
//! its window, so consecutive transmissions form one gapless stream.
//!
//! [`Reader::start`] and [`Reader::handle`] are pure: they return the actions
//! the node then dispatches to its outputs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::tag_decoder::{DecoderEvent, Expectation, ReceiveWindow};
use crate::config::{Config, Derived};
use crate::protocol::{Command, DecodedFrame, DivideRatio, FrameKind, LineCode, Select, Session, Target, TagIdentity};
use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkError, WorkResult};
use crate::runtime::{PortSchema, Sender};

const MAX_Q: u8 = 15;

/// A command waveform scheduled on the sample clock.
///
/// `start_index` and `end_index` delimit the command in receive samples;
/// `waveform` holds transmit samples from `dac_start_index` up to the end of
/// `window`, carrier included.
#[derive(Clone, Debug)]
pub struct Transmission {
    pub command: Command,
    pub start_index: u64,
    pub end_index: u64,
    pub window: ReceiveWindow,
    pub dac_start_index: u64,
    pub waveform: Arc<[f32]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotOutcome {
    /// No reply in the RN16 window
    Empty,
    /// An RN16 window held only corrupt replies
    Collided,
    Singulated,
    /// A tag answered but its EPC never arrived intact
    Abandoned,
}

#[derive(Clone, Debug)]
pub enum ReaderAction {
    Transmit(Transmission),
    Expect(Expectation),
    Identity(TagIdentity),
    SlotDone(SlotOutcome),
    /// `max_rounds` reached
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Awaiting {
    Nothing,
    Rn16,
    Epc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReaderState {
    pub round_number: u64,
    /// QueryReps left in the current round
    pub slot_counter: u32,
    pub session: Session,
    pub target: Target,
    pub retry_count: u32,
    pub awaiting: Awaiting,
    pub q: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InventoryStats {
    pub rounds: u64,
    pub slots: u64,
    pub singulations: u64,
    pub empty: u64,
    pub collisions: u64,
    pub abandoned: u64,
    pub crc_failures: u64,
    pub misses: u64,
    pub commands: u64,
}

impl fmt::Display for InventoryStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} rounds, {} slots: {} singulated, {} empty, {} collided, {} abandoned; {} CRC failures, {} misses",
            self.rounds,
            self.slots,
            self.singulations,
            self.empty,
            self.collisions,
            self.abandoned,
            self.crc_failures,
            self.misses
        )
    }
}

pub struct Reader {
    name: String,
    derived: Derived,
    line_code: LineCode,
    divide_ratio: DivideRatio,
    trext: bool,
    select: Select,
    q_step: f32,
    max_retries: u32,
    max_rounds: Option<u64>,
    alternate_target: bool,
    starvation_rounds: u64,

    state: ReaderState,
    qfp: f32,
    window: Option<Expectation>,
    pending: Option<DecodedFrame>,
    rn16: Option<u16>,
    watermark: u64,
    answered_this_round: bool,
    singulated_this_round: bool,
    rounds_without_singulation: u64,
    stats: InventoryStats,
    started: bool,
    finished: bool,

    input_buffer: VecDeque<DecoderEvent>,
}

impl Reader {
    pub fn new(config: &Config) -> crate::Result<Self> {
        let derived = config.derived()?.clone();
        let link = config.link();
        Ok(Self {
            name: "reader".to_string(),
            derived,
            line_code: link.line_code,
            divide_ratio: link.divide_ratio,
            trext: link.trext,
            select: link.select,
            q_step: link.q_step,
            max_retries: link.max_retries,
            max_rounds: link.max_rounds,
            alternate_target: link.alternate_target,
            starvation_rounds: link.starvation_rounds,
            state: ReaderState {
                round_number: 0,
                slot_counter: 0,
                session: link.session,
                target: link.target,
                retry_count: 0,
                awaiting: Awaiting::Nothing,
                q: link.initial_q,
            },
            qfp: f32::from(link.initial_q),
            window: None,
            pending: None,
            rn16: None,
            watermark: 0,
            answered_this_round: false,
            singulated_this_round: false,
            rounds_without_singulation: 0,
            stats: InventoryStats::default(),
            started: false,
            finished: false,
            input_buffer: VecDeque::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn state(&self) -> &ReaderState {
        &self.state
    }

    pub fn stats(&self) -> InventoryStats {
        self.stats
    }

    /// The receive window currently open, if any
    pub fn window(&self) -> Option<&Expectation> {
        self.window.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Begin the inventory with a Query at receive sample `at`.
    pub fn start(&mut self, at: u64) -> Vec<ReaderAction> {
        let mut actions = Vec::new();
        if self.started {
            return actions;
        }
        self.started = true;
        self.watermark = at;
        self.begin_round(at, &mut actions);
        actions
    }

    /// Feed one decoder event; returns what the reader does in response.
    pub fn handle(&mut self, event: &DecoderEvent) -> Vec<ReaderAction> {
        let mut actions = Vec::new();
        if self.finished {
            return actions;
        }
        match event {
            DecoderEvent::Frame(frame) => self.offer(frame),
            DecoderEvent::Miss { start_index, failure } => {
                if self.window.is_some_and(|w| w.window.contains(*start_index)) {
                    self.stats.misses += 1;
                }
                trace!("[{}] Miss at {}: {}", self.name, start_index, failure);
            }
            DecoderEvent::Watermark(w) => {
                self.watermark = self.watermark.max(*w);
                while let Some(expectation) = self.window {
                    if self.finished || self.watermark < expectation.window.end {
                        break;
                    }
                    self.close_window(expectation, &mut actions);
                }
            }
        }
        actions
    }

    /// Keep the first intact frame of the awaited kind; an intact frame
    /// replaces a corrupt one.
    fn offer(&mut self, frame: &DecodedFrame) {
        let Some(expectation) = self.window else {
            return;
        };
        if frame.kind != expectation.kind || !expectation.window.contains(frame.start_index) {
            debug!(
                "[{}] Ignoring {} frame at {} (awaiting {} in {}..{})",
                self.name,
                frame.kind,
                frame.start_index,
                expectation.kind,
                expectation.window.start,
                expectation.window.end
            );
            return;
        }
        let replace = match &self.pending {
            None => true,
            Some(pending) => !pending.crc_valid && frame.crc_valid,
        };
        if replace {
            self.pending = Some(frame.clone());
        }
    }

    fn close_window(&mut self, expectation: Expectation, actions: &mut Vec<ReaderAction>) {
        self.window = None;
        let at = expectation.window.end;
        let frame = self.pending.take();
        if frame.is_some() {
            self.answered_this_round = true;
        }

        match self.state.awaiting {
            Awaiting::Rn16 => match frame {
                Some(f) if f.crc_valid => match f.rn16() {
                    Some(rn16) => {
                        debug!("[{}] RN16 {:04X} at {}", self.name, rn16, f.start_index);
                        self.rn16 = Some(rn16);
                        self.state.retry_count = 0;
                        self.transmit(at, Command::Ack { rn16 }, FrameKind::Epc, actions);
                    }
                    None => self.slot_done(SlotOutcome::Collided, at, actions),
                },
                Some(_) => {
                    self.stats.crc_failures += 1;
                    self.slot_done(SlotOutcome::Collided, at, actions);
                }
                None => self.slot_done(SlotOutcome::Empty, at, actions),
            },
            Awaiting::Epc => match frame {
                Some(f) if f.crc_valid => {
                    if let Some(identity) = f.identity(self.state.round_number) {
                        info!("[{}] Round {}: {}", self.name, self.state.round_number, identity);
                        actions.push(ReaderAction::Identity(identity));
                    }
                    self.state.retry_count = 0;
                    self.slot_done(SlotOutcome::Singulated, at, actions);
                }
                Some(_) => {
                    self.stats.crc_failures += 1;
                    self.state.retry_count += 1;
                    match self.rn16 {
                        Some(rn16) if self.state.retry_count < self.max_retries => {
                            debug!(
                                "[{}] Corrupt EPC, ACK retry {}/{}",
                                self.name, self.state.retry_count, self.max_retries
                            );
                            self.transmit(at, Command::Ack { rn16 }, FrameKind::Epc, actions);
                        }
                        _ => {
                            debug!("[{}] Retries exhausted, abandoning slot", self.name);
                            self.state.retry_count = 0;
                            self.slot_done(SlotOutcome::Abandoned, at, actions);
                        }
                    }
                }
                None => {
                    self.state.retry_count = 0;
                    self.slot_done(SlotOutcome::Abandoned, at, actions);
                }
            },
            Awaiting::Nothing => {}
        }
    }

    fn slot_done(&mut self, outcome: SlotOutcome, at: u64, actions: &mut Vec<ReaderAction>) {
        self.stats.slots += 1;
        self.rn16 = None;
        self.state.awaiting = Awaiting::Nothing;
        match outcome {
            SlotOutcome::Empty => {
                self.stats.empty += 1;
                self.qfp = (self.qfp - self.q_step).max(0.0);
            }
            SlotOutcome::Collided => {
                self.stats.collisions += 1;
                self.qfp = (self.qfp + self.q_step).min(f32::from(MAX_Q));
            }
            SlotOutcome::Singulated => {
                self.stats.singulations += 1;
                self.singulated_this_round = true;
            }
            SlotOutcome::Abandoned => self.stats.abandoned += 1,
        }
        trace!("[{}] Slot done: {:?}, Qfp {:.2}", self.name, outcome, self.qfp);
        actions.push(ReaderAction::SlotDone(outcome));

        if self.state.slot_counter == 0 {
            self.end_round(at, actions);
        } else {
            self.state.slot_counter -= 1;
            let command = Command::QueryRep {
                session: self.state.session,
            };
            self.transmit(at, command, FrameKind::Rn16, actions);
        }
    }

    fn end_round(&mut self, at: u64, actions: &mut Vec<ReaderAction>) {
        self.stats.rounds += 1;
        info!("[{}] Round {} done: {}", self.name, self.state.round_number, self.stats);

        if self.singulated_this_round {
            self.rounds_without_singulation = 0;
        } else {
            self.rounds_without_singulation += 1;
            if self.starvation_rounds > 0 && self.rounds_without_singulation % self.starvation_rounds == 0 {
                warn!(
                    "[{}] No tag singulated in the last {} rounds",
                    self.name, self.rounds_without_singulation
                );
            }
        }
        if self.alternate_target && !self.answered_this_round {
            self.state.target = self.state.target.flipped();
            debug!("[{}] No replies, switching to target {:?}", self.name, self.state.target);
        }
        self.state.q = (self.qfp.round() as u8).min(MAX_Q);

        if self.max_rounds.is_some_and(|max| self.state.round_number >= max) {
            info!("[{}] Inventory finished after {} rounds", self.name, self.state.round_number);
            self.finished = true;
            actions.push(ReaderAction::Finished);
            return;
        }
        self.begin_round(at, actions);
    }

    fn begin_round(&mut self, at: u64, actions: &mut Vec<ReaderAction>) {
        self.state.round_number += 1;
        self.state.slot_counter = (1u32 << self.state.q) - 1;
        self.answered_this_round = false;
        self.singulated_this_round = false;
        debug!(
            "[{}] Round {} with Q={} ({} slots)",
            self.name,
            self.state.round_number,
            self.state.q,
            self.state.slot_counter + 1
        );
        let command = Command::Query {
            divide_ratio: self.divide_ratio,
            line_code: self.line_code,
            trext: self.trext,
            select: self.select,
            session: self.state.session,
            target: self.state.target,
            q: self.state.q,
        };
        self.transmit(at, command, FrameKind::Rn16, actions);
    }

    fn transmit(&mut self, at: u64, command: Command, kind: FrameKind, actions: &mut Vec<ReaderAction>) {
        let pie = &self.derived.pie;
        let mut waveform = pie.modulate(&command);
        let end_index = at + self.derived.dac_len_to_rx(waveform.len() as u64);
        let start = end_index + self.derived.turnaround;
        let length = match kind {
            FrameKind::Epc => self.derived.epc_window,
            _ => self.derived.rn16_window,
        };
        let window = ReceiveWindow {
            start,
            end: start + length,
        };

        let dac_start_index = self.derived.rx_to_dac(at);
        let dac_len = self.derived.rx_to_dac(window.end) - dac_start_index;
        waveform.resize(dac_len as usize, pie.amplitude);

        debug!(
            "[{}] {} at {}..{}, {} window {}..{}",
            self.name,
            command,
            at,
            end_index,
            kind,
            window.start,
            window.end
        );
        self.stats.commands += 1;
        self.state.awaiting = match kind {
            FrameKind::Epc => Awaiting::Epc,
            _ => Awaiting::Rn16,
        };
        let expectation = Expectation { kind, window };
        self.window = Some(expectation);
        self.pending = None;

        actions.push(ReaderAction::Transmit(Transmission {
            command,
            start_index: at,
            end_index,
            window,
            dac_start_index,
            waveform: waveform.into(),
        }));
        actions.push(ReaderAction::Expect(expectation));
    }
}

struct Outputs {
    tx: Option<Sender<Transmission>>,
    expectations: Option<Sender<Expectation>>,
    identities: Option<Sender<TagIdentity>>,
}

impl Outputs {
    fn close(&self) {
        if let Some(tx) = &self.tx {
            tx.close();
        }
        if let Some(expectations) = &self.expectations {
            expectations.close();
        }
        if let Some(identities) = &self.identities {
            identities.close();
        }
    }
}

impl Reader {
    fn dispatch(&mut self, actions: Vec<ReaderAction>, outputs: &Outputs) -> WorkResult<usize> {
        let produced = actions.len();
        for action in actions {
            match action {
                ReaderAction::Transmit(tx) => {
                    if let Some(out) = &outputs.tx {
                        out.deliver(tx)?;
                    }
                }
                ReaderAction::Expect(expectation) => {
                    if let Some(out) = &outputs.expectations {
                        out.deliver(expectation)?;
                    }
                }
                ReaderAction::Identity(identity) => {
                    if let Some(out) = &outputs.identities {
                        out.deliver(identity)?;
                    }
                }
                ReaderAction::SlotDone(_) => {}
                ReaderAction::Finished => {
                    outputs.close();
                    return Err(WorkError::Shutdown);
                }
            }
        }
        Ok(produced)
    }
}

impl ProcessNode for Reader {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> Vec<PortSchema> {
        vec![PortSchema::input::<DecoderEvent>("events", 0)]
    }

    fn output_schema(&self) -> Vec<PortSchema> {
        vec![
            PortSchema::output::<Transmission>("tx", 0),
            PortSchema::output::<Expectation>("expectations", 1),
            PortSchema::output::<TagIdentity>("identities", 2),
        ]
    }

    fn work(&mut self, inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize> {
        let outputs = Outputs {
            tx: outputs.first().and_then(|p| p.get::<Transmission>()),
            expectations: outputs.get(1).and_then(|p| p.get::<Expectation>()),
            identities: outputs.get(2).and_then(|p| p.get::<TagIdentity>()),
        };

        if !self.started {
            let actions = self.start(0);
            return self.dispatch(actions, &outputs);
        }

        let received = {
            let mut input = inputs
                .first()
                .and_then(|p| p.get::<DecoderEvent>(&mut self.input_buffer))
                .ok_or_else(|| WorkError::NodeError("Missing events input".into()))?;
            input.recv()
        };
        let event = match received {
            Ok(event) => event,
            Err(WorkError::Shutdown) => {
                info!("[{}] Input finished: {}", self.name, self.stats);
                outputs.close();
                return Err(WorkError::Shutdown);
            }
            Err(e) => return Err(e),
        };

        let actions = self.handle(&event);
        self.dispatch(actions, &outputs)
    }
}

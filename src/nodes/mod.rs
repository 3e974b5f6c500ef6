//! Processing nodes of the interrogator
//!
//! - **FileSource**: replays a `cf32_le` capture as `SampleBlock`s
//! - **Gate**: turns the sample stream into bursts and watermarks
//! - **TagDecoder**: decodes bursts against the reader's receive windows
//! - **Reader**: inventory state machine, emits command waveforms
//! - **CaptureSink** / **TagLog**: diagnostic and result sinks
//!
//! Every node is a `ProcessNode`; the interrogator wires them into a
//! `Pipeline`. Gate, decoder and reader also expose their logic as plain
//! methods so they can be driven directly.

mod capture_sink;
mod file_source;
mod gate;
mod reader;
mod tag_decoder;
mod tag_log;

pub use capture_sink::{CaptureSamples, CaptureSink};
pub use file_source::FileSource;
pub use gate::{Gate, GateEvent, GateStats};
pub use reader::{
    Awaiting, InventoryStats, Reader, ReaderAction, ReaderState, SlotOutcome, Transmission,
};
pub use tag_decoder::{
    DecodeFailure, DecoderEvent, DecoderStats, Expectation, ReceiveWindow, TagDecoder,
    synthesize_reply,
};
pub use tag_log::TagLog;

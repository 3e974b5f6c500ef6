//! Software-defined EPC Gen2 RFID interrogator
//!
//! Consumes a continuous stream of complex baseband samples, finds tag
//! replies, demodulates them and runs the Query / ACK / QueryRep inventory
//! cycle, producing the reader's command waveform as it goes.
//!
//! # Architecture
//!
//! - **Gate**: isolates reply bursts with a running noise floor and hysteresis
//! - **TagDecoder**: preamble correlation, FM0 / Miller demodulation, CRC-16
//! - **Reader**: inventory state machine timed purely by the sample clock
//! - **Runtime**: thread-per-node scheduler with bounded crossbeam channels
//!
//! # Example
//!
//! ```no_run
//! use rfid::{Config, FileSource, Interrogator};
//!
//! let config = Config::new(
//!     Default::default(),
//!     Default::default(),
//!     Default::default(),
//!     Default::default(),
//! )?;
//! let source = FileSource::open("capture.cf32", 4096)?;
//! let scheduler = Interrogator::new(config).build(source)?;
//! scheduler.wait();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use thiserror::Error;

pub mod config;
pub mod interrogator;
pub mod nodes;
pub mod protocol;
pub mod runtime;

pub use config::{Config, DecoderConfig, Derived, GateConfig, LinkConfig, RadioConfig};
pub use interrogator::Interrogator;
pub use nodes::{
    CaptureSink, DecodeFailure, DecoderEvent, Expectation, FileSource, Gate, GateEvent, Reader,
    ReaderAction, ReceiveWindow, SlotOutcome, TagDecoder, TagLog, Transmission,
};
pub use protocol::{Burst, Command, DecodedFrame, FrameKind, LineCode, TagIdentity};
pub use runtime::{
    BuildError, ConnectionError, InputPort, OutputPort, Pipeline, PortDirection, PortSchema,
    ProcessNode, SampleBlock, Scheduler, WorkError, WorkResult, register_type,
};

#[derive(Error, Debug)]
pub enum RfidError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Pipeline error: {0}")]
    Build(#[from] BuildError),

    #[error("Pipeline error: {0}")]
    Connection(#[from] ConnectionError),
}

pub type Result<T> = std::result::Result<T, RfidError>;

//! Gen2 air-interface pieces: CRCs, commands, PIE, line codes, frames

pub mod command;
pub mod crc;
pub mod frame;
pub mod line_code;
pub mod pie;

pub use command::{Command, DivideRatio, MemoryBank, QAdjust, Select, Session, Target};
pub use frame::{Burst, DecodedFrame, FrameKind, TagIdentity};
pub use line_code::LineCode;
pub use pie::PieTiming;

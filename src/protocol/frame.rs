//! Bursts, decoded frames and tag identities

use num_complex::Complex32;
use std::fmt;
use std::sync::Arc;

use super::crc::{bits_to_bytes, bits_to_u32};

/// Samples between a gate crossing and the end of the activity.
///
/// `end_index` is exclusive and always greater than `start_index`.
#[derive(Clone, Debug)]
pub struct Burst {
    pub start_index: u64,
    pub end_index: u64,
    pub samples: Arc<[Complex32]>,
}

impl Burst {
    pub fn new(start_index: u64, samples: impl Into<Arc<[Complex32]>>) -> Self {
        let samples = samples.into();
        Self {
            start_index,
            end_index: start_index + samples.len() as u64,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Rn16,
    Epc,
    Unknown,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameKind::Rn16 => write!(f, "RN16"),
            FrameKind::Epc => write!(f, "EPC"),
            FrameKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A demodulated reply.
///
/// `bits` holds the payload with the CRC field removed. Frames that fail the
/// CRC are still delivered with `crc_valid == false`.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFrame {
    pub kind: FrameKind,
    pub bits: Vec<bool>,
    pub crc_valid: bool,
    pub start_index: u64,
    /// Mean per-symbol decision confidence, 0..=1
    pub confidence: f32,
    /// Carrier phase recovered from the preamble, radians
    pub phase: f32,
}

impl DecodedFrame {
    /// The RN16 handle, if this is a 16-bit RN16 frame.
    pub fn rn16(&self) -> Option<u16> {
        (self.kind == FrameKind::Rn16 && self.bits.len() == 16).then(|| bits_to_u32(&self.bits) as u16)
    }

    /// Split an EPC reply into PC word and EPC bytes.
    pub fn identity(&self, round: u64) -> Option<TagIdentity> {
        if self.kind != FrameKind::Epc || self.bits.len() < 16 {
            return None;
        }
        Some(TagIdentity {
            pc: bits_to_u32(&self.bits[..16]) as u16,
            epc: bits_to_bytes(&self.bits[16..]),
            crc_valid: self.crc_valid,
            start_index: self.start_index,
            round,
        })
    }

    pub fn bit_string(&self) -> String {
        self.bits.iter().map(|&b| if b { '1' } else { '0' }).collect()
    }
}

/// One singulated tag, emitted once per successful EPC read
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagIdentity {
    pub pc: u16,
    pub epc: Vec<u8>,
    pub crc_valid: bool,
    pub start_index: u64,
    pub round: u64,
}

impl TagIdentity {
    /// EPC length announced by the PC word, in 16-bit words
    pub fn pc_epc_words(&self) -> usize {
        usize::from(self.pc >> 11)
    }

    pub fn epc_hex(&self) -> String {
        self.epc.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl fmt::Display for TagIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EPC {} (PC {:04X})", self.epc_hex(), self.pc)
    }
}

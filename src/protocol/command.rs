//! Reader-to-tag commands and their bit layouts

use std::fmt;

use super::crc::{crc5, crc16, push_bits};
use super::line_code::LineCode;

/// TRcal divide ratio; sets the backscatter link frequency together with TRcal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DivideRatio {
    Dr8,
    Dr64Over3,
}

impl DivideRatio {
    pub fn value(self) -> f64 {
        match self {
            DivideRatio::Dr8 => 8.0,
            DivideRatio::Dr64Over3 => 64.0 / 3.0,
        }
    }

    fn bit(self) -> bool {
        matches!(self, DivideRatio::Dr64Over3)
    }
}

/// Which tags respond to a Query, by their SL flag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Select {
    All,
    NotAsserted,
    Asserted,
}

impl Select {
    fn field(self) -> u32 {
        match self {
            Select::All => 0b00,
            Select::NotAsserted => 0b10,
            Select::Asserted => 0b11,
        }
    }
}

/// Inventory session S0..S3
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Session(u8);

impl Session {
    pub const S0: Session = Session(0);
    pub const S1: Session = Session(1);
    pub const S2: Session = Session(2);
    pub const S3: Session = Session(3);

    pub fn new(index: u8) -> Option<Self> {
        (index < 4).then_some(Session(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Inventoried flag value a round is addressed to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    A,
    B,
}

impl Target {
    pub fn flipped(self) -> Self {
        match self {
            Target::A => Target::B,
            Target::B => Target::A,
        }
    }
}

/// Q change requested by QueryAdjust
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QAdjust {
    Up,
    Unchanged,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryBank {
    Reserved,
    Epc,
    Tid,
    User,
}

/// One reader command. Its parameters fully determine the bits on air.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Query {
        divide_ratio: DivideRatio,
        line_code: LineCode,
        trext: bool,
        select: Select,
        session: Session,
        target: Target,
        q: u8,
    },
    QueryRep {
        session: Session,
    },
    QueryAdjust {
        session: Session,
        adjust: QAdjust,
    },
    Ack {
        rn16: u16,
    },
    ReqRn {
        rn16: u16,
    },
    Read {
        bank: MemoryBank,
        word_pointer: u32,
        word_count: u8,
        rn16: u16,
    },
    Nak,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Query { .. } => "Query",
            Command::QueryRep { .. } => "QueryRep",
            Command::QueryAdjust { .. } => "QueryAdjust",
            Command::Ack { .. } => "ACK",
            Command::ReqRn { .. } => "Req_RN",
            Command::Read { .. } => "Read",
            Command::Nak => "NAK",
        }
    }

    /// Only Query is preceded by the TRcal symbol.
    pub fn needs_trcal(&self) -> bool {
        matches!(self, Command::Query { .. })
    }

    pub fn bits(&self) -> Vec<bool> {
        let mut bits = Vec::with_capacity(64);
        match *self {
            Command::Query {
                divide_ratio,
                line_code,
                trext,
                select,
                session,
                target,
                q,
            } => {
                push_bits(&mut bits, 0b1000, 4);
                bits.push(divide_ratio.bit());
                push_bits(&mut bits, line_code.miller_field(), 2);
                bits.push(trext);
                push_bits(&mut bits, select.field(), 2);
                push_bits(&mut bits, u32::from(session.index()), 2);
                bits.push(target == Target::B);
                push_bits(&mut bits, u32::from(q.min(15)), 4);
                let crc = crc5(&bits);
                push_bits(&mut bits, u32::from(crc), 5);
            }
            Command::QueryRep { session } => {
                push_bits(&mut bits, 0b00, 2);
                push_bits(&mut bits, u32::from(session.index()), 2);
            }
            Command::QueryAdjust { session, adjust } => {
                push_bits(&mut bits, 0b1001, 4);
                push_bits(&mut bits, u32::from(session.index()), 2);
                let updn = match adjust {
                    QAdjust::Up => 0b110,
                    QAdjust::Unchanged => 0b000,
                    QAdjust::Down => 0b011,
                };
                push_bits(&mut bits, updn, 3);
            }
            Command::Ack { rn16 } => {
                push_bits(&mut bits, 0b01, 2);
                push_bits(&mut bits, u32::from(rn16), 16);
            }
            Command::ReqRn { rn16 } => {
                push_bits(&mut bits, 0b1100_0001, 8);
                push_bits(&mut bits, u32::from(rn16), 16);
                append_crc16(&mut bits);
            }
            Command::Read {
                bank,
                word_pointer,
                word_count,
                rn16,
            } => {
                push_bits(&mut bits, 0b1100_0010, 8);
                let bank = match bank {
                    MemoryBank::Reserved => 0b00,
                    MemoryBank::Epc => 0b01,
                    MemoryBank::Tid => 0b10,
                    MemoryBank::User => 0b11,
                };
                push_bits(&mut bits, bank, 2);
                bits.extend(ebv(word_pointer));
                push_bits(&mut bits, u32::from(word_count), 8);
                push_bits(&mut bits, u32::from(rn16), 16);
                append_crc16(&mut bits);
            }
            Command::Nak => push_bits(&mut bits, 0b1100_0000, 8),
        }
        bits
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Query { session, target, q, .. } => {
                write!(f, "Query(Q={}, {}, target {:?})", q, session, target)
            }
            Command::QueryRep { session } => write!(f, "QueryRep({})", session),
            Command::QueryAdjust { session, adjust } => {
                write!(f, "QueryAdjust({}, {:?})", session, adjust)
            }
            Command::Ack { rn16 } | Command::ReqRn { rn16 } => {
                write!(f, "{}(RN16={:04X})", self.name(), rn16)
            }
            Command::Read {
                bank,
                word_pointer,
                word_count,
                ..
            } => write!(f, "Read({:?}, ptr={}, n={})", bank, word_pointer, word_count),
            Command::Nak => write!(f, "NAK"),
        }
    }
}

fn append_crc16(bits: &mut Vec<bool>) {
    let crc = crc16(bits);
    push_bits(bits, u32::from(crc), 16);
}

/// Extensible bit vector: 7 value bits per byte, MSB set on all but the last.
fn ebv(value: u32) -> Vec<bool> {
    let mut groups = vec![value & 0x7F];
    let mut rest = value >> 7;
    while rest > 0 {
        groups.push(rest & 0x7F);
        rest >>= 7;
    }
    let mut bits = Vec::with_capacity(groups.len() * 8);
    for (i, group) in groups.iter().rev().enumerate() {
        bits.push(i + 1 < groups.len());
        push_bits(&mut bits, *group, 7);
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc::{bits_to_u32, crc16_check};

    fn query(q: u8) -> Command {
        Command::Query {
            divide_ratio: DivideRatio::Dr8,
            line_code: LineCode::Fm0,
            trext: false,
            select: Select::All,
            session: Session::S0,
            target: Target::A,
            q,
        }
    }

    #[test]
    fn query_layout_and_crc5() {
        let bits = query(4).bits();
        assert_eq!(bits.len(), 22);
        assert_eq!(bits_to_u32(&bits[..4]), 0b1000);
        assert_eq!(bits_to_u32(&bits[13..17]), 4);
        assert_eq!(crc5(&bits), 0);
    }

    #[test]
    fn query_fields_land_in_place() {
        let bits = Command::Query {
            divide_ratio: DivideRatio::Dr64Over3,
            line_code: LineCode::Miller(4),
            trext: true,
            select: Select::Asserted,
            session: Session::S2,
            target: Target::B,
            q: 15,
        }
        .bits();
        assert!(bits[4]);
        assert_eq!(bits_to_u32(&bits[5..7]), 0b10);
        assert!(bits[7]);
        assert_eq!(bits_to_u32(&bits[8..10]), 0b11);
        assert_eq!(bits_to_u32(&bits[10..12]), 2);
        assert!(bits[12]);
        assert_eq!(bits_to_u32(&bits[13..17]), 15);
    }

    #[test]
    fn short_commands() {
        assert_eq!(Command::QueryRep { session: Session::S1 }.bits(), vec![false, false, false, true]);

        let adjust = Command::QueryAdjust {
            session: Session::S0,
            adjust: QAdjust::Up,
        }
        .bits();
        assert_eq!(adjust.len(), 9);
        assert_eq!(bits_to_u32(&adjust[6..]), 0b110);

        let ack = Command::Ack { rn16: 0xABCD }.bits();
        assert_eq!(ack.len(), 18);
        assert_eq!(bits_to_u32(&ack[..2]), 0b01);
        assert_eq!(bits_to_u32(&ack[2..]), 0xABCD);

        assert_eq!(bits_to_u32(&Command::Nak.bits()), 0b1100_0000);
    }

    #[test]
    fn req_rn_and_read_carry_crc16() {
        let req = Command::ReqRn { rn16: 0x1234 }.bits();
        assert_eq!(req.len(), 40);
        assert!(crc16_check(&req));

        let read = Command::Read {
            bank: MemoryBank::Tid,
            word_pointer: 0,
            word_count: 2,
            rn16: 0x1234,
        }
        .bits();
        assert_eq!(read.len(), 8 + 2 + 8 + 8 + 16 + 16);
        assert!(crc16_check(&read));
    }

    #[test]
    fn ebv_extends_past_127() {
        assert_eq!(ebv(5).len(), 8);
        let wide = ebv(200);
        assert_eq!(wide.len(), 16);
        assert!(wide[0]);
        assert!(!wide[8]);
        assert_eq!(bits_to_u32(&wide[1..8]), 1);
        assert_eq!(bits_to_u32(&wide[9..16]), 200 - 128);
    }
}

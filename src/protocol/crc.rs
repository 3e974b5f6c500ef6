//! Gen2 CRCs over bit sequences (MSB first)

/// CCITT polynomial x^16 + x^12 + x^5 + 1
const CRC16_POLY: u16 = 0x1021;
/// Register value left by a frame that carries a correct CRC-16
pub const CRC16_RESIDUE: u16 = 0x1D0F;

/// x^5 + x^3 + 1
const CRC5_POLY: u8 = 0b01001;
const CRC5_PRESET: u8 = 0b01001;

fn crc16_register(bits: &[bool]) -> u16 {
    bits.iter().fold(0xFFFF, |mut crc, &bit| {
        let feedback = ((crc >> 15) & 1) ^ u16::from(bit);
        crc <<= 1;
        if feedback == 1 {
            crc ^= CRC16_POLY;
        }
        crc
    })
}

/// CRC-16 as transmitted: preset 0xFFFF, ones-complemented result.
pub fn crc16(bits: &[bool]) -> u16 {
    !crc16_register(bits)
}

/// True when `bits` (payload followed by its CRC-16) leaves the expected residue.
pub fn crc16_check(bits: &[bool]) -> bool {
    bits.len() > 16 && crc16_register(bits) == CRC16_RESIDUE
}

/// CRC-5 protecting the Query command: preset 0b01001, no inversion.
pub fn crc5(bits: &[bool]) -> u8 {
    bits.iter().fold(CRC5_PRESET, |mut crc, &bit| {
        let feedback = ((crc >> 4) & 1) ^ u8::from(bit);
        crc = (crc << 1) & 0x1F;
        if feedback == 1 {
            crc ^= CRC5_POLY;
        }
        crc
    })
}

/// Append the `width` low bits of `value`, MSB first.
pub fn push_bits(out: &mut Vec<bool>, value: u32, width: usize) {
    out.extend((0..width).rev().map(|i| (value >> i) & 1 == 1));
}

/// Read `bits` (MSB first) as an unsigned integer.
pub fn bits_to_u32(bits: &[bool]) -> u32 {
    bits.iter().fold(0, |acc, &b| (acc << 1) | u32::from(b))
}

pub fn bytes_to_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for &byte in bytes {
        push_bits(&mut bits, u32::from(byte), 8);
    }
    bits
}

/// Pack bits into bytes, MSB first. A trailing partial byte is zero padded.
pub fn bits_to_bytes(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            let value = bits_to_u32(chunk) as u8;
            value << (8 - chunk.len())
        })
        .collect()
}

/// Payload followed by its CRC-16
pub fn with_crc16(payload: &[bool]) -> Vec<bool> {
    let mut bits = payload.to_vec();
    push_bits(&mut bits, u32::from(crc16(payload)), 16);
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_check_value() {
        // CRC-16/GENIBUS check value for the ASCII string "123456789".
        assert_eq!(crc16(&bytes_to_bits(b"123456789")), 0xD64E);
    }

    #[test]
    fn crc16_residue_accepts_framed_payload() {
        let payload = bytes_to_bits(&[0x30, 0x00, 0xE2, 0x00, 0x68, 0x94]);
        let frame = with_crc16(&payload);
        assert_eq!(crc16_register(&frame), CRC16_RESIDUE);
        assert!(crc16_check(&frame));
    }

    #[test]
    fn crc16_detects_every_single_bit_flip() {
        let frame = with_crc16(&bytes_to_bits(&[0xAB, 0xCD]));
        for i in 0..frame.len() {
            let mut corrupted = frame.clone();
            corrupted[i] = !corrupted[i];
            assert!(!crc16_check(&corrupted), "flip at {} not detected", i);
        }
    }

    #[test]
    fn crc5_check_value_and_residue() {
        // CRC-5/EPC-C1G2 check value is zero.
        assert_eq!(crc5(&bytes_to_bits(b"123456789")), 0);

        let mut query = Vec::new();
        push_bits(&mut query, 0b1000_0_00_0_00_00_0_0100, 17);
        let crc = crc5(&query);
        push_bits(&mut query, u32::from(crc), 5);
        assert_eq!(crc5(&query), 0);
    }

    #[test]
    fn bit_packing_is_msb_first() {
        let mut bits = Vec::new();
        push_bits(&mut bits, 0b1011, 4);
        assert_eq!(bits, vec![true, false, true, true]);
        assert_eq!(bits_to_u32(&bits), 0b1011);
        assert_eq!(bits_to_bytes(&bits), vec![0b1011_0000]);
        assert_eq!(bits_to_bytes(&bytes_to_bits(&[0x5A, 0x01])), vec![0x5A, 0x01]);
    }
}

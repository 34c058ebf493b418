//! OSDP frame integrity checks
//!
//! A frame ends with either:
//! 1. An 8-bit checksum: the two's complement of the sum of all preceding
//!    bytes, so the byte sum of the whole frame is zero.
//! 2. A CRC-16 (CRC-16/AUG-CCITT: poly 0x1021, init 0x1D0F, no reflection),
//!    transmitted little-endian.

use tracing::trace;

const CRC_INIT: u16 = 0x1D0F;
const CRC_POLY: u16 = 0x1021;

/// Precomputed CRC table
static CRC_TABLE: [u16; 256] = build_crc_table();

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut v = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            v = if v & 0x8000 != 0 { (v << 1) ^ CRC_POLY } else { v << 1 };
            bit += 1;
        }
        table[i] = v;
        i += 1;
    }
    table
}

/// Calculate the 8-bit checksum
///
/// # Examples
///
/// ```
/// use osdp_core::checksum;
///
/// let frame = [0x53, 0x01, 0x08, 0x00, 0x04, 0x60, 0x00];
/// let cs = checksum::checksum8(&frame);
/// let sum = frame.iter().fold(cs, |acc, b| acc.wrapping_add(*b));
/// assert_eq!(sum, 0);
/// ```
pub fn checksum8(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    let checksum = (!sum).wrapping_add(1);

    trace!(
        len = data.len(),
        checksum = format!("0x{:02X}", checksum),
        "Calculated checksum"
    );

    checksum
}

/// Calculate the CRC-16
///
/// # Examples
///
/// ```
/// use osdp_core::checksum;
///
/// assert_eq!(checksum::crc16(b"123456789"), 0xE5CC);
/// ```
pub fn crc16(data: &[u8]) -> u16 {
    let crc = data.iter().fold(CRC_INIT, |crc, b| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 8) as u8) ^ b) as usize]
    });

    trace!(
        len = data.len(),
        crc = format!("0x{:04X}", crc),
        "Calculated CRC"
    );

    crc
}

/// Verify an 8-bit checksum
pub fn verify_checksum8(data: &[u8], expected: u8) -> bool {
    checksum8(data) == expected
}

/// Verify a CRC-16
pub fn verify_crc16(data: &[u8], expected: u16) -> bool {
    crc16(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_sums_to_zero() {
        let data = [0x53, 0x81, 0x08, 0x00, 0x04, 0x40];
        let cs = checksum8(&data);
        let total = data.iter().fold(cs, |acc, b| acc.wrapping_add(*b));

        assert_eq!(total, 0);
    }

    #[test]
    fn test_checksum_empty() {
        assert_eq!(checksum8(&[]), 0);
    }

    #[test]
    fn test_checksum_verify() {
        let data = [0xAB, 0xCD, 0x01];
        let cs = checksum8(&data);

        assert!(verify_checksum8(&data, cs));
        assert!(!verify_checksum8(&data, cs.wrapping_add(1)));
    }

    #[test]
    fn test_crc_check_value() {
        // CRC-16/AUG-CCITT check value
        assert_eq!(crc16(b"123456789"), 0xE5CC);
    }

    #[test]
    fn test_crc_empty_is_init() {
        assert_eq!(crc16(&[]), CRC_INIT);
    }

    #[test]
    fn test_crc_detects_single_bit_flip() {
        let data = [0x53, 0x01, 0x08, 0x00, 0x04, 0x60];
        let crc = crc16(&data);

        for i in 0..data.len() {
            let mut corrupted = data;
            corrupted[i] ^= 0x01;
            assert!(!verify_crc16(&corrupted, crc), "flip at byte {i} not detected");
        }
    }
}

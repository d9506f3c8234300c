//! # CRC-8 Implementation
//!
//! Checksum appended to every UAVTalk packet.
//!
//! **Polynomial**: 0x07 (x^8 + x^2 + x + 1)
//! **Initial Value**: 0x00
//!
//! Covers every byte of the packet from the sync byte through the end of
//! the payload.

/// CRC-8 polynomial
const CRC8_POLY: u8 = 0x07;

/// Precomputed CRC8 lookup table
const CRC8_TABLE: [u8; 256] = generate_crc8_table();

const fn generate_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u8;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ CRC8_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Calculate the CRC-8 of `data`
///
/// # Examples
///
/// ```
/// use uavtalk_gcs::uavtalk::crc::crc8;
///
/// assert_eq!(crc8(b"123456789"), 0xF4);
/// ```
pub fn crc8(data: &[u8]) -> u8 {
    crc8_update(0, data)
}

/// Continue a running CRC with more bytes
pub fn crc8_update(crc: u8, data: &[u8]) -> u8 {
    data.iter()
        .fold(crc, |crc, &byte| CRC8_TABLE[(crc ^ byte) as usize])
}

/// Bitwise CRC-8, used to check the table in tests
#[cfg(test)]
fn crc8_slow(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;

    for &byte in data {
        crc ^= byte;

        for _ in 0..8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ CRC8_POLY;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc8_empty() {
        assert_eq!(crc8(&[]), 0x00);
    }

    #[test]
    fn test_crc8_check_value() {
        assert_eq!(crc8(b"123456789"), 0xF4);
        assert_eq!(crc8_slow(b"123456789"), 0xF4);
    }

    #[test]
    fn test_crc8_lookup_table_matches_slow() {
        let test_data = [
            vec![0x3C, 0x20, 0x0A, 0x00],
            vec![0xFF, 0xFE, 0xFD],
            vec![0x00; 24],
            vec![0xFF; 10],
            (0..=255u8).collect::<Vec<_>>(),
        ];

        for data in test_data.iter() {
            assert_eq!(crc8(data), crc8_slow(data), "CRC mismatch for data: {:?}", data);
        }
    }

    #[test]
    fn test_crc8_update_is_incremental() {
        let data = b"UAVTalk packet";
        let (head, tail) = data.split_at(5);
        assert_eq!(crc8_update(crc8(head), tail), crc8(data));
    }

    #[test]
    fn test_crc8_detects_single_bit_flip() {
        let data = [0x3C, 0x20, 0x1A, 0x00, 0x48, 0x55, 0xFC, 0xDE, 0x00, 0x00];
        let crc = crc8(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data;
                flipped[byte] ^= 1 << bit;
                assert_ne!(crc8(&flipped), crc, "flip at byte {} bit {}", byte, bit);
            }
        }
    }
}

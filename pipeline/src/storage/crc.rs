//! CRC7 for command/response frames and CRC16 for data blocks

/// CRC-7 with generator x^7 + x^3 + 1 (0x09), MSB first, initial value 0.
///
/// The result is the bare 7-bit value; frames carry it as `(crc << 1) | 1`.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        for bit in (0..8).rev() {
            let feedback = ((byte >> bit) & 1) ^ ((crc >> 6) & 1);
            crc = (crc << 1) & 0x7F;
            if feedback != 0 {
                crc ^= 0x09;
            }
        }
    }
    crc
}

/// CRC-16-CCITT (0x1021), initial value 0, as appended to every data block
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
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
    fn test_crc7_reset_command() {
        assert_eq!(crc7(&[0x40, 0x00, 0x00, 0x00, 0x00]), 0x4A);
    }

    #[test]
    fn test_crc7_interface_condition() {
        assert_eq!(crc7(&[0x48, 0x00, 0x00, 0x01, 0xAA]), 0x43);
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_crc16_erased_block() {
        assert_eq!(crc16(&[0xFF; 512]), 0x7FA1);
    }
}

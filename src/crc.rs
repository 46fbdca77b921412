//! The two checksum schemes used by JK-BMS frames.
//!
//! BLE notification frames and the first 300 bytes of a serial long frame
//! are closed by a plain 8-bit sum checksum. Everything Modbus-flavored
//! (command envelopes, command echoes, the serial long-frame trailer) uses
//! CRC-16/Modbus, transmitted as two little-endian bytes.

/// Sum of all bytes modulo 256.
pub fn sum8(buffer: &[u8]) -> u8 {
    let mut checksum: u8 = 0;
    for b in buffer {
        checksum = checksum.wrapping_add(*b);
    }
    checksum
}

/// CRC-16/Modbus: polynomial 0x8005 reflected (0xA001), initial value
/// 0xFFFF, no final XOR.
pub fn crc16_modbus(buffer: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for b in buffer {
        crc ^= *b as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// CRC-16/Modbus in wire order (low byte first).
pub fn crc16_modbus_le(buffer: &[u8]) -> [u8; 2] {
    crc16_modbus(buffer).to_le_bytes()
}

pub(crate) fn validate_sum8(buffer: &[u8]) -> Result<(), crate::Error> {
    let checksum = sum8(&buffer[..buffer.len() - 1]);
    let received = buffer[buffer.len() - 1];
    if checksum != received {
        log::warn!(
            "Invalid checksum - calculated={checksum:02X?} received={received:02X?} buffer={buffer:02X?}"
        );
        return Err(crate::Error::ChecksumMismatch {
            calculated: checksum,
            received,
        });
    }
    Ok(())
}

pub(crate) fn validate_crc16(buffer: &[u8]) -> Result<(), crate::Error> {
    let crc = crc16_modbus(&buffer[..buffer.len() - 2]);
    let received = u16::from_le_bytes([buffer[buffer.len() - 2], buffer[buffer.len() - 1]]);
    if crc != received {
        log::warn!("Invalid CRC-16 - calculated={crc:04X?} received={received:04X?} buffer={buffer:02X?}");
        return Err(crate::Error::CrcMismatch {
            calculated: crc,
            received,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_check_value() {
        // standard CRC-16/Modbus check input
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
    }

    #[test]
    fn crc16_reference_values() {
        assert_eq!(crc16_modbus(&[]), 0xFFFF);
        assert_eq!(crc16_modbus(&[0u8; 8]), 0x0B40);
        // captured "read status" command to bus address 1
        let cmd = [0x01, 0x10, 0x16, 0x20, 0x00, 0x01, 0x02, 0x00, 0x00];
        assert_eq!(crc16_modbus_le(&cmd), [0xD6, 0xF1]);
        // captured "read settings" command
        let cmd = [0x01, 0x10, 0x16, 0x1E, 0x00, 0x01, 0x02, 0x00, 0x00];
        assert_eq!(crc16_modbus_le(&cmd), [0xD2, 0x2F]);
    }

    #[test]
    fn crc16_round_trip() {
        let mut msg = vec![0x01, 0x10, 0x10, 0x70, 0x00, 0x02];
        msg.extend_from_slice(&crc16_modbus_le(&msg));
        assert_eq!(&msg[6..], [0x44, 0xD3]);
        assert!(validate_crc16(&msg).is_ok());
        msg[2] ^= 0x01;
        assert!(validate_crc16(&msg).is_err());
    }

    #[test]
    fn sum8_concatenation() {
        let a = [0x55, 0xAA, 0xEB, 0x90, 0x02];
        let b = [0xFF, 0x01, 0x80];
        let mut ab = a.to_vec();
        ab.extend_from_slice(&b);
        assert_eq!(sum8(&ab), sum8(&a).wrapping_add(sum8(&b)));
    }

    #[test]
    fn sum8_validation() {
        let mut buf = vec![0x10, 0x20, 0x30];
        buf.push(sum8(&buf));
        assert!(validate_sum8(&buf).is_ok());
        buf[0] = 0x11;
        assert!(validate_sum8(&buf).is_err());
    }
}

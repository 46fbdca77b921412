//! BLE transport framing.
//!
//! Record frames arrive as GATT notifications of arbitrary size (typically
//! 20-byte MTU slices) and have to be reassembled before validation.
//! Commands to the BMS travel as single 20-byte writes with their own
//! header and a sum checksum.

use crate::crc::sum8;
use crate::protocol::{
    frame_type, validate_body, Switch, FRAME_HEADER, MAX_RESPONSE_SIZE, MIN_RESPONSE_SIZE,
};
use crate::Error;

/// Header of a command frame written to the BMS (record header reversed).
pub const COMMAND_HEADER: [u8; 4] = [0xAA, 0x55, 0x90, 0xEB];

/// Every BLE command is padded to this length, checksum included.
pub const COMMAND_LENGTH: usize = 20;

/// Request the device-info record.
pub const REGISTER_DEVICE_INFO: u8 = 0x97;
/// Request the settings record and start periodic sample notifications.
pub const REGISTER_CELL_INFO: u8 = 0x96;

const REGISTER_CHARGE: u8 = 0x1D;
const REGISTER_DISCHARGE: u8 = 0x1E;
const REGISTER_BALANCE: u8 = 0x1F;
const REGISTER_FLOAT_CHARGE: u8 = 0x30;

/// Reassembles record frames from notification chunks.
///
/// A chunk that starts with the record header begins a new frame and drops
/// whatever was buffered. Once at least 300 bytes are buffered the sum
/// checksum at byte 299 is checked; on a mismatch the buffer is scanned for
/// the next header and resynchronized, or discarded entirely when no header
/// is present.
#[derive(Debug, Default)]
pub struct NotificationAssembler {
    buffer: Vec<u8>,
}

impl NotificationAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one notification chunk; returns a validated 300-byte frame
    /// when one completes.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        log::trace!("notification chunk: {chunk:02X?}");
        if chunk.starts_with(&FRAME_HEADER) {
            if !self.buffer.is_empty() {
                log::debug!(
                    "new frame header, dropping {} buffered bytes",
                    self.buffer.len()
                );
            }
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(chunk);

        loop {
            if self.buffer.len() < MIN_RESPONSE_SIZE {
                return None;
            }
            match validate_body(&self.buffer) {
                Ok(()) => {
                    let frame = self.buffer[..MIN_RESPONSE_SIZE].to_vec();
                    log::debug!(
                        "assembled frame type {} ({} bytes buffered)",
                        frame_type(&frame),
                        self.buffer.len()
                    );
                    self.buffer.clear();
                    return Some(frame);
                }
                Err(_) => {
                    // checksum already logged; hunt for the next header
                    if let Some(i) = self
                        .buffer
                        .windows(FRAME_HEADER.len())
                        .skip(1)
                        .position(|w| w == FRAME_HEADER)
                    {
                        self.buffer.drain(..i + 1);
                        // retry with the resynchronized buffer
                    } else if self.buffer.len() > MAX_RESPONSE_SIZE {
                        log::warn!("no frame header in {} bytes, discarding", self.buffer.len());
                        self.buffer.clear();
                        return None;
                    } else {
                        return None;
                    }
                }
            }
        }
    }
}

/// Build a 20-byte command frame: header, register, value length, value
/// padded to 19 bytes, sum checksum.
pub fn ble_command(register: u8, value: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(COMMAND_LENGTH);
    frame.extend_from_slice(&COMMAND_HEADER);
    frame.push(register);
    frame.push(value.len() as u8);
    frame.extend_from_slice(value);
    frame.resize(COMMAND_LENGTH - 1, 0);
    frame.push(sum8(&frame));
    frame
}

/// Build the switch-write command for the BLE protocol.
///
/// Heating and display have no BLE register and are rejected; on BLE the
/// float-charge register is written directly, no flag merge involved.
pub fn ble_switch_command(switch: Switch, enable: bool) -> Result<Vec<u8>, Error> {
    let register = match switch {
        Switch::Charge => REGISTER_CHARGE,
        Switch::Discharge => REGISTER_DISCHARGE,
        Switch::Balance => REGISTER_BALANCE,
        Switch::FloatCharge => REGISTER_FLOAT_CHARGE,
        Switch::Heating | Switch::Display => return Err(Error::UnsupportedSwitch(switch)),
    };
    Ok(ble_command(register, &[enable as u8, 0, 0, 0]))
}

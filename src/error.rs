use crate::protocol::Switch;

/// Errors of the pure protocol layer (framing validation, decoding,
/// command construction). Transport and scheduling errors live in
/// [`crate::serial`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The frame is shorter than the minimum length required to decode the
    /// record kind claimed by its discriminant byte.
    #[error("frame too short for record type {kind}: {len} bytes, need {need}")]
    FrameTooShort { kind: u8, len: usize, need: usize },
    /// The trailing sum checksum does not match the frame contents.
    #[error("checksum mismatch: calculated {calculated:02X}, received {received:02X}")]
    ChecksumMismatch { calculated: u8, received: u8 },
    /// The trailing CRC-16/Modbus does not match the frame contents.
    #[error("CRC-16 mismatch: calculated {calculated:04X}, received {received:04X}")]
    CrcMismatch { calculated: u16, received: u16 },
    /// A multi-flag switch write was requested before any settings snapshot
    /// provided the current flag register to merge with.
    #[error("switch '{0}' shares a flag register; a settings snapshot is required first")]
    SettingsRequired(Switch),
    /// The switch cannot be driven over this protocol variant.
    #[error("switch '{0}' is not supported by this protocol")]
    UnsupportedSwitch(Switch),
}

//! Wire format of the JK-BMS register protocol.
//!
//! Both transports carry the same 300-byte record body: a `55 AA EB 90`
//! header, a record-type discriminant at offset 4, a fixed-offset register
//! image, and a trailing sum checksum at offset 299. The serial variant
//! appends a command echo and a CRC-16/Modbus trailer for a total of 308
//! bytes.
//!
//! Field offsets and scale factors follow the vendor register map; newer
//! firmware (11.x, 32-cell hardware) inserts an extra block of temperature
//! sensors which shifts most live-sample fields by 32 bytes.

use crate::crc::{crc16_modbus_le, sum8};
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Header of every record frame (notification or serial long frame).
pub const FRAME_HEADER: [u8; 4] = [0x55, 0xAA, 0xEB, 0x90];

/// Offset of the record-type discriminant byte.
pub const FRAME_TYPE_OFFSET: usize = 4;

pub const FRAME_TYPE_SETTINGS: u8 = 0x01;
pub const FRAME_TYPE_SAMPLE: u8 = 0x02;
pub const FRAME_TYPE_DEVICE_INFO: u8 = 0x03;

/// Minimum record body length; the sum checksum sits at the last byte.
pub const MIN_RESPONSE_SIZE: usize = 300;
/// Some firmware pads notifications beyond 300 bytes; tolerate up to this.
pub const MAX_RESPONSE_SIZE: usize = 320;
/// Total serial long-frame length including the CRC-16 trailer zone.
pub const SERIAL_FRAME_LENGTH: usize = 308;

/// Periodic read commands (register block reads, before address/CRC wrapping).
pub const COMMAND_STATUS: [u8; 8] = [0x10, 0x16, 0x20, 0x00, 0x01, 0x02, 0x00, 0x00];
pub const COMMAND_SETTINGS: [u8; 8] = [0x10, 0x16, 0x1E, 0x00, 0x01, 0x02, 0x00, 0x00];
pub const COMMAND_DEVICE_INFO: [u8; 8] = [0x10, 0x16, 0x1C, 0x00, 0x01, 0x02, 0x00, 0x00];

/// Bits of the shared 16-bit flag register at serial offset 0x114.
pub const FLOAT_CHARGE_FLAG: u16 = 0x0200;
pub const HEATING_FLAG: u16 = 0x0001;
pub const DISPLAY_FLAG: u16 = 0x0010;

const MIN_SETTINGS_SIZE: usize = 284;
const MIN_DEVICE_INFO_SIZE: usize = 117;
const MIN_SAMPLE_SIZE_LEGACY: usize = 215;
const MIN_SAMPLE_SIZE_SHIFTED: usize = 260;

/// Raw temperature value reported when a sensor channel is absent.
const TEMPERATURE_ABSENT: i16 = -2000;

/// Field layout of the live-sample record, firmware dependent.
///
/// Firmware 11.x (32-cell hardware) carries three extra temperature sensor
/// slots and a relocated MOSFET temperature, shifting later fields by 32
/// bytes. Resolved once per device from [`DeviceInfo::layout`]; when the
/// firmware is unknown the newer layout is assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    Legacy,
    #[default]
    Shifted,
}

impl Layout {
    /// Byte shift applied to the firmware-dependent sample fields.
    pub const fn shift(self) -> usize {
        match self {
            Layout::Legacy => 0,
            Layout::Shifted => 32,
        }
    }

    /// Derive the layout from a firmware version string such as `"11.26"`.
    pub fn from_sw_version(sw_version: &str) -> Option<Self> {
        let major: u32 = sw_version.split('.').next()?.trim().parse().ok()?;
        Some(if major >= 11 {
            Layout::Shifted
        } else {
            Layout::Legacy
        })
    }

    fn min_sample_size(self) -> usize {
        match self {
            Layout::Legacy => MIN_SAMPLE_SIZE_LEGACY,
            Layout::Shifted => MIN_SAMPLE_SIZE_SHIFTED,
        }
    }
}

/// A controllable switch of the BMS, usually a MOSFET or relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Switch {
    Charge,
    Discharge,
    Balance,
    FloatCharge,
    Heating,
    Display,
}

impl Switch {
    pub const ALL: [Switch; 6] = [
        Switch::Charge,
        Switch::Discharge,
        Switch::Balance,
        Switch::FloatCharge,
        Switch::Heating,
        Switch::Display,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Switch::Charge => "charge",
            Switch::Discharge => "discharge",
            Switch::Balance => "balance",
            Switch::FloatCharge => "float_charge",
            Switch::Heating => "heating",
            Switch::Display => "display",
        }
    }

    /// Holding register driven by a single-register write, for switches
    /// that have one on the serial protocol.
    fn serial_register(self) -> Option<u8> {
        match self {
            Switch::Charge => Some(0x70),
            Switch::Discharge => Some(0x74),
            Switch::Balance => Some(0x78),
            _ => None,
        }
    }

    /// Bit within the shared flag register at 0x114, for switches without
    /// a register of their own.
    fn flag_bit(self) -> Option<u16> {
        match self {
            Switch::FloatCharge => Some(FLOAT_CHARGE_FLAG),
            Switch::Heating => Some(HEATING_FLAG),
            Switch::Display => Some(DISPLAY_FLAG),
            _ => None,
        }
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Switch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Switch::ALL
            .into_iter()
            .find(|sw| sw.name() == s)
            .ok_or_else(|| format!("unknown switch '{s}'"))
    }
}

/// A switch-write intent, queued for transmission on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCommand {
    pub address: u8,
    pub switch: Switch,
    pub enable: bool,
}

fn u16_le(buf: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([buf[i], buf[i + 1]])
}

fn i16_le(buf: &[u8], i: usize) -> i16 {
    i16::from_le_bytes([buf[i], buf[i + 1]])
}

fn u32_le(buf: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
}

fn i32_le(buf: &[u8], i: usize) -> i32 {
    i32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
}

/// 0.1 °C fixed point with the absent-sensor sentinel mapped to NaN.
fn temperature(raw: i16) -> f32 {
    if raw == TEMPERATURE_ABSENT {
        f32::NAN
    } else {
        raw as f32 / 10.0
    }
}

/// NUL-terminated string in a fixed-width field.
fn read_str(buf: &[u8], offset: usize, width: usize) -> String {
    let slot = &buf[offset..(offset + width).min(buf.len())];
    let end = slot.iter().position(|b| *b == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

fn validate_len(buf: &[u8], kind: u8, need: usize) -> Result<(), Error> {
    if buf.len() < need {
        log::warn!(
            "Frame too short for record type {kind} - received={} required={need}",
            buf.len()
        );
        return Err(Error::FrameTooShort {
            kind,
            len: buf.len(),
            need,
        });
    }
    Ok(())
}

/// Record-type discriminant of a frame, 0 if the frame is too short.
pub fn frame_type(frame: &[u8]) -> u8 {
    frame.get(FRAME_TYPE_OFFSET).copied().unwrap_or(0)
}

/// Closed union of everything a validated frame can decode to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Settings(Settings),
    Sample(Sample),
    DeviceInfo(DeviceInfo),
    Unknown { kind: u8 },
}

/// Min/mean/max across the MOSFET sensor and all populated channels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TemperatureStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

/// One live telemetry snapshot (record type 2).
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    /// Bus address, 0 when the frame carries no address byte (BLE).
    pub address: u8,
    /// Pack voltage in V.
    pub voltage: f32,
    /// Pack current in A, negative while charging.
    pub current: f32,
    /// Pack power in W.
    pub power: f32,
    /// Per-cell voltages in mV, one entry per known cell.
    pub cell_voltages: Vec<u16>,
    /// Per-cell wire resistances in mΩ.
    pub cell_resistances: Vec<u16>,
    pub cell_average_voltage: f32,
    pub max_voltage_difference: f32,
    pub max_voltage_cell: u8,
    pub min_voltage_cell: u8,
    /// Raw cell-presence bitmask.
    pub battery_status: u32,
    /// Battery temperature sensors in °C, NaN for absent channels.
    /// Two channels on legacy firmware, five on 11.x.
    pub temperatures: Vec<f32>,
    pub mos_temperature: f32,
    pub temperature_stats: TemperatureStats,
    /// Raw sensor-presence flags.
    pub temp_sensor_flags: u8,
    /// State of charge in percent, derived from charge/capacity when
    /// possible.
    pub soc_percent: f32,
    /// Remaining charge in Ah.
    pub charge: f32,
    /// Computed pack capacity in Ah.
    pub capacity: f32,
    /// Lifetime charge meter in Ah.
    pub cycle_capacity: f32,
    pub num_cycles: u32,
    /// Raw 32-bit alarm bitmask, 0 when no alarm is active.
    pub alarm: u32,
    /// Balancer current in A.
    pub balance_current: f32,
    pub balance_state: u8,
    /// Switch states taken from the most recent settings snapshot.
    pub switches: BTreeMap<Switch, bool>,
    /// BMS uptime.
    pub uptime: Duration,
    /// Receipt time of the frame.
    pub timestamp: DateTime<Utc>,
}

/// Decode a live sample (record type 2) from a validated frame.
///
/// `num_cells` comes from a previously decoded [`Settings`]; `settings`
/// additionally contributes the switch-state map when available.
pub fn decode_sample(
    buf: &[u8],
    num_cells: u8,
    layout: Layout,
    settings: Option<&Settings>,
    has_float_charger: bool,
) -> Result<Sample, Error> {
    validate_len(buf, FRAME_TYPE_SAMPLE, layout.min_sample_size())?;
    let off = layout.shift();
    log::debug!("decode sample: layout={layout:?} shift={off} num_cells={num_cells}");

    let num_cells = usize::from(num_cells).min((buf.len() - 6) / 2);
    let cell_voltages: Vec<u16> = (0..num_cells).map(|i| u16_le(buf, 6 + i * 2)).collect();
    let cell_resistances: Vec<u16> = (0..num_cells).map(|i| u16_le(buf, 80 + i * 2)).collect();

    let mut temperatures = vec![
        temperature(i16_le(buf, 130 + off)),
        temperature(i16_le(buf, 132 + off)),
    ];
    if layout == Layout::Shifted {
        temperatures.push(temperature(i16_le(buf, 222 + off)));
        temperatures.push(temperature(i16_le(buf, 224 + off)));
        temperatures.push(temperature(i16_le(buf, 226 + off)));
    }
    let mos_offset = match layout {
        Layout::Shifted => 112,
        Layout::Legacy => 134,
    };
    let mos_temperature = i16_le(buf, mos_offset + off) as f32 / 10.0;

    let mut min = mos_temperature;
    let mut max = mos_temperature;
    let mut sum = mos_temperature;
    let mut count = 1u32;
    for t in temperatures.iter().copied().filter(|t| !t.is_nan()) {
        min = min.min(t);
        max = max.max(t);
        sum += t;
        count += 1;
    }
    let temperature_stats = TemperatureStats {
        min,
        max,
        mean: sum / count as f32,
    };

    let charge = u32_le(buf, 142 + off) as f32 * 1e-3;
    let capacity = u32_le(buf, 146 + off) as f32 * 1e-3;
    let raw_soc = buf[141 + off];
    let soc_percent = if capacity > 0.0 {
        ((charge / capacity * 100.0 * 100.0).round() / 100.0).clamp(0.0, 100.0)
    } else {
        raw_soc as f32
    };

    Ok(Sample {
        address: buf.get(300).copied().unwrap_or(0),
        voltage: u32_le(buf, 118 + off) as f32 * 1e-3,
        power: u32_le(buf, 122 + off) as f32 * 1e-3,
        // the register is discharge-positive; negate for the documented
        // negative-while-charging convention
        current: -(i32_le(buf, 126 + off) as f32 * 1e-3),
        cell_voltages,
        cell_resistances,
        cell_average_voltage: u16_le(buf, 74) as f32 * 1e-3,
        max_voltage_difference: u16_le(buf, 76) as f32 * 1e-3,
        max_voltage_cell: buf[78],
        min_voltage_cell: buf[79],
        battery_status: u32_le(buf, 70),
        temperatures,
        mos_temperature,
        temperature_stats,
        temp_sensor_flags: buf[214],
        soc_percent,
        charge,
        capacity,
        cycle_capacity: u32_le(buf, 154 + off) as f32 * 1e-3,
        num_cycles: u32_le(buf, 150 + off),
        alarm: u32_le(buf, 166),
        balance_current: i16_le(buf, 138 + off) as f32 * 1e-3,
        balance_state: buf[172],
        switches: settings
            .map(|s| s.switch_states(has_float_charger))
            .unwrap_or_default(),
        uptime: Duration::from_secs(u32_le(buf, 162 + off) as u64),
        timestamp: Utc::now(),
    })
}

/// Device configuration snapshot (record type 1), replaced wholesale on
/// each settings poll. Voltages in V, currents in A, temperatures in °C,
/// delays in the unit of the underlying register.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub address: u8,
    pub smart_sleep_voltage: f32,
    pub cell_uvp: f32,
    pub cell_uvp_recovery: f32,
    pub cell_ovp: f32,
    pub cell_ovp_recovery: f32,
    pub balance_trigger_voltage: f32,
    pub soc_full_voltage: f32,
    pub soc_empty_voltage: f32,
    pub charge_request_voltage: f32,
    pub float_voltage: f32,
    pub power_off_voltage: f32,
    pub max_charge_current: f32,
    pub charge_ocp_delay: u32,
    pub charge_ocp_recovery_delay: u32,
    pub max_discharge_current: f32,
    pub discharge_ocp_delay: u32,
    pub discharge_ocp_recovery_delay: u32,
    pub scp_recovery_delay: u32,
    pub max_balance_current: f32,
    pub charge_otp: f32,
    pub charge_otp_recovery: f32,
    pub discharge_otp: f32,
    pub discharge_otp_recovery: f32,
    pub charge_utp: f32,
    pub charge_utp_recovery: f32,
    pub mos_otp: f32,
    pub mos_otp_recovery: f32,
    pub cell_count: u32,
    pub charge_enabled: bool,
    pub discharge_enabled: bool,
    pub balance_enabled: bool,
    pub float_charge_enabled: bool,
    /// Design capacity in Ah.
    pub capacity: f32,
    /// Short-circuit protection delay in µs.
    pub scp_delay: u32,
    pub balance_start_voltage: f32,
    /// Precharge time in s.
    pub precharge_time: u32,
    /// Raw 16-bit multi-flag register at 0x114 (bit 9 = float charge).
    /// Kept verbatim to construct merge writes.
    pub flag_register: u16,
}

impl Settings {
    /// Switch states as read back from this snapshot.
    pub fn switch_states(&self, has_float_charger: bool) -> BTreeMap<Switch, bool> {
        let mut states = BTreeMap::new();
        states.insert(Switch::Charge, self.charge_enabled);
        states.insert(Switch::Discharge, self.discharge_enabled);
        states.insert(Switch::Balance, self.balance_enabled);
        if has_float_charger {
            states.insert(Switch::FloatCharge, self.float_charge_enabled);
        }
        states
    }
}

/// Decode a settings snapshot (record type 1) from a validated frame.
pub fn decode_settings(buf: &[u8]) -> Result<Settings, Error> {
    validate_len(buf, FRAME_TYPE_SETTINGS, MIN_SETTINGS_SIZE)?;

    let volts = |i: usize| i32_le(buf, i) as f32 * 1e-3;
    let amps = volts;
    let degrees = |i: usize| i32_le(buf, i) as f32 / 10.0;
    // enable flags are 32-bit registers, nonzero means on
    let enabled = |i: usize| u32_le(buf, i) != 0;

    let flag_register = u16_le(buf, 282);
    Ok(Settings {
        address: buf[270],
        smart_sleep_voltage: volts(6),
        cell_uvp: volts(10),
        cell_uvp_recovery: volts(14),
        cell_ovp: volts(18),
        cell_ovp_recovery: volts(22),
        balance_trigger_voltage: volts(26),
        soc_full_voltage: volts(30),
        soc_empty_voltage: volts(34),
        charge_request_voltage: volts(38),
        float_voltage: volts(42),
        power_off_voltage: volts(46),
        max_charge_current: amps(50),
        charge_ocp_delay: u32_le(buf, 54),
        charge_ocp_recovery_delay: u32_le(buf, 58),
        max_discharge_current: amps(62),
        discharge_ocp_delay: u32_le(buf, 66),
        discharge_ocp_recovery_delay: u32_le(buf, 70),
        scp_recovery_delay: u32_le(buf, 74),
        max_balance_current: amps(78),
        charge_otp: degrees(82),
        charge_otp_recovery: degrees(86),
        discharge_otp: degrees(90),
        discharge_otp_recovery: degrees(94),
        charge_utp: degrees(98),
        charge_utp_recovery: degrees(102),
        mos_otp: degrees(106),
        mos_otp_recovery: degrees(110),
        cell_count: u32_le(buf, 114),
        charge_enabled: enabled(118),
        discharge_enabled: enabled(122),
        balance_enabled: enabled(126),
        float_charge_enabled: flag_register & FLOAT_CHARGE_FLAG != 0,
        capacity: u32_le(buf, 130) as f32 * 1e-3,
        scp_delay: u32_le(buf, 134),
        balance_start_voltage: volts(138),
        precharge_time: u32_le(buf, 274),
        flag_register,
    })
}

/// Static device identity (record type 3), fetched once per device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub hw_version: String,
    pub sw_version: String,
    pub name: String,
    pub serial_number: String,
    /// BLE pairing key as configured on the device.
    pub pairing_key: String,
    pub address: u8,
    pub has_float_charger: bool,
}

impl DeviceInfo {
    /// Sample field layout implied by the firmware version.
    pub fn layout(&self) -> Layout {
        Layout::from_sw_version(&self.sw_version).unwrap_or_default()
    }
}

/// Decode a device-info record (record type 3) from a validated frame.
pub fn decode_device_info(buf: &[u8]) -> Result<DeviceInfo, Error> {
    validate_len(buf, FRAME_TYPE_DEVICE_INFO, MIN_DEVICE_INFO_SIZE)?;

    let model = read_str(buf, 6, 16);
    // only these models ship the float-charge stage
    let has_float_charger = model.contains("PB2A16S") || model.contains("PB1A16S");
    Ok(DeviceInfo {
        manufacturer: "JK".to_string(),
        model,
        hw_version: read_str(buf, 22, 8),
        sw_version: read_str(buf, 30, 16),
        name: read_str(buf, 46, 40),
        serial_number: read_str(buf, 86, 11),
        pairing_key: read_str(buf, 97, 20),
        address: buf.get(300).copied().unwrap_or(0),
        has_float_charger,
    })
}

/// Apply a flag bit to the current multi-flag register value.
pub fn merge_flag(current: u16, flag: u16, enable: bool) -> u16 {
    if enable {
        current | flag
    } else {
        current & !flag
    }
}

/// Build the register-write command for a switch, before address/CRC
/// wrapping.
///
/// Charge/discharge/balance have a holding register of their own and need
/// no prior state. Float-charge/heating/display share the 16-bit flag
/// register, so the caller must supply its current value from the latest
/// [`Settings`] snapshot; without one the command is rejected rather than
/// sent with a guessed register value.
pub fn switch_command(
    switch: Switch,
    enable: bool,
    flag_register: Option<u16>,
) -> Result<Vec<u8>, Error> {
    if let Some(register) = switch.serial_register() {
        return Ok(vec![
            0x10,
            0x10,
            register,
            0x00,
            0x02,
            0x04,
            0x00,
            0x00,
            0x00,
            enable as u8,
        ]);
    }
    let flag = switch.flag_bit().ok_or(Error::UnsupportedSwitch(switch))?;
    let current = flag_register.ok_or(Error::SettingsRequired(switch))?;
    let merged = merge_flag(current, flag, enable);
    // flag register value travels big-endian, unlike everything else
    Ok(vec![
        0x10,
        0x11,
        0x14,
        0x00,
        0x01,
        0x02,
        (merged >> 8) as u8,
        (merged & 0xFF) as u8,
    ])
}

/// Wrap a command into the bus envelope: `[address, ...command, crc_lo, crc_hi]`.
pub fn wrap_command(address: u8, command: &[u8]) -> Vec<u8> {
    let mut envelope = Vec::with_capacity(command.len() + 3);
    envelope.push(address);
    envelope.extend_from_slice(command);
    let crc = crc16_modbus_le(&envelope);
    envelope.extend_from_slice(&crc);
    envelope
}

/// The acknowledgement the BMS echoes after a register write: the first six
/// envelope bytes re-framed with their own CRC.
pub fn write_ack(envelope: &[u8]) -> Vec<u8> {
    let mut ack = envelope[..6.min(envelope.len())].to_vec();
    let crc = crc16_modbus_le(&ack);
    ack.extend_from_slice(&crc);
    ack
}

/// Validate the sum checksum of a record body (bytes `[0, 300)`).
pub fn validate_body(buf: &[u8]) -> Result<(), Error> {
    if buf.len() < MIN_RESPONSE_SIZE {
        return Err(Error::FrameTooShort {
            kind: frame_type(buf),
            len: buf.len(),
            need: MIN_RESPONSE_SIZE,
        });
    }
    let calculated = sum8(&buf[..MIN_RESPONSE_SIZE - 1]);
    let received = buf[MIN_RESPONSE_SIZE - 1];
    if calculated != received {
        log::warn!(
            "Invalid body checksum - calculated={calculated:02X} received={received:02X}"
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }
    Ok(())
}

//! Static frame layouts of the Pylon and SMA battery CAN protocols.
//!
//! Both protocols share the measurement frames (0x351, 0x355, 0x356, 0x35E) and
//! differ in where they put alarm, warning and request bits. Every logical
//! condition carries a list of bit positions, one per protocol that knows it,
//! so decoding and encoding treat both protocols uniformly.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Standard (11 bit) CAN identifier.
pub type FrameId = u16;

pub const MAX_FRAME_ID: FrameId = 0x7FF;
/// Largest id accepted for battery heartbeats.
pub const MAX_HEARTBEAT_ID: FrameId = 0x3FF;
/// Classic CAN payload size.
pub const MAX_PAYLOAD: usize = 8;

pub const LIMITS_ID: FrameId = 0x351;
pub const STATE_ID: FrameId = 0x355;
pub const MEASUREMENTS_ID: FrameId = 0x356;
pub const PYLON_FLAGS_ID: FrameId = 0x359;
pub const SMA_FLAGS_ID: FrameId = 0x35A;
pub const PYLON_REQUEST_ID: FrameId = 0x35C;
pub const NAME_ID: FrameId = 0x35E;

/// Manufacturer marker Pylon batteries put into bytes 5-6 of 0x359.
pub const PYLON_MARKER: &[u8; 2] = b"PN";
pub const PYLON_MARKER_OFFSET: usize = 5;

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

/// Inverter protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Pylon,
    Sma,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Pylon => write!(f, "pylon"),
            Protocol::Sma => write!(f, "sma"),
        }
    }
}

/// A scaled little-endian integer inside a frame payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldDescriptor {
    pub key: &'static str,
    pub frame_id: FrameId,
    pub offset: usize,
    pub length: usize,
    pub scale: f32,
    pub signed: bool,
}

impl FieldDescriptor {
    pub const fn new(
        key: &'static str,
        frame_id: FrameId,
        offset: usize,
        length: usize,
        scale: f32,
        signed: bool,
    ) -> Self {
        assert!(length == 1 || length == 2);
        assert!(offset + length <= MAX_PAYLOAD);
        Self {
            key,
            frame_id,
            offset,
            length,
            scale,
            signed,
        }
    }

    /// Returns `None` when the payload is too short to hold this field.
    pub fn decode(&self, payload: &[u8]) -> Option<f32> {
        let bytes = payload.get(self.offset..self.offset + self.length)?;
        let raw = match (self.length, self.signed) {
            (1, false) => bytes[0] as i32,
            (1, true) => bytes[0] as i8 as i32,
            (_, false) => u16::from_le_bytes([bytes[0], bytes[1]]) as i32,
            (_, true) => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
        };
        Some(raw as f32 * self.scale)
    }

    /// Writes `value` into `payload`, saturating at the bounds of the field.
    /// An unknown value is sent as zero.
    pub fn encode(&self, value: Option<f32>, payload: &mut [u8]) {
        let Some(bytes) = payload.get_mut(self.offset..self.offset + self.length) else {
            return;
        };
        let scaled = match value {
            Some(value) if value.is_finite() => (value / self.scale).round(),
            _ => 0.0,
        };
        let bits = 8 * self.length as u32;
        let (min, max) = if self.signed {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        } else {
            (0, (1i64 << bits) - 1)
        };
        let raw = (scaled as i64).clamp(min, max);
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = ((raw >> (8 * i)) & 0xFF) as u8;
        }
    }
}

pub const VOLTAGE: &str = "voltage";
pub const CURRENT: &str = "current";
pub const TEMPERATURE: &str = "temperature";
pub const CHARGE: &str = "charge";
pub const HEALTH: &str = "health";
pub const MAX_CHARGE_VOLTAGE: &str = "max_charge_voltage";
pub const MAX_CHARGE_CURRENT: &str = "max_charge_current";
pub const MAX_DISCHARGE_CURRENT: &str = "max_discharge_current";
pub const MIN_DISCHARGE_VOLTAGE: &str = "min_discharge_voltage";
pub const MODULE_COUNT: &str = "module_count";

pub static FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new(VOLTAGE, MEASUREMENTS_ID, 0, 2, 0.01, false),
    FieldDescriptor::new(CURRENT, MEASUREMENTS_ID, 2, 2, 0.1, true),
    FieldDescriptor::new(TEMPERATURE, MEASUREMENTS_ID, 4, 2, 0.1, true),
    FieldDescriptor::new(CHARGE, STATE_ID, 0, 2, 1.0, false),
    FieldDescriptor::new(HEALTH, STATE_ID, 2, 2, 1.0, false),
    FieldDescriptor::new(MAX_CHARGE_VOLTAGE, LIMITS_ID, 0, 2, 0.1, false),
    FieldDescriptor::new(MAX_CHARGE_CURRENT, LIMITS_ID, 2, 2, 0.1, false),
    FieldDescriptor::new(MAX_DISCHARGE_CURRENT, LIMITS_ID, 4, 2, 0.1, false),
    FieldDescriptor::new(MIN_DISCHARGE_VOLTAGE, LIMITS_ID, 6, 2, 0.1, false),
    FieldDescriptor::new(MODULE_COUNT, PYLON_FLAGS_ID, 4, 1, 1.0, false),
];

/// An ASCII string filling a whole payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextDescriptor {
    pub key: &'static str,
    pub frame_id: FrameId,
}

impl TextDescriptor {
    /// Trailing NUL and space padding is dropped, other non-printable bytes are
    /// replaced. Empty payloads yield `None`.
    pub fn decode(&self, payload: &[u8]) -> Option<String> {
        let text: String = payload
            .iter()
            .take(MAX_PAYLOAD)
            .map(|&b| {
                if b == 0 || b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '?'
                }
            })
            .collect();
        let text = text.trim_end_matches(['\0', ' ']);
        (!payload.is_empty()).then(|| text.to_string())
    }
}

pub const BMS_NAME: &str = "bms_name";

pub static TEXTS: &[TextDescriptor] = &[TextDescriptor {
    key: BMS_NAME,
    frame_id: NAME_ID,
}];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlagCategory {
    Alarm,
    Warning,
    Request,
}

/// Where one protocol puts a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitPosition {
    pub protocol: Protocol,
    pub frame_id: FrameId,
    pub offset: usize,
    pub bit: u8,
}

impl BitPosition {
    /// Returns `None` when the payload does not reach this position.
    pub fn read(&self, payload: &[u8]) -> Option<bool> {
        payload
            .get(self.offset)
            .map(|&byte| read_bit!(byte, self.bit))
    }

    pub fn write(&self, payload: &mut [u8], state: bool) {
        if let Some(byte) = payload.get_mut(self.offset) {
            if state {
                *byte |= 1 << self.bit;
            } else {
                *byte &= !(1 << self.bit);
            }
        }
    }
}

macro_rules! sma {
    ($offset:expr, $bit:expr) => {
        BitPosition {
            protocol: Protocol::Sma,
            frame_id: SMA_FLAGS_ID,
            offset: $offset,
            bit: $bit,
        }
    };
}

macro_rules! pylon {
    ($offset:expr, $bit:expr) => {
        BitPosition {
            protocol: Protocol::Pylon,
            frame_id: PYLON_FLAGS_ID,
            offset: $offset,
            bit: $bit,
        }
    };
}

macro_rules! pylon_request {
    ($bit:expr) => {
        BitPosition {
            protocol: Protocol::Pylon,
            frame_id: PYLON_REQUEST_ID,
            offset: 0,
            bit: $bit,
        }
    };
}

/// A logical condition and every place a protocol reports it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlagDescriptor {
    pub key: &'static str,
    /// Human readable name used in the alarm and warning summaries.
    pub name: &'static str,
    pub category: FlagCategory,
    pub variants: &'static [BitPosition],
}

const fn alarm(
    key: &'static str,
    name: &'static str,
    variants: &'static [BitPosition],
) -> FlagDescriptor {
    FlagDescriptor {
        key,
        name,
        category: FlagCategory::Alarm,
        variants,
    }
}

const fn warning(
    key: &'static str,
    name: &'static str,
    variants: &'static [BitPosition],
) -> FlagDescriptor {
    FlagDescriptor {
        key,
        name,
        category: FlagCategory::Warning,
        variants,
    }
}

const fn request(
    key: &'static str,
    name: &'static str,
    variants: &'static [BitPosition],
) -> FlagDescriptor {
    FlagDescriptor {
        key,
        name,
        category: FlagCategory::Request,
        variants,
    }
}

// SMA warnings sit four bytes after the matching alarm, Pylon keeps
// protection flags in bytes 2-3 and warnings in bytes 0-1.
pub static FLAGS: &[FlagDescriptor] = &[
    alarm("general_alarm", "General Alarm", &[sma!(0, 0)]),
    alarm("high_voltage_alarm", "High Voltage", &[sma!(0, 2), pylon!(2, 1)]),
    alarm("low_voltage_alarm", "Low Voltage", &[sma!(0, 4), pylon!(2, 2)]),
    alarm(
        "high_temperature_alarm",
        "High Temperature",
        &[sma!(0, 6), pylon!(2, 3)],
    ),
    alarm(
        "low_temperature_alarm",
        "Low Temperature",
        &[sma!(1, 0), pylon!(2, 4)],
    ),
    alarm(
        "high_temperature_charge_alarm",
        "High Temperature Charge",
        &[sma!(1, 2)],
    ),
    alarm(
        "low_temperature_charge_alarm",
        "Low Temperature Charge",
        &[sma!(1, 4)],
    ),
    alarm("high_current_alarm", "High Current", &[sma!(1, 6), pylon!(2, 7)]),
    alarm(
        "high_current_charge_alarm",
        "High Current Charge",
        &[sma!(2, 0), pylon!(3, 0)],
    ),
    alarm("contactor_error_alarm", "Contactor Error", &[sma!(2, 2)]),
    alarm("short_circuit_alarm", "Short Circuit", &[sma!(2, 4)]),
    alarm(
        "bms_internal_error_alarm",
        "BMS Internal Error",
        &[sma!(2, 6), pylon!(3, 3)],
    ),
    alarm("cell_imbalance_alarm", "Cell Imbalance", &[sma!(3, 0)]),
    warning("general_warning", "General Warning", &[sma!(4, 0)]),
    warning(
        "high_voltage_warning",
        "High Voltage",
        &[sma!(4, 2), pylon!(0, 1)],
    ),
    warning("low_voltage_warning", "Low Voltage", &[sma!(4, 4), pylon!(0, 2)]),
    warning(
        "high_temperature_warning",
        "High Temperature",
        &[sma!(4, 6), pylon!(0, 3)],
    ),
    warning(
        "low_temperature_warning",
        "Low Temperature",
        &[sma!(5, 0), pylon!(0, 4)],
    ),
    warning(
        "high_temperature_charge_warning",
        "High Temperature Charge",
        &[sma!(5, 2)],
    ),
    warning(
        "low_temperature_charge_warning",
        "Low Temperature Charge",
        &[sma!(5, 4)],
    ),
    warning(
        "high_current_warning",
        "High Current",
        &[sma!(5, 6), pylon!(0, 7)],
    ),
    warning(
        "high_current_charge_warning",
        "High Current Charge",
        &[sma!(6, 0), pylon!(1, 0)],
    ),
    warning("contactor_error_warning", "Contactor Error", &[sma!(6, 2)]),
    warning("short_circuit_warning", "Short Circuit", &[sma!(6, 4)]),
    warning(
        "bms_internal_error_warning",
        "BMS Internal Error",
        &[sma!(6, 6), pylon!(1, 6)],
    ),
    warning("cell_imbalance_warning", "Cell Imbalance", &[sma!(7, 0)]),
    request("charge_enable", "Charge Enable", &[pylon_request!(7)]),
    request("discharge_enable", "Discharge Enable", &[pylon_request!(6)]),
    request("force_charge_1", "Force Charge I", &[pylon_request!(5)]),
    request("force_charge_2", "Force Charge II", &[pylon_request!(4)]),
    request("full_charge", "Full Charge", &[pylon_request!(3)]),
];

/// Payload length of frames sent toward the inverter.
pub fn frame_length(frame_id: FrameId) -> usize {
    match frame_id {
        STATE_ID => 4,
        MEASUREMENTS_ID => 6,
        PYLON_REQUEST_ID => 2,
        _ => MAX_PAYLOAD,
    }
}

/// Builds a payload from the field table, asking `value` for each field key.
pub fn encode_fields(frame_id: FrameId, value: impl Fn(&str) -> Option<f32>) -> Vec<u8> {
    let mut payload = vec![0; frame_length(frame_id)];
    for field in FIELDS.iter().filter(|f| f.frame_id == frame_id) {
        field.encode(value(field.key), &mut payload);
    }
    payload
}

/// Builds a flag payload for `protocol`, setting every bit whose condition
/// `asserted` reports as true.
pub fn encode_flags(
    protocol: Protocol,
    frame_id: FrameId,
    asserted: impl Fn(&FlagDescriptor) -> bool,
) -> Vec<u8> {
    let mut payload = vec![0; frame_length(frame_id)];
    for flag in FLAGS {
        let state = asserted(flag);
        for position in flag
            .variants
            .iter()
            .filter(|v| v.protocol == protocol && v.frame_id == frame_id)
        {
            position.write(&mut payload, state);
        }
    }
    payload
}

/// Complete flag frame as a battery of `protocol` would send it: the flag
/// bits plus any fields and markers sharing the frame.
pub fn encode_status_frame(
    protocol: Protocol,
    frame_id: FrameId,
    asserted: impl Fn(&FlagDescriptor) -> bool,
    value: impl Fn(&str) -> Option<f32>,
) -> Vec<u8> {
    let mut payload = encode_flags(protocol, frame_id, asserted);
    for field in FIELDS.iter().filter(|f| f.frame_id == frame_id) {
        field.encode(value(field.key), &mut payload);
    }
    if protocol == Protocol::Pylon && frame_id == PYLON_FLAGS_ID {
        payload[PYLON_MARKER_OFFSET..PYLON_MARKER_OFFSET + PYLON_MARKER.len()]
            .copy_from_slice(PYLON_MARKER);
    }
    payload
}

/// Frame ids carrying flags of `protocol`, in ascending order.
pub fn flag_frames(protocol: Protocol) -> Vec<FrameId> {
    let mut ids: Vec<FrameId> = FLAGS
        .iter()
        .flat_map(|flag| flag.variants.iter())
        .filter(|v| v.protocol == protocol)
        .map(|v| v.frame_id)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Fixed 8 byte payload: text truncated or padded with spaces.
pub fn encode_text(text: &str) -> Vec<u8> {
    let mut payload = vec![b' '; MAX_PAYLOAD];
    for (slot, byte) in payload.iter_mut().zip(text.bytes()) {
        *slot = byte;
    }
    payload
}

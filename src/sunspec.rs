//! SunSpec holding-register image of the inverter tree.
//!
//! Layout: the `SunS` marker, the common model (1), the single phase float
//! inverter model (111) and the end marker.

use crate::bus::{paths, AttributeSet, AttributeValue};
use crate::status_mapper::Phase;

pub const BASE_ADDRESS: u16 = 40000;

pub const MARKER: u16 = 40000;
pub const COMMON_MODEL: u16 = 40002;
pub const MANUFACTURER: u16 = 40004;
pub const MODEL: u16 = 40020;
pub const OPTIONS: u16 = 40036;
pub const VERSION: u16 = 40044;
pub const SERIAL_NUMBER: u16 = 40052;
pub const DEVICE_ADDRESS: u16 = 40068;

pub const INVERTER_MODEL: u16 = 40069;
pub const AMPS: u16 = 40071;
pub const AMPS_PHASE_A: u16 = 40073;
pub const AMPS_PHASE_B: u16 = 40075;
pub const AMPS_PHASE_C: u16 = 40077;
pub const VOLTS_PHASE_A: u16 = 40085;
pub const VOLTS_PHASE_B: u16 = 40087;
pub const VOLTS_PHASE_C: u16 = 40089;
pub const WATTS: u16 = 40091;
/// float32 like every model 111 point: whole-Wh resolution ends above 2^24 Wh
/// (about 16.7 MWh), beyond that the counter is rounded to the nearest float.
pub const WATT_HOURS: u16 = 40101;
pub const OPERATING_STATE: u16 = 40117;
pub const VENDOR_STATE: u16 = 40118;

pub const END_MARKER: u16 = 40131;

/// Number of registers from [`BASE_ADDRESS`] through the end marker.
pub const IMAGE_LEN: usize = (END_MARKER - BASE_ADDRESS) as usize + 2;

const COMMON_MODEL_ID: u16 = 1;
const COMMON_MODEL_LEN: u16 = 65;
const INVERTER_MODEL_ID: u16 = 111;
const INVERTER_MODEL_LEN: u16 = 60;
const MANUFACTURER_NAME: &str = "Shelly";

// SunSpec operating states (St)
const ST_OFF: u16 = 1;
const ST_MPPT: u16 = 4;
const ST_STANDBY: u16 = 8;

/// Renders the full register image starting at [`BASE_ADDRESS`]. Paths that
/// are missing from the tree render as zero or as an empty string.
pub fn render(tree: &AttributeSet) -> Vec<u16> {
    let mut image = RegisterImage::new();

    image.put_str(MARKER, 2, "SunS");
    image.put(COMMON_MODEL, COMMON_MODEL_ID);
    image.put(COMMON_MODEL + 1, COMMON_MODEL_LEN);
    image.put_str(MANUFACTURER, 16, MANUFACTURER_NAME);
    image.put_str(MODEL, 16, text(tree, paths::PRODUCT_NAME));
    image.put_str(OPTIONS, 8, text(tree, paths::CUSTOM_NAME));
    image.put_str(VERSION, 8, text(tree, paths::PROCESS_VERSION));
    image.put_str(SERIAL_NUMBER, 16, text(tree, paths::SERIAL));
    image.put(
        DEVICE_ADDRESS,
        u16::try_from(int(tree, paths::DEVICE_INSTANCE)).unwrap_or(0),
    );

    image.put(INVERTER_MODEL, INVERTER_MODEL_ID);
    image.put(INVERTER_MODEL + 1, INVERTER_MODEL_LEN);
    image.put_f32(AMPS, float(tree, paths::AC_CURRENT));
    for (phase, amps, volts) in [
        (Phase::L1, AMPS_PHASE_A, VOLTS_PHASE_A),
        (Phase::L2, AMPS_PHASE_B, VOLTS_PHASE_B),
        (Phase::L3, AMPS_PHASE_C, VOLTS_PHASE_C),
    ] {
        image.put_f32(amps, float(tree, &paths::line(phase, paths::CURRENT)));
        image.put_f32(volts, float(tree, &paths::line(phase, paths::VOLTAGE)));
    }
    image.put_f32(WATTS, float(tree, paths::AC_POWER));
    image.put_f32(WATT_HOURS, float(tree, paths::AC_ENERGY_FORWARD));

    let status_code = int(tree, paths::STATUS_CODE);
    let state = match status_code {
        7 => ST_MPPT,
        8 => ST_STANDBY,
        _ => ST_OFF,
    };
    image.put(OPERATING_STATE, state);
    image.put(VENDOR_STATE, u16::try_from(status_code).unwrap_or(0));

    image.put(END_MARKER, 0xFFFF);
    image.put(END_MARKER + 1, 0);

    image.registers
}

/// Decodes a float written high word first.
pub fn f32_from_registers(high: u16, low: u16) -> f32 {
    f32::from_bits((u32::from(high) << 16) | u32::from(low))
}

/// Decodes a NUL padded register string.
pub fn string_from_registers(registers: &[u16]) -> String {
    registers
        .iter()
        .flat_map(|r| r.to_be_bytes())
        .take_while(|b| *b != 0)
        .map(char::from)
        .collect()
}

struct RegisterImage {
    registers: Vec<u16>,
}

impl RegisterImage {
    fn new() -> Self {
        Self {
            registers: vec![0; IMAGE_LEN],
        }
    }

    fn put(&mut self, address: u16, value: u16) {
        self.registers[usize::from(address - BASE_ADDRESS)] = value;
    }

    fn put_f32(&mut self, address: u16, value: f32) {
        let bits = value.to_bits();
        self.put(address, (bits >> 16) as u16);
        self.put(address + 1, (bits & 0xFFFF) as u16);
    }

    /// Writes at most `len` registers; longer text is cut, non-ASCII bytes
    /// become `?`.
    fn put_str(&mut self, address: u16, len: u16, value: &str) {
        let bytes: Vec<u8> = value
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .take(usize::from(len) * 2)
            .collect();
        for (i, pair) in bytes.chunks(2).enumerate() {
            let high = pair[0];
            let low = pair.get(1).copied().unwrap_or(0);
            self.put(address + i as u16, u16::from_be_bytes([high, low]));
        }
    }
}

fn float(tree: &AttributeSet, path: &str) -> f32 {
    tree.get(path).and_then(AttributeValue::as_f64).unwrap_or(0.0) as f32
}

fn int(tree: &AttributeSet, path: &str) -> i64 {
    match tree.get(path) {
        Some(AttributeValue::Int(v)) => *v,
        Some(AttributeValue::Float(v)) => *v as i64,
        _ => 0,
    }
}

fn text<'a>(tree: &'a AttributeSet, path: &str) -> &'a str {
    tree.get(path).and_then(AttributeValue::as_text).unwrap_or("")
}

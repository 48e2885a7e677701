use crate::bus::{paths, AttributeSet, AttributeValue};
use crate::config::BridgeConfig;
use crate::device_client::DeviceStatus;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Assumed line voltage for devices that do not measure it.
pub const NOMINAL_VOLTAGE: f64 = 230.0;

// Victron pvinverter status codes
const STATUS_RUNNING: i64 = 7;
const STATUS_STANDBY: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn label(&self) -> &'static str {
        match self {
            Phase::L1 => "L1",
            Phase::L2 => "L2",
            Phase::L3 => "L3",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("phase must be one of L1, L2 or L3, got '{0}'")]
pub struct InvalidPhase(pub String);

impl FromStr for Phase {
    type Err = InvalidPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "L1" => Ok(Phase::L1),
            "L2" => Ok(Phase::L2),
            "L3" => Ok(Phase::L3),
            _ => Err(InvalidPhase(s.to_string())),
        }
    }
}

/// Serial number derived from the device's MAC address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    serial: String,
}

impl DeviceIdentity {
    pub fn from_hardware_id(hardware_id: &str) -> Self {
        let serial = hardware_id
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | ' '))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        Self { serial }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingConfig {
    pub phase: Phase,
    pub invert_power: bool,
}

impl MappingConfig {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            phase: config.phase,
            invert_power: config.invert_power,
        }
    }
}

/// Maps one status reading onto the inverter's object paths.
///
/// The configured phase carries the reading, the other two lines are zero.
/// Power and energy keep the device's units (W and Wh).
pub fn map_status(
    status: &DeviceStatus,
    mapping: &MappingConfig,
    identity: &DeviceIdentity,
) -> AttributeSet {
    let power = if mapping.invert_power {
        -status.power
    } else {
        status.power
    };
    let voltage = status.voltage.unwrap_or(NOMINAL_VOLTAGE);
    let current = status.current.unwrap_or(if voltage > 0.0 {
        power / voltage
    } else {
        0.0
    });
    let energy = status.energy_wh;

    let mut values = AttributeSet::new();
    for phase in Phase::ALL {
        let (v, i, p, e) = if phase == mapping.phase {
            (voltage, current, power, energy)
        } else {
            (0.0, 0.0, 0.0, 0.0)
        };
        values.insert(paths::line(phase, paths::VOLTAGE), v.into());
        values.insert(paths::line(phase, paths::CURRENT), i.into());
        values.insert(paths::line(phase, paths::POWER), p.into());
        values.insert(paths::line(phase, paths::ENERGY_FORWARD), e.into());
    }

    values.insert(paths::AC_POWER.to_string(), power.into());
    values.insert(paths::AC_ENERGY_FORWARD.to_string(), energy.into());
    values.insert(paths::AC_CURRENT.to_string(), current.into());
    values.insert(paths::AC_VOLTAGE.to_string(), voltage.into());

    let status_code = if status.output_on {
        STATUS_RUNNING
    } else {
        STATUS_STANDBY
    };
    values.insert(paths::CONNECTED.to_string(), AttributeValue::Int(1));
    values.insert(
        paths::STATUS_CODE.to_string(),
        AttributeValue::Int(status_code),
    );
    values.insert(paths::SERIAL.to_string(), identity.serial().into());
    values.insert(paths::PHASE.to_string(), mapping.phase.label().into());

    values
}

//! The device bus seen by the bridge: a tree of object paths that is declared
//! once with [`DeviceBus::register`] and then updated with [`DeviceBus::publish`].

use crate::config::BridgeConfig;
use crate::status_mapper::Phase;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Victron product id for devices without an assigned id.
pub const GENERIC_PRODUCT_ID: i64 = 0xFFFF;

pub mod paths {
    use crate::status_mapper::Phase;

    pub const PROCESS_NAME: &str = "/Mgmt/ProcessName";
    pub const PROCESS_VERSION: &str = "/Mgmt/ProcessVersion";
    pub const CONNECTION: &str = "/Mgmt/Connection";

    pub const DEVICE_INSTANCE: &str = "/DeviceInstance";
    pub const PRODUCT_ID: &str = "/ProductId";
    pub const PRODUCT_NAME: &str = "/ProductName";
    pub const CUSTOM_NAME: &str = "/CustomName";
    pub const CONNECTED: &str = "/Connected";
    pub const FIRMWARE_VERSION: &str = "/FirmwareVersion";
    pub const HARDWARE_VERSION: &str = "/HardwareVersion";
    pub const POSITION: &str = "/Position";
    pub const SERIAL: &str = "/Serial";
    pub const UPDATE_INDEX: &str = "/UpdateIndex";
    pub const STATUS_CODE: &str = "/StatusCode";
    pub const PHASE: &str = "/Phase";

    pub const AC_POWER: &str = "/Ac/Power";
    pub const AC_ENERGY_FORWARD: &str = "/Ac/Energy/Forward";
    pub const AC_CURRENT: &str = "/Ac/Current";
    pub const AC_VOLTAGE: &str = "/Ac/Voltage";

    pub const VOLTAGE: &str = "Voltage";
    pub const CURRENT: &str = "Current";
    pub const POWER: &str = "Power";
    pub const ENERGY_FORWARD: &str = "Energy/Forward";

    /// Per-line path such as `/Ac/L2/Power`.
    pub fn line(phase: Phase, leaf: &str) -> String {
        format!("/Ac/{phase}/{leaf}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(v) => Some(*v as f64),
            AttributeValue::Float(v) => Some(*v),
            AttributeValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

/// Object path to value, ordered so logs and diffs are stable.
pub type AttributeSet = BTreeMap<String, AttributeValue>;

/// Everything announced at registration: the service name and each declared
/// path with the value it holds until the first publish.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSchema {
    pub service_name: String,
    pub paths: AttributeSet,
}

impl ServiceSchema {
    /// The object tree of a single-phase PV inverter.
    pub fn pv_inverter(config: &BridgeConfig) -> Self {
        let version = env!("CARGO_PKG_VERSION");
        let mut declared = AttributeSet::new();
        let mut declare = |path: &str, value: AttributeValue| {
            declared.insert(path.to_string(), value);
        };

        declare(paths::PROCESS_NAME, env!("CARGO_PKG_NAME").into());
        declare(paths::PROCESS_VERSION, version.into());
        declare(
            paths::CONNECTION,
            config.generation.connection_description().into(),
        );

        declare(paths::DEVICE_INSTANCE, i64::from(config.device_instance).into());
        declare(paths::PRODUCT_ID, GENERIC_PRODUCT_ID.into());
        declare(paths::PRODUCT_NAME, config.generation.product_name().into());
        declare(paths::CUSTOM_NAME, config.custom_name.as_str().into());
        declare(paths::CONNECTED, 0i64.into());
        declare(paths::FIRMWARE_VERSION, version.into());
        declare(paths::HARDWARE_VERSION, 0i64.into());
        declare(paths::POSITION, i64::from(config.position).into());
        declare(paths::SERIAL, "".into());
        declare(paths::UPDATE_INDEX, 0i64.into());
        declare(paths::STATUS_CODE, 0i64.into());
        declare(paths::PHASE, config.phase.label().into());

        for path in [
            paths::AC_POWER,
            paths::AC_ENERGY_FORWARD,
            paths::AC_CURRENT,
            paths::AC_VOLTAGE,
        ] {
            declare(path, 0.0.into());
        }
        for phase in Phase::ALL {
            for leaf in [
                paths::VOLTAGE,
                paths::CURRENT,
                paths::POWER,
                paths::ENERGY_FORWARD,
            ] {
                declare(&paths::line(phase, leaf), 0.0.into());
            }
        }

        Self {
            service_name: config.service_name(),
            paths: declared,
        }
    }

    pub fn declares(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }
}

/// Proof of a successful registration. Only valid while the bus reports it
/// as attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusHandle {
    service_name: String,
    generation: u64,
}

impl BusHandle {
    pub fn new(service_name: impl Into<String>, generation: u64) -> Self {
        Self {
            service_name: service_name.into(),
            generation,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("cannot attach to the bus at {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("bus attachment for {0} has been lost")]
    Detached(String),
    #[error("path {0} was not declared at registration")]
    UndeclaredPath(String),
}

pub trait DeviceBus {
    /// Creates the object tree. Values already held for a declared path are
    /// kept; new paths start at their declared value.
    fn register(&mut self, schema: &ServiceSchema) -> Result<BusHandle, BusError>;

    fn publish(&mut self, handle: &BusHandle, values: &AttributeSet) -> Result<(), BusError>;

    /// Cheap probe, called before every publish.
    fn is_attached(&self, handle: &BusHandle) -> bool;
}

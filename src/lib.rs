//! Shelly PV-inverter bridge library
//!
//! Polls a Shelly 1PM or Plus 1PM relay over HTTP and republishes its readings
//! as a virtual PV inverter on the energy-management bus. The bus tree is
//! exported to the platform as a SunSpec Modbus TCP register map.

pub mod bus;
pub mod config;
pub mod device_client;
pub mod liveness;
pub mod modbus_bus;
pub mod publisher;
pub mod scheduler;
pub mod status_mapper;
pub mod sunspec;

// Re-export commonly used types for easier access
pub use bus::{AttributeSet, AttributeValue, BusHandle, DeviceBus, ServiceSchema};
pub use config::BridgeConfig;
pub use device_client::{DeviceStatus, FetchError, ShellyClient, StatusSource};
pub use modbus_bus::ModbusBus;
pub use publisher::Publisher;
pub use scheduler::{Scheduler, SchedulerSettings, SchedulerState};
pub use status_mapper::{map_status, MappingConfig, Phase};

//! Library interface for swarm-env-sensor.
//!
//! Everything except the SoftDevice glue builds on the host, so the
//! advertising encoder, event dispatcher, connection registry and
//! peripheral controller are unit-tested with `cargo test`.
//!
//! The embedded binary (`src/main.rs`, feature `embedded`) wires these
//! onto the nRF52840 SoftDevice S140.

#![cfg_attr(not(test), no_std)]

// Must come first: the logging macros are textual-scoped.
#[macro_use]
mod fmt;

// ═══════════════════════════════════════════════════════════════════════════
// Modules
// ═══════════════════════════════════════════════════════════════════════════

pub mod ble;
pub mod command;
pub mod config;
pub mod error;
pub mod sensor;

// ═══════════════════════════════════════════════════════════════════════════
// Re-exports
// ═══════════════════════════════════════════════════════════════════════════

pub use ble::advertising::{AdvFlags, AdvertisingConfig, AdvertisingPayload};
pub use ble::connection::{Connection, ConnectionId, ConnectionRegistry, PeripheralState};
pub use ble::events::{EventDispatcher, EventResponse, StackEvent};
pub use ble::gatt::{BleUuid, EnvAttributes, SERVICES};
pub use ble::peripheral::{AdvertisingParams, Phase, PeripheralController};
pub use ble::stack::Radio;
pub use command::Command;
pub use error::{Error, SensorError, StackError};
pub use sensor::{Sample, SampleCache, SensorSource};

/// The device's advertising configuration: Environmental Sensing service,
/// complete local name, generic-thermometer appearance.
pub fn device_advertising() -> AdvertisingConfig<'static> {
    AdvertisingConfig {
        flags: AdvFlags::general_le_only(),
        services: &[BleUuid::Uuid16(ble::gatt::ENVIRONMENTAL_SENSING_SERVICE)],
        name: Some(config::DEVICE_NAME),
        appearance: Some(config::APPEARANCE_GENERIC_THERMOMETER),
        manufacturer: None,
    }
}

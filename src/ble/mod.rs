//! Bluetooth Low Energy subsystem.
//!
//! This module drives the radio in **Peripheral** role:
//!
//! 1. **Advertising** - packs the typed advertising configuration into the
//!    31-byte advertising and scan-response packets.
//! 2. **Events** - the stack callback: decodes every stack event into a
//!    typed variant and does the minimal synchronous work it needs.
//! 3. **Connections** - the handle-indexed registry, the single-slot
//!    adoption channel, and per-link disconnect signalling.
//! 4. **Peripheral** - advertise, adopt exactly one central, wait for it
//!    to go away, advertise again.
//!
//! Cross-context handoff between the stack callback and the application
//! tasks uses `embassy_sync::signal::Signal` owned by [`connection::PeripheralState`].

pub mod ad_parser;
pub mod advertising;
pub mod connection;
pub mod events;
pub mod gatt;
pub mod peripheral;
#[cfg(feature = "embedded")]
pub mod softdevice;
pub mod stack;

use crate::config::{
    BLE_CONN_INTERVAL_MAX, BLE_CONN_INTERVAL_MIN, BLE_SLAVE_LATENCY, BLE_SUP_TIMEOUT,
};

/// Stack-assigned identifier for one active link to a central.
pub type ConnHandle = u16;

/// Handle of a characteristic value attribute, returned by registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AttrHandle(pub u16);

/// BLE device address of a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerAddress {
    /// 0 = public, 1 = random static, 2 = random private resolvable,
    /// 3 = random private non-resolvable, 4 = anonymous.
    pub kind: u8,
    /// Address bytes, little-endian as on air.
    pub bytes: [u8; 6],
}

impl PeerAddress {
    pub const fn new(kind: u8, bytes: [u8; 6]) -> Self {
        Self { kind, bytes }
    }
}

/// Peripheral preferred connection parameters, requested from every
/// central we adopt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    /// 1.25 ms units.
    pub min_interval: u16,
    /// 1.25 ms units.
    pub max_interval: u16,
    pub latency: u16,
    /// 10 ms units.
    pub supervision_timeout: u16,
}

impl ConnParams {
    pub const fn preferred() -> Self {
        Self {
            min_interval: BLE_CONN_INTERVAL_MIN,
            max_interval: BLE_CONN_INTERVAL_MAX,
            latency: BLE_SLAVE_LATENCY,
            supervision_timeout: BLE_SUP_TIMEOUT,
        }
    }

    /// Within the ranges a controller accepts, and the supervision timeout
    /// outlasts `(1 + latency) * max_interval * 2`.
    pub fn is_valid(&self) -> bool {
        let timeout_ms = u32::from(self.supervision_timeout) * 10;
        let max_interval_us = u32::from(self.max_interval) * 1250;
        let skipped = 1 + u32::from(self.latency);

        (6..=3200).contains(&self.min_interval)
            && (self.min_interval..=3200).contains(&self.max_interval)
            && self.latency <= 499
            && (10..=3200).contains(&self.supervision_timeout)
            && timeout_ms * 1000 > skipped * max_interval_us * 2
    }
}

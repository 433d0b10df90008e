//! Application-wide constants and compile-time configuration.
//!
//! Advertising identity, timing parameters, and GATT sizing live here so
//! they can be tuned in one place.

// BLE advertising

/// Complete local name placed in the advertising payload.
pub const DEVICE_NAME: &str = "swarm-env-sensor";

/// GAP appearance: generic thermometer.
pub const APPEARANCE_GENERIC_THERMOMETER: u16 = 768;

/// Advertising interval (microseconds).
pub const ADV_INTERVAL_US: u32 = 250_000;

/// Delay before retrying after the radio refused to advertise (ms).
pub const ADV_RETRY_DELAY_MS: u32 = 1_000;

/// Bounded advertising window per cycle (ms). `None` advertises until a
/// central connects.
pub const ADV_TIMEOUT_MS: Option<u32> = None;

// Connections

/// Number of connection-handle slots in the registry arena.
/// The SoftDevice is configured for a single peripheral link, so
/// handles stay small; the extra slots absorb handle reuse.
pub const MAX_CONNECTIONS: usize = 4;

/// BLE connection interval range (in 1.25 ms units).
/// 24 = 30 ms, 40 = 50 ms - sensor traffic is sparse.
pub const BLE_CONN_INTERVAL_MIN: u16 = 24;
pub const BLE_CONN_INTERVAL_MAX: u16 = 40;

/// BLE slave latency (number of connection events the peripheral can skip).
pub const BLE_SLAVE_LATENCY: u16 = 0;

/// BLE supervision timeout (in 10 ms units). 400 = 4 s.
pub const BLE_SUP_TIMEOUT: u16 = 400;

/// HCI reason reported when the peer terminates the link.
pub const HCI_REMOTE_USER_TERMINATED: u8 = 0x13;

// GATT

/// Largest value any characteristic in the table carries (the ASCII
/// `"<temp>_<humidity>"` record is the longest).
pub const MAX_ATTR_VALUE_LEN: usize = 24;

/// Maximum number of characteristics registered at start-up.
pub const MAX_CHARACTERISTICS: usize = 8;

// Sensor

/// Wait after boot before the first DHT22 measurement (ms).
pub const SENSOR_WARMUP_MS: u32 = 2_000;

/// Interval between sensor polls (ms).
pub const SENSOR_POLL_INTERVAL_MS: u32 = 10_000;

/// Interval between heartbeat log lines in the firmware main loop (s).
pub const HEARTBEAT_SECS: u64 = 60;

// GPIO pin assignments (nRF52840-DK defaults)
//
// The actual `embassy_nrf::peripherals::*` type is selected in `main.rs`.
//
//   DHT22 data (open-drain, external 10k pull-up) → P0.14

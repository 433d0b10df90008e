//! Unified error type for swarm-env-sensor.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` for efficient on-target logging.

/// Top-level error type used across the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // Advertising
    /// An advertising field fits neither the advertising nor the
    /// scan-response packet.
    PayloadTooLarge,

    /// The advertising configuration is self-contradictory (empty name,
    /// empty manufacturer payload, no discoverable mode).
    InvalidAdvertisingConfig,

    /// A bounded advertising window elapsed without a central connecting.
    AdvertisingTimeout,

    // Connections
    /// Connection handle does not fit the registry arena.
    InvalidHandle,

    /// A live connection already occupies this handle.
    HandleInUse,

    /// No live connection for this handle.
    UnknownConnection,

    /// A connection is already waiting to be adopted.
    Overloaded,

    // GATT
    /// Services have not been registered yet.
    NotRegistered,

    /// Registration returned fewer handles than characteristics declared.
    AttributeTableMismatch,

    // Collaborators
    /// The BLE stack returned an error.
    Stack(StackError),

    /// The sensor could not produce a sample.
    Sensor(SensorError),
}

/// Subset of BLE stack errors we propagate (keeps the enum `Copy`-friendly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackError {
    /// GAP / GATT raw error code from the SoftDevice.
    Raw(u32),
    /// Radio could not be enabled.
    ActivateFailed,
    /// Advertising could not start.
    AdvertiseFailed,
    /// GATT table registration failed.
    RegisterFailed,
    /// Characteristic value read/write failed.
    ValueAccess,
    /// Notification could not be queued (not subscribed, link gone).
    NotifyFailed,
    /// The connection handle is not known to the stack.
    NotConnected,
}

/// Sensor collaborator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    /// No sample has been taken yet.
    NotReady,
    /// The sensor did not answer within the protocol window.
    Timeout,
    /// Frame checksum mismatch.
    Checksum,
    /// Bus / pin I/O failed.
    Bus,
}

// Convenience conversions

impl From<StackError> for Error {
    fn from(e: StackError) -> Self {
        Error::Stack(e)
    }
}

impl From<SensorError> for Error {
    fn from(e: SensorError) -> Self {
        Error::Sensor(e)
    }
}

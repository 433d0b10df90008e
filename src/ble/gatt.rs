//! Fixed GATT table.
//!
//! Registered once at start-up; the stack hands back one value handle per
//! characteristic, in declaration order.

use heapless::Vec;

use crate::ble::AttrHandle;
use crate::error::Error;

/// Bluetooth UUID of a service or characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleUuid {
    Uuid16(u16),
    Uuid32(u32),
    /// Little-endian byte order, as on air.
    Uuid128([u8; 16]),
}

impl BleUuid {
    /// Encoded width in bytes.
    pub const fn width(&self) -> usize {
        match self {
            BleUuid::Uuid16(_) => 2,
            BleUuid::Uuid32(_) => 4,
            BleUuid::Uuid128(_) => 16,
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8, 16> {
        let mut out = Vec::new();
        // Capacity is 16, the widest variant.
        let _ = match self {
            BleUuid::Uuid16(v) => out.extend_from_slice(&v.to_le_bytes()),
            BleUuid::Uuid32(v) => out.extend_from_slice(&v.to_le_bytes()),
            BleUuid::Uuid128(v) => out.extend_from_slice(v),
        };
        out
    }
}

/// Characteristic property bits (subset of the GATT properties field).
pub mod props {
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacteristicDescriptor {
    pub uuid: BleUuid,
    /// Bitwise OR of [`props`] values.
    pub props: u8,
}

impl CharacteristicDescriptor {
    pub const fn new(uuid: u16, props: u8) -> Self {
        Self {
            uuid: BleUuid::Uuid16(uuid),
            props,
        }
    }

    pub const fn can_read(&self) -> bool {
        self.props & props::READ != 0
    }

    pub const fn can_write(&self) -> bool {
        self.props & props::WRITE != 0
    }

    pub const fn can_notify(&self) -> bool {
        self.props & props::NOTIFY != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceDescriptor {
    pub uuid: BleUuid,
    pub characteristics: &'static [CharacteristicDescriptor],
}

pub const ENVIRONMENTAL_SENSING_SERVICE: u16 = 0x181A;
pub const TEMPERATURE_CHAR: u16 = 0x2A6E;
pub const HUMIDITY_CHAR: u16 = 0x2A6F;

pub const GENERIC_ACCESS_SERVICE: u16 = 0x1800;
pub const COMMAND_INPUT_CHAR: u16 = 0x2A31;
pub const COMMAND_OUTPUT_CHAR: u16 = 0x2A5A;

/// The device's GATT table.
pub static SERVICES: &[ServiceDescriptor] = &[
    ServiceDescriptor {
        uuid: BleUuid::Uuid16(ENVIRONMENTAL_SENSING_SERVICE),
        characteristics: &[
            CharacteristicDescriptor::new(TEMPERATURE_CHAR, props::READ | props::NOTIFY),
            CharacteristicDescriptor::new(HUMIDITY_CHAR, props::READ | props::NOTIFY),
        ],
    },
    ServiceDescriptor {
        uuid: BleUuid::Uuid16(GENERIC_ACCESS_SERVICE),
        characteristics: &[
            CharacteristicDescriptor::new(COMMAND_INPUT_CHAR, props::WRITE),
            CharacteristicDescriptor::new(COMMAND_OUTPUT_CHAR, props::NOTIFY),
        ],
    },
];

/// Total characteristics across a service table.
pub fn characteristic_count(services: &[ServiceDescriptor]) -> usize {
    services.iter().map(|s| s.characteristics.len()).sum()
}

/// Value handles of [`SERVICES`], by role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EnvAttributes {
    pub temperature: AttrHandle,
    pub humidity: AttrHandle,
    pub input: AttrHandle,
    pub output: AttrHandle,
}

impl EnvAttributes {
    /// Map registration output (declaration order) onto roles.
    pub fn from_handles(handles: &[AttrHandle]) -> Result<Self, Error> {
        match *handles {
            [temperature, humidity, input, output] => Ok(Self {
                temperature,
                humidity,
                input,
                output,
            }),
            _ => Err(Error::AttributeTableMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_le_encoding() {
        assert_eq!(BleUuid::Uuid16(0x181A).to_le_bytes().as_slice(), &[0x1A, 0x18]);
        assert_eq!(
            BleUuid::Uuid32(0x1234_5678).to_le_bytes().as_slice(),
            &[0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(BleUuid::Uuid128([7; 16]).to_le_bytes().len(), 16);
    }

    #[test]
    fn table_layout() {
        assert_eq!(characteristic_count(SERVICES), 4);

        let env = &SERVICES[0];
        assert_eq!(env.uuid, BleUuid::Uuid16(0x181A));
        assert!(env.characteristics.iter().all(|c| c.can_read() && c.can_notify()));
        assert!(env.characteristics.iter().all(|c| !c.can_write()));

        let access = &SERVICES[1];
        let input = access.characteristics[0];
        let output = access.characteristics[1];
        assert!(input.can_write() && !input.can_read() && !input.can_notify());
        assert!(output.can_notify() && !output.can_write());
    }

    #[test]
    fn handles_mapped_in_declaration_order() {
        let handles = [AttrHandle(12), AttrHandle(15), AttrHandle(20), AttrHandle(22)];
        let attrs = EnvAttributes::from_handles(&handles).unwrap();
        assert_eq!(attrs.temperature, AttrHandle(12));
        assert_eq!(attrs.humidity, AttrHandle(15));
        assert_eq!(attrs.input, AttrHandle(20));
        assert_eq!(attrs.output, AttrHandle(22));
    }

    #[test]
    fn short_handle_list_rejected() {
        assert_eq!(
            EnvAttributes::from_handles(&[AttrHandle(1), AttrHandle(2)]),
            Err(Error::AttributeTableMismatch)
        );
    }
}

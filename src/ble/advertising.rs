//! Advertising payload construction.
//!
//! Legacy advertising gives us two 31-byte frames: the advertising packet
//! itself and the scan response a central requests when actively scanning.
//! Each frame is a sequence of AD structures:
//!
//! ```text
//! [len = 1 + value.len()][type][value ...]
//! ```
//!
//! Fields are appended first-fit: the advertising packet is tried first, and
//! the scan response is only allocated once a field overflows it. Field
//! order is fixed (flags, service UUIDs, name, appearance, manufacturer data)
//! so that service UUIDs land in the advertising packet whenever possible -
//! centrals filtering by service only look there.

use heapless::Vec;

use crate::ble::gatt::BleUuid;
use crate::error::Error;

/// Maximum legacy advertising / scan-response payload length.
pub const MAX_ADV_DATA_LEN: usize = 31;

/// One advertising or scan-response frame.
pub type AdvBuffer = Vec<u8, MAX_ADV_DATA_LEN>;

/// AD type tags.
pub mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_16_SERVICE_LIST: u8 = 0x02;
    pub const COMPLETE_16_SERVICE_LIST: u8 = 0x03;
    pub const INCOMPLETE_32_SERVICE_LIST: u8 = 0x04;
    pub const COMPLETE_32_SERVICE_LIST: u8 = 0x05;
    pub const INCOMPLETE_128_SERVICE_LIST: u8 = 0x06;
    pub const COMPLETE_128_SERVICE_LIST: u8 = 0x07;
    pub const SHORT_NAME: u8 = 0x08;
    pub const FULL_NAME: u8 = 0x09;
    pub const APPEARANCE: u8 = 0x19;
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xFF;
}

/// Discoverability bits carried in the flags field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvFlags(pub u8);

impl AdvFlags {
    pub const LE_LIMITED_DISCOVERABLE: u8 = 0x01;
    pub const LE_GENERAL_DISCOVERABLE: u8 = 0x02;
    pub const BR_EDR_NOT_SUPPORTED: u8 = 0x04;
    pub const SIMULTANEOUS_LE_BR_EDR: u8 = 0x18;

    /// General discoverable, LE only.
    pub const fn general_le_only() -> Self {
        Self(Self::LE_GENERAL_DISCOVERABLE | Self::BR_EDR_NOT_SUPPORTED)
    }

    /// Flags byte for the given discoverability mode and BR/EDR support.
    pub const fn new(limited: bool, br_edr: bool) -> Self {
        let disc = if limited {
            Self::LE_LIMITED_DISCOVERABLE
        } else {
            Self::LE_GENERAL_DISCOVERABLE
        };
        let bredr = if br_edr {
            Self::SIMULTANEOUS_LE_BR_EDR
        } else {
            Self::BR_EDR_NOT_SUPPORTED
        };
        Self(disc | bredr)
    }

    fn is_discoverable(&self) -> bool {
        self.0 & (Self::LE_LIMITED_DISCOVERABLE | Self::LE_GENERAL_DISCOVERABLE) != 0
    }
}

/// Encoded advertising packet plus the lazily allocated scan response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdvertisingPayload {
    adv_data: AdvBuffer,
    scan_data: Option<AdvBuffer>,
}

impl AdvertisingPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one AD structure to the first frame with room for it.
    ///
    /// Fails with [`Error::PayloadTooLarge`] rather than truncating.
    pub fn append(&mut self, type_tag: u8, value: &[u8]) -> Result<(), Error> {
        let encoded_len = value.len() + 2;
        if value.len() + 1 > u8::MAX as usize || encoded_len > MAX_ADV_DATA_LEN {
            return Err(Error::PayloadTooLarge);
        }

        if self.adv_data.len() + encoded_len <= MAX_ADV_DATA_LEN {
            return push_field(&mut self.adv_data, type_tag, value);
        }

        let scan = self.scan_data.get_or_insert_with(AdvBuffer::new);
        if scan.len() + encoded_len <= MAX_ADV_DATA_LEN {
            return push_field(scan, type_tag, value);
        }

        Err(Error::PayloadTooLarge)
    }

    /// Advertising packet bytes.
    pub fn adv_data(&self) -> &[u8] {
        &self.adv_data
    }

    /// Scan-response bytes; empty when everything fit the advertising packet.
    pub fn scan_data(&self) -> &[u8] {
        self.scan_data.as_deref().unwrap_or(&[])
    }

    /// Whether a scan response had to be allocated.
    pub fn has_scan_data(&self) -> bool {
        self.scan_data.is_some()
    }
}

fn push_field(buf: &mut AdvBuffer, type_tag: u8, value: &[u8]) -> Result<(), Error> {
    buf.push((value.len() + 1) as u8)
        .map_err(|_| Error::PayloadTooLarge)?;
    buf.push(type_tag).map_err(|_| Error::PayloadTooLarge)?;
    buf.extend_from_slice(value)
        .map_err(|_| Error::PayloadTooLarge)
}

/// Typed advertising configuration.
#[derive(Clone, Copy, Debug)]
pub struct AdvertisingConfig<'a> {
    pub flags: AdvFlags,
    pub services: &'a [BleUuid],
    pub name: Option<&'a str>,
    pub appearance: Option<u16>,
    /// `(company id, payload)`
    pub manufacturer: Option<(u16, &'a [u8])>,
}

impl Default for AdvertisingConfig<'_> {
    fn default() -> Self {
        Self {
            flags: AdvFlags::general_le_only(),
            services: &[],
            name: None,
            appearance: None,
            manufacturer: None,
        }
    }
}

impl AdvertisingConfig<'_> {
    /// Encode the configuration into advertising + scan-response frames.
    pub fn build(&self) -> Result<AdvertisingPayload, Error> {
        if !self.flags.is_discoverable()
            || self.name.is_some_and(str::is_empty)
            || self.manufacturer.is_some_and(|(_, data)| data.is_empty())
        {
            return Err(Error::InvalidAdvertisingConfig);
        }

        let mut payload = AdvertisingPayload::new();
        payload.append(ad_type::FLAGS, &[self.flags.0])?;

        for (width, list_type) in [
            (2, ad_type::COMPLETE_16_SERVICE_LIST),
            (4, ad_type::COMPLETE_32_SERVICE_LIST),
            (16, ad_type::COMPLETE_128_SERVICE_LIST),
        ] {
            let mut list: Vec<u8, { MAX_ADV_DATA_LEN - 2 }> = Vec::new();
            for uuid in self.services.iter().filter(|u| u.width() == width) {
                list.extend_from_slice(&uuid.to_le_bytes())
                    .map_err(|_| Error::PayloadTooLarge)?;
            }
            if !list.is_empty() {
                payload.append(list_type, &list)?;
            }
        }

        if let Some(name) = self.name {
            payload.append(ad_type::FULL_NAME, name.as_bytes())?;
        }

        if let Some(appearance) = self.appearance {
            payload.append(ad_type::APPEARANCE, &appearance.to_le_bytes())?;
        }

        if let Some((company, data)) = self.manufacturer {
            let mut value: Vec<u8, { MAX_ADV_DATA_LEN - 2 }> = Vec::new();
            value
                .extend_from_slice(&company.to_le_bytes())
                .map_err(|_| Error::PayloadTooLarge)?;
            value
                .extend_from_slice(data)
                .map_err(|_| Error::PayloadTooLarge)?;
            payload.append(ad_type::MANUFACTURER_SPECIFIC_DATA, &value)?;
        }

        Ok(payload)
    }
}

use heapless::String;

use crate::ble::advertising::ad_type;

/// Iterator over the `[len][type][value]` records of one advertising packet.
///
/// Stops at the first zero-length or truncated record.
pub struct AdStructures<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AdStructures<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for AdStructures<'a> {
    /// `(type, value)`
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.pos;
        if i >= self.data.len() {
            return None;
        }
        let len = self.data[i] as usize;
        if len == 0 || i + len >= self.data.len() {
            self.pos = self.data.len();
            return None;
        }
        let ad_type = self.data[i + 1];
        let value = &self.data[i + 2..i + 1 + len];
        self.pos = i + len + 1;
        Some((ad_type, value))
    }
}

/// Check if raw advertisement data lists the given 16-bit service UUID.
pub fn contains_service_uuid16(data: &[u8], uuid: u16) -> bool {
    let uuid_le = uuid.to_le_bytes();

    AdStructures::new(data)
        .filter(|(ty, _)| {
            *ty == ad_type::INCOMPLETE_16_SERVICE_LIST || *ty == ad_type::COMPLETE_16_SERVICE_LIST
        })
        .any(|(_, value)| value.chunks_exact(2).any(|chunk| chunk == uuid_le))
}

/// Extract complete/shortened local name from advertisement data.
pub fn extract_device_name(data: &[u8]) -> Option<String<32>> {
    let (_, name_bytes) = AdStructures::new(data)
        .find(|(ty, _)| *ty == ad_type::SHORT_NAME || *ty == ad_type::FULL_NAME)?;

    let mut name = String::new();
    for &b in name_bytes {
        if name.push(b as char).is_err() {
            break;
        }
    }
    Some(name)
}

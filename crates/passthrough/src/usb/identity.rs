//! Device identity and log labels

use protocol::DeviceDescriptor;
use std::fmt;

/// Who a passthrough device is, as far as the host can tell
///
/// The 64-bit [`id`](DeviceIdentity::id) combines vendor, product, bus and
/// address. It is a lookup and log key for as long as the device stays
/// plugged in, not a stable identifier across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, bus_number: u8, address: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            bus_number,
            address,
        }
    }

    pub fn from_descriptor(descriptor: &DeviceDescriptor, bus_number: u8, address: u8) -> Self {
        Self::new(
            descriptor.vendor_id,
            descriptor.product_id,
            bus_number,
            address,
        )
    }

    /// vid << 32 | pid << 16 | bus << 8 | address
    pub fn id(&self) -> u64 {
        u64::from(self.vendor_id) << 32
            | u64::from(self.product_id) << 16
            | u64::from(self.bus_number) << 8
            | u64::from(self.address)
    }
}

/// Formats as `[vvvv:pppp]`, the prefix used in device log lines
impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:04x}:{:04x}]", self.vendor_id, self.product_id)
    }
}

//! Host device enumeration
//!
//! Lists the physical devices that may be handed to the guest: everything on
//! the host except root hubs, narrowed by VID:PID filters.

use crate::usb::rusb_host::{RusbDevice, map_device_descriptor};
use protocol::DeviceDescriptor;
use rusb::{Context, UsbContext};
use tracing::{debug, info, warn};

/// VID of the Linux Foundation, used by root hubs
const ROOT_HUB_VENDOR: u16 = 0x1d6b;
const HUB_CLASS: u8 = 0x09;

/// A device found during enumeration
pub struct DeviceEntry {
    pub device: RusbDevice,
    pub descriptor: DeviceDescriptor,
    pub bus_number: u8,
    pub address: u8,
}

/// Enumerates host devices
pub struct DeviceManager {
    context: Context,
    /// Device filters (VID:PID patterns)
    allowed_filters: Vec<String>,
}

impl DeviceManager {
    pub fn new(allowed_filters: Vec<String>) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        info!(
            "Device manager initialized ({} filters)",
            allowed_filters.len()
        );

        Ok(Self {
            context,
            allowed_filters,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// All allowed devices currently connected
    pub fn devices(&self) -> Result<Vec<DeviceEntry>, rusb::Error> {
        let devices = self.context.devices()?;
        let mut entries = Vec::new();

        for device in devices.iter() {
            let bus_number = device.bus_number();
            let address = device.address();
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    warn!(
                        "Failed to read device descriptor (bus={}, addr={}): {}",
                        bus_number, address, e
                    );
                    continue;
                }
            };

            if desc.vendor_id() == ROOT_HUB_VENDOR && desc.class_code() == HUB_CLASS {
                debug!("Skipping root hub (bus={}, addr={})", bus_number, address);
                continue;
            }
            if !Self::check_filter(desc.vendor_id(), desc.product_id(), &self.allowed_filters) {
                debug!(
                    "Device ignored by filter: bus={}, addr={}, vid={:#06x}, pid={:#06x}",
                    bus_number,
                    address,
                    desc.vendor_id(),
                    desc.product_id()
                );
                continue;
            }

            entries.push(DeviceEntry {
                descriptor: map_device_descriptor(&desc),
                device: RusbDevice::new(device),
                bus_number,
                address,
            });
        }

        debug!("Enumerated {} devices", entries.len());
        Ok(entries)
    }

    /// First allowed device matching `vendor_id:product_id`
    pub fn find(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Option<DeviceEntry>, rusb::Error> {
        Ok(self.devices()?.into_iter().find(|entry| {
            entry.descriptor.vendor_id == vendor_id && entry.descriptor.product_id == product_id
        }))
    }

    /// Check if a VID/PID pair is allowed by the filters
    ///
    /// Filters look like `0xVID:0xPID`, with `*` matching anything on either
    /// side. No filters allows every device.
    pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        if filters.is_empty() {
            return true;
        }

        filters.iter().any(|filter| {
            let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
                return false;
            };
            matches_id(filter_vid, vid) && matches_id(filter_pid, pid)
        })
    }
}

fn matches_id(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let digits = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(digits, 16).is_ok_and(|value| value == id)
}

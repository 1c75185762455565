//! rusb-backed host transport
//!
//! Descriptors are copied out of rusb's types field by field and validated by
//! the descriptor cache. Transfers are executed on per-endpoint lanes (see
//! [`crate::usb::worker`]).
//!
//! rusb has no isochronous API; isochronous submissions fail with
//! `NotSupported`.

use crate::usb::host::{
    AltSetting, ConfigTree, HostDevice, HostHandle, HostResult, InterfaceTree, Transfer,
    TransferId, TransferKind,
};
use crate::usb::worker::{LaneShared, TransferLane};
use protocol::types::{
    CONFIG_DESCRIPTOR_SIZE, DESCRIPTOR_TYPE_CONFIG, DESCRIPTOR_TYPE_DEVICE,
    DESCRIPTOR_TYPE_ENDPOINT, DESCRIPTOR_TYPE_INTERFACE, DEVICE_DESCRIPTOR_SIZE,
    ENDPOINT_DESCRIPTOR_SIZE, INTERFACE_DESCRIPTOR_SIZE,
};
use protocol::{ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};
use rusb::{Context, Device, DeviceHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// An enumerated physical device
pub struct RusbDevice {
    device: Device<Context>,
}

impl RusbDevice {
    pub fn new(device: Device<Context>) -> Self {
        Self { device }
    }
}

impl HostDevice for RusbDevice {
    type Handle = RusbHandle;

    fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    fn address(&self) -> u8 {
        self.device.address()
    }

    fn device_descriptor(&self) -> HostResult<DeviceDescriptor> {
        let desc = self.device.device_descriptor()?;
        Ok(map_device_descriptor(&desc))
    }

    fn config_descriptor(&self, index: u8) -> HostResult<ConfigTree> {
        let config = self.device.config_descriptor(index)?;
        Ok(map_config(&config))
    }

    fn open(&self) -> HostResult<RusbHandle> {
        let handle = self.device.open()?;
        Ok(RusbHandle::new(handle))
    }
}

/// An open physical device
pub struct RusbHandle {
    shared: Arc<LaneShared>,
    lanes: Mutex<HashMap<u8, TransferLane>>,
}

impl RusbHandle {
    fn new(handle: rusb::DeviceHandle<Context>) -> Self {
        Self {
            shared: Arc::new(LaneShared::new(handle)),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<u8, TransferLane>> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl HostHandle for RusbHandle {
    fn detach_kernel_driver(&self, interface: u8) -> HostResult<()> {
        self.shared.handle().detach_kernel_driver(interface)
    }

    fn claim_interface(&self, interface: u8) -> HostResult<()> {
        self.shared.handle().claim_interface(interface)
    }

    fn release_interface(&self, interface: u8) -> HostResult<()> {
        self.shared.handle().release_interface(interface)
    }

    fn set_alternate_setting(&self, interface: u8, alt_setting: u8) -> HostResult<()> {
        self.shared
            .handle()
            .set_alternate_setting(interface, alt_setting)
    }

    fn set_configuration(&self, configuration: u8) -> HostResult<()> {
        self.shared.handle().set_active_configuration(configuration)
    }

    fn submit_transfer(&self, transfer: Transfer) -> HostResult<()> {
        if transfer.kind() == TransferKind::Isochronous {
            warn!(
                "Isochronous transfers are not supported (endpoint {:#04x})",
                transfer.endpoint()
            );
            return Err(rusb::Error::NotSupported);
        }

        let endpoint = transfer.endpoint();
        let mut lanes = self.lock_lanes();
        if !lanes.contains_key(&endpoint) {
            let max_packet_size = endpoint_max_packet_size(self.shared.handle(), endpoint);
            let lane = TransferLane::spawn(endpoint, max_packet_size, Arc::clone(&self.shared))
                .map_err(|e| {
                    warn!("Failed to spawn lane for endpoint {:#04x}: {}", endpoint, e);
                    rusb::Error::NoMem
                })?;
            debug!("Spawned transfer lane for endpoint {:#04x}", endpoint);
            lanes.insert(endpoint, lane);
        }

        match lanes.get(&endpoint) {
            Some(lane) => lane.send(transfer).map_err(|_| rusb::Error::Io),
            None => Err(rusb::Error::Io),
        }
    }

    fn cancel_transfer(&self, id: TransferId) -> HostResult<()> {
        self.shared.request_cancel(id);
        Ok(())
    }
}

/// wMaxPacketSize of `endpoint` in the active configuration, 0 if not found
fn endpoint_max_packet_size(handle: &DeviceHandle<Context>, endpoint: u8) -> u16 {
    let config = match handle.device().active_config_descriptor() {
        Ok(config) => config,
        Err(e) => {
            debug!("No active configuration for endpoint {:#04x}: {}", endpoint, e);
            return 0;
        }
    };
    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            for descriptor in alt.endpoint_descriptors() {
                if descriptor.address() == endpoint {
                    // Bits 11..12 carry the high-bandwidth multiplier
                    return descriptor.max_packet_size() & 0x07ff;
                }
            }
        }
    }
    0
}

impl Drop for RusbHandle {
    fn drop(&mut self) {
        // Lanes drain their queues with cancelled completions; the device
        // handle closes when the last lane lets go of it
        self.shared.shut_down();
        self.lock_lanes().clear();
    }
}

/// Pack a rusb version into BCD (`0x0210` for USB 2.1)
pub fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    (major / 10) << 12
        | (major % 10) << 8
        | u16::from(version.minor()) << 4
        | u16::from(version.sub_minor())
}

pub fn map_device_descriptor(desc: &rusb::DeviceDescriptor) -> DeviceDescriptor {
    DeviceDescriptor {
        length: DEVICE_DESCRIPTOR_SIZE,
        descriptor_type: DESCRIPTOR_TYPE_DEVICE,
        bcd_usb: version_to_bcd(desc.usb_version()),
        device_class: desc.class_code(),
        device_subclass: desc.sub_class_code(),
        device_protocol: desc.protocol_code(),
        max_packet_size0: desc.max_packet_size(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        bcd_device: version_to_bcd(desc.device_version()),
        manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
        product_index: desc.product_string_index().unwrap_or(0),
        serial_number_index: desc.serial_number_string_index().unwrap_or(0),
        num_configurations: desc.num_configurations(),
    }
}

/// Copy a rusb configuration and its interface tree
///
/// wTotalLength is recomputed from the standard descriptors present;
/// class-specific descriptors are not counted.
pub fn map_config(config: &rusb::ConfigDescriptor) -> ConfigTree {
    let interfaces: Vec<InterfaceTree> = config
        .interfaces()
        .map(|interface| InterfaceTree {
            alt_settings: interface
                .descriptors()
                .map(|alt| AltSetting {
                    descriptor: map_interface_descriptor(&alt),
                    endpoints: alt
                        .endpoint_descriptors()
                        .map(|endpoint| map_endpoint_descriptor(&endpoint))
                        .collect(),
                })
                .collect(),
        })
        .collect();

    let total_length = interfaces
        .iter()
        .flat_map(|interface| &interface.alt_settings)
        .fold(u16::from(CONFIG_DESCRIPTOR_SIZE), |total, alt| {
            total
                .saturating_add(u16::from(INTERFACE_DESCRIPTOR_SIZE))
                .saturating_add(u16::from(ENDPOINT_DESCRIPTOR_SIZE) * alt.endpoints.len() as u16)
        });

    let mut attributes = 0x80;
    if config.self_powered() {
        attributes |= 0x40;
    }
    if config.remote_wakeup() {
        attributes |= 0x20;
    }

    ConfigTree {
        descriptor: ConfigDescriptor {
            length: CONFIG_DESCRIPTOR_SIZE,
            descriptor_type: DESCRIPTOR_TYPE_CONFIG,
            total_length,
            num_interfaces: config.num_interfaces(),
            configuration_value: config.number(),
            configuration_index: config.description_string_index().unwrap_or(0),
            attributes,
            // rusb reports mA, the descriptor counts 2 mA units
            max_power: (config.max_power() / 2).min(u16::from(u8::MAX)) as u8,
        },
        interfaces,
    }
}

fn map_interface_descriptor(desc: &rusb::InterfaceDescriptor) -> InterfaceDescriptor {
    InterfaceDescriptor {
        length: INTERFACE_DESCRIPTOR_SIZE,
        descriptor_type: DESCRIPTOR_TYPE_INTERFACE,
        interface_number: desc.interface_number(),
        alternate_setting: desc.setting_number(),
        num_endpoints: desc.num_endpoints(),
        interface_class: desc.class_code(),
        interface_subclass: desc.sub_class_code(),
        interface_protocol: desc.protocol_code(),
        interface_index: desc.description_string_index().unwrap_or(0),
    }
}

fn map_endpoint_descriptor(desc: &rusb::EndpointDescriptor) -> EndpointDescriptor {
    EndpointDescriptor {
        length: ENDPOINT_DESCRIPTOR_SIZE,
        descriptor_type: DESCRIPTOR_TYPE_ENDPOINT,
        endpoint_address: desc.address(),
        attributes: endpoint_attributes(desc.transfer_type(), desc.sync_type(), desc.usage_type()),
        max_packet_size: desc.max_packet_size(),
        interval: desc.interval(),
    }
}

/// Rebuild bmAttributes from its decoded parts
pub fn endpoint_attributes(
    transfer_type: rusb::TransferType,
    sync_type: rusb::SyncType,
    usage_type: rusb::UsageType,
) -> u8 {
    let transfer = match transfer_type {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    };
    let sync = match sync_type {
        rusb::SyncType::NoSync => 0,
        rusb::SyncType::Asynchronous => 1,
        rusb::SyncType::Adaptive => 2,
        rusb::SyncType::Synchronous => 3,
    };
    let usage = match usage_type {
        rusb::UsageType::Data => 0,
        rusb::UsageType::Feedback => 1,
        rusb::UsageType::FeedbackData => 2,
        rusb::UsageType::Reserved => 3,
    };
    transfer | sync << 2 | usage << 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_to_bcd() {
        assert_eq!(version_to_bcd(rusb::Version(2, 0, 0)), 0x0200);
        assert_eq!(version_to_bcd(rusb::Version(1, 1, 0)), 0x0110);
        assert_eq!(version_to_bcd(rusb::Version(3, 2, 1)), 0x0321);
        assert_eq!(version_to_bcd(rusb::Version(12, 3, 4)), 0x1234);
    }

    #[test]
    fn test_endpoint_attributes() {
        assert_eq!(
            endpoint_attributes(
                rusb::TransferType::Bulk,
                rusb::SyncType::NoSync,
                rusb::UsageType::Data
            ),
            0x02
        );
        assert_eq!(
            endpoint_attributes(
                rusb::TransferType::Isochronous,
                rusb::SyncType::Asynchronous,
                rusb::UsageType::Feedback
            ),
            0x15
        );
        assert_eq!(
            endpoint_attributes(
                rusb::TransferType::Interrupt,
                rusb::SyncType::NoSync,
                rusb::UsageType::Data
            ),
            0x03
        );
    }
}

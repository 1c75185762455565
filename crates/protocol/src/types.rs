//! Guest-facing identifiers, result codes and descriptor values
//!
//! Descriptor structs mirror the standard USB descriptor layouts field by
//! field. They are plain values: the passthrough core fills them in from the
//! host's own representation and validates them with `validate()` before
//! handing them out.

use crate::error::{DescriptorError, Result};
use serde::{Deserialize, Serialize};

/// Request correlation token
///
/// Opaque to the passthrough core. Every reply carries the id of the request
/// it answers, and that is the only thing the core does with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Success, or an isochronous transfer that completed
pub const IPC_SUCCESS: i32 = 0;
/// No such entry: the device is gone, or nothing is registered for an endpoint
pub const IPC_ENOENT: i32 = -6;
/// Generic transfer failure (error, cancelled, timed out, overflow)
pub const TRANSFER_FAILED: i32 = -5;
/// The device stalled the request
pub const TRANSFER_STALLED: i32 = -7004;

/// Normalized result of a transfer, as reported to the guest
///
/// The guest protocol has no notion of host error codes, so every host-side
/// status collapses into one of these four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// Completed; carries the value the guest expects as the reply
    /// (a byte count, or 0 for isochronous transfers)
    Completed(i32),
    /// Errored, cancelled, timed out or overflowed
    Failed,
    /// Rejected by the device with a stall
    Stalled,
    /// The device is no longer present
    NoDevice,
}

impl TransferOutcome {
    /// Signed result code placed in the guest reply
    pub fn code(self) -> i32 {
        match self {
            TransferOutcome::Completed(value) => value,
            TransferOutcome::Failed => TRANSFER_FAILED,
            TransferOutcome::Stalled => TRANSFER_STALLED,
            TransferOutcome::NoDevice => IPC_ENOENT,
        }
    }

    /// Whether the transfer reached the device and finished normally
    pub fn is_success(self) -> bool {
        matches!(self, TransferOutcome::Completed(_))
    }
}

pub const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_TYPE_CONFIG: u8 = 0x02;
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;

pub const DEVICE_DESCRIPTOR_SIZE: u8 = 18;
pub const CONFIG_DESCRIPTOR_SIZE: u8 = 9;
pub const INTERFACE_DESCRIPTOR_SIZE: u8 = 9;
pub const ENDPOINT_DESCRIPTOR_SIZE: u8 = 7;

fn check_header(
    kind: &'static str,
    length: u8,
    minimum: u8,
    actual: u8,
    expected: u8,
) -> Result<()> {
    if length < minimum {
        return Err(DescriptorError::TooShort {
            kind,
            length,
            minimum,
        });
    }
    if actual != expected {
        return Err(DescriptorError::WrongType {
            kind,
            actual,
            expected,
        });
    }
    Ok(())
}

/// Standard device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn validate(&self) -> Result<()> {
        check_header(
            "device",
            self.length,
            DEVICE_DESCRIPTOR_SIZE,
            self.descriptor_type,
            DESCRIPTOR_TYPE_DEVICE,
        )
    }
}

/// Standard configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    /// In units of 2 mA, as on the wire
    pub max_power: u8,
}

impl ConfigDescriptor {
    pub fn validate(&self) -> Result<()> {
        check_header(
            "configuration",
            self.length,
            CONFIG_DESCRIPTOR_SIZE,
            self.descriptor_type,
            DESCRIPTOR_TYPE_CONFIG,
        )
    }
}

/// Standard interface descriptor (one per alternate setting)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_index: u8,
}

impl InterfaceDescriptor {
    pub fn validate(&self) -> Result<()> {
        check_header(
            "interface",
            self.length,
            INTERFACE_DESCRIPTOR_SIZE,
            self.descriptor_type,
            DESCRIPTOR_TYPE_INTERFACE,
        )
    }
}

/// Standard endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn validate(&self) -> Result<()> {
        check_header(
            "endpoint",
            self.length,
            ENDPOINT_DESCRIPTOR_SIZE,
            self.descriptor_type,
            DESCRIPTOR_TYPE_ENDPOINT,
        )
    }

    /// Bit 7 of the address: set for IN (device-to-host) endpoints
    pub fn is_in(&self) -> bool {
        (self.endpoint_address & 0x80) != 0
    }

    /// Transfer type bits of bmAttributes (0 control, 1 iso, 2 bulk, 3 interrupt)
    pub fn transfer_type(&self) -> u8 {
        self.attributes & 0x03
    }
}

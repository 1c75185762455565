//! Guest request kinds
//!
//! Requests arrive already parsed by the IPC kernel. Each one carries the
//! correlation id used for the reply and the guest memory address its payload
//! is copied from (OUT) or into (IN).

use crate::types::RequestId;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Size of the control setup packet that precedes the data stage
pub const CONTROL_SETUP_SIZE: usize = 8;

pub const DIR_HOST2DEVICE: u8 = 0x00;
pub const DIR_DEVICE2HOST: u8 = 0x80;
pub const TYPE_STANDARD: u8 = 0x00;
pub const TYPE_CLASS: u8 = 0x20;
pub const TYPE_VENDOR: u8 = 0x40;
pub const REC_DEVICE: u8 = 0x00;
pub const REC_INTERFACE: u8 = 0x01;

pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_SET_INTERFACE: u8 = 0x0B;

/// Pack (direction, type, recipient, request) into the 16-bit key control
/// requests are matched on
pub const fn request_header(direction: u8, kind: u8, recipient: u8, request: u8) -> u16 {
    (((direction | kind | recipient) as u16) << 8) | request as u16
}

/// Control request (always endpoint 0)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrlMessage {
    pub id: RequestId,
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength: size of the data stage
    pub length: u16,
    pub data_address: u32,
}

impl CtrlMessage {
    /// Direction bit of bmRequestType
    pub fn is_device_to_host(&self) -> bool {
        (self.request_type & DIR_DEVICE2HOST) != 0
    }

    /// Key used to recognise requests that must not reach the device directly
    pub fn header(&self) -> u16 {
        (u16::from(self.request_type) << 8) | u16::from(self.request)
    }

    /// The 8-byte setup packet, multi-byte fields little-endian
    pub fn setup_packet(&self) -> [u8; CONTROL_SETUP_SIZE] {
        let mut setup = [0u8; CONTROL_SETUP_SIZE];
        setup[0] = self.request_type;
        setup[1] = self.request;
        LittleEndian::write_u16(&mut setup[2..4], self.value);
        LittleEndian::write_u16(&mut setup[4..6], self.index);
        LittleEndian::write_u16(&mut setup[6..8], self.length);
        setup
    }
}

/// Bulk request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkMessage {
    pub id: RequestId,
    /// Endpoint address, including the direction bit
    pub endpoint: u8,
    pub length: u16,
    pub data_address: u32,
}

/// Interrupt request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntrMessage {
    pub id: RequestId,
    /// Endpoint address, including the direction bit
    pub endpoint: u8,
    pub length: u16,
    pub data_address: u32,
}

/// Isochronous request
///
/// `packet_sizes` holds the requested length of every packet. When the
/// transfer completes, the actual length of each packet is written back to
/// the guest at `packet_sizes_address` as a big-endian u16 array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoMessage {
    pub id: RequestId,
    /// Endpoint address, including the direction bit
    pub endpoint: u8,
    pub length: u16,
    pub packet_sizes: Vec<u16>,
    pub packet_sizes_address: u32,
    pub data_address: u32,
}

impl IsoMessage {
    pub fn num_packets(&self) -> usize {
        self.packet_sizes.len()
    }
}

/// Any of the four guest request kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferRequest {
    Control(CtrlMessage),
    Bulk(BulkMessage),
    Interrupt(IntrMessage),
    Isochronous(IsoMessage),
}

impl TransferRequest {
    pub fn id(&self) -> RequestId {
        match self {
            TransferRequest::Control(msg) => msg.id,
            TransferRequest::Bulk(msg) => msg.id,
            TransferRequest::Interrupt(msg) => msg.id,
            TransferRequest::Isochronous(msg) => msg.id,
        }
    }

    /// Endpoint address the request targets (0 for control)
    pub fn endpoint(&self) -> u8 {
        match self {
            TransferRequest::Control(_) => 0,
            TransferRequest::Bulk(msg) => msg.endpoint,
            TransferRequest::Interrupt(msg) => msg.endpoint,
            TransferRequest::Isochronous(msg) => msg.endpoint,
        }
    }

    /// Length of the guest-visible payload
    pub fn length(&self) -> u16 {
        match self {
            TransferRequest::Control(msg) => msg.length,
            TransferRequest::Bulk(msg) => msg.length,
            TransferRequest::Interrupt(msg) => msg.length,
            TransferRequest::Isochronous(msg) => msg.length,
        }
    }

    pub fn data_address(&self) -> u32 {
        match self {
            TransferRequest::Control(msg) => msg.data_address,
            TransferRequest::Bulk(msg) => msg.data_address,
            TransferRequest::Interrupt(msg) => msg.data_address,
            TransferRequest::Isochronous(msg) => msg.data_address,
        }
    }

    /// Whether data flows from the device into guest memory
    pub fn is_device_to_host(&self) -> bool {
        match self {
            TransferRequest::Control(msg) => msg.is_device_to_host(),
            _ => (self.endpoint() & DIR_DEVICE2HOST) != 0,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            TransferRequest::Control(_) => "Control",
            TransferRequest::Bulk(_) => "Bulk",
            TransferRequest::Interrupt(_) => "Interrupt",
            TransferRequest::Isochronous(_) => "Isochronous",
        }
    }
}

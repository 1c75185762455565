//! Test utilities for usb-passthrough
//!
//! Provides descriptor fixtures, a ready-made guest kernel and helper
//! functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_device_descriptor, create_mock_endpoint_descriptor};
//!
//! # fn main() {
//! let device = create_mock_device_descriptor(0x057e, 0x0337, 1);
//! assert_eq!(device.vendor_id, 0x057e);
//!
//! let endpoint = create_mock_endpoint_descriptor(0x81, 0x02, 64);
//! assert!(endpoint.is_in());
//! # }
//! ```

use crate::channel::{ReplyBridge, create_reply_bridge};
use crate::kernel::ChannelKernel;
use protocol::types::{
    CONFIG_DESCRIPTOR_SIZE, DESCRIPTOR_TYPE_CONFIG, DESCRIPTOR_TYPE_DEVICE,
    DESCRIPTOR_TYPE_ENDPOINT, DESCRIPTOR_TYPE_INTERFACE, DEVICE_DESCRIPTOR_SIZE,
    ENDPOINT_DESCRIPTOR_SIZE, INTERFACE_DESCRIPTOR_SIZE,
};
use protocol::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, RequestId,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default guest memory size for test kernels (64 KiB)
pub const DEFAULT_GUEST_MEMORY: usize = 64 * 1024;

/// Create a mock device descriptor
///
/// # Arguments
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
/// * `num_configurations` - bNumConfigurations
pub fn create_mock_device_descriptor(
    vendor_id: u16,
    product_id: u16,
    num_configurations: u8,
) -> DeviceDescriptor {
    DeviceDescriptor {
        length: DEVICE_DESCRIPTOR_SIZE,
        descriptor_type: DESCRIPTOR_TYPE_DEVICE,
        bcd_usb: 0x0200,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        max_packet_size0: 64,
        vendor_id,
        product_id,
        bcd_device: 0x0100,
        manufacturer_index: 1,
        product_index: 2,
        serial_number_index: 3,
        num_configurations,
    }
}

/// Create a mock configuration descriptor
pub fn create_mock_config_descriptor(
    configuration_value: u8,
    num_interfaces: u8,
) -> ConfigDescriptor {
    ConfigDescriptor {
        length: CONFIG_DESCRIPTOR_SIZE,
        descriptor_type: DESCRIPTOR_TYPE_CONFIG,
        total_length: u16::from(CONFIG_DESCRIPTOR_SIZE),
        num_interfaces,
        configuration_value,
        configuration_index: 0,
        attributes: 0x80, // Bus-powered
        max_power: 50,    // 100mA
    }
}

/// Create a mock interface descriptor (vendor-specific class)
pub fn create_mock_interface_descriptor(
    interface_number: u8,
    alternate_setting: u8,
    num_endpoints: u8,
) -> InterfaceDescriptor {
    InterfaceDescriptor {
        length: INTERFACE_DESCRIPTOR_SIZE,
        descriptor_type: DESCRIPTOR_TYPE_INTERFACE,
        interface_number,
        alternate_setting,
        num_endpoints,
        interface_class: 0xFF,
        interface_subclass: 0x00,
        interface_protocol: 0x00,
        interface_index: 0,
    }
}

/// Create a mock endpoint descriptor
///
/// # Arguments
/// * `endpoint_address` - bEndpointAddress, including the direction bit
/// * `attributes` - bmAttributes (0x01 iso, 0x02 bulk, 0x03 interrupt)
/// * `max_packet_size` - wMaxPacketSize
pub fn create_mock_endpoint_descriptor(
    endpoint_address: u8,
    attributes: u8,
    max_packet_size: u16,
) -> EndpointDescriptor {
    EndpointDescriptor {
        length: ENDPOINT_DESCRIPTOR_SIZE,
        descriptor_type: DESCRIPTOR_TYPE_ENDPOINT,
        endpoint_address,
        attributes,
        max_packet_size,
        interval: if attributes & 0x03 == 0x03 { 10 } else { 0 },
    }
}

/// Create a guest kernel with [`DEFAULT_GUEST_MEMORY`] bytes of memory
///
/// Returns the kernel together with the bridge its replies arrive on.
pub fn create_test_kernel() -> (Arc<ChannelKernel>, ReplyBridge) {
    let (bridge, queue) = create_reply_bridge();
    (Arc::new(ChannelKernel::new(DEFAULT_GUEST_MEMORY, queue)), bridge)
}

/// Create a mock RequestId for testing
pub fn create_mock_request_id(id: u64) -> RequestId {
    RequestId(id)
}

/// Create mock transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

//! Passthrough device
//!
//! One [`PassthroughDevice`] per physical device handed to the guest. It is
//! driven from a single owning thread; transfer completions arrive on host
//! threads and only touch the endpoint registries.

use crate::usb::descriptors::DescriptorCache;
use crate::usb::endpoint::TransferEndpoint;
use crate::usb::host::{HostDevice, HostResult, error_name};
use crate::usb::identity::DeviceIdentity;
use crate::usb::session::{InterfaceSession, SessionState};
use common::GuestKernel;
use protocol::{ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A host USB device exposed to the guest
pub struct PassthroughDevice<D: HostDevice> {
    pub(super) kernel: Arc<dyn GuestKernel>,
    pub(super) identity: DeviceIdentity,
    pub(super) descriptors: DescriptorCache,
    pub(super) session: InterfaceSession<D::Handle>,
    pub(super) endpoints: HashMap<u8, Arc<TransferEndpoint>>,
    // Declared last: the session must close the handle before the device goes
    host: D,
}

impl<D: HostDevice> PassthroughDevice<D> {
    /// Wrap `host`, whose device descriptor has already been read
    ///
    /// Fetches and caches every configuration descriptor. The device is not
    /// opened until the guest attaches to an interface.
    pub fn new(kernel: Arc<dyn GuestKernel>, host: D, descriptor: DeviceDescriptor) -> Self {
        let identity =
            DeviceIdentity::from_descriptor(&descriptor, host.bus_number(), host.address());
        let descriptors = DescriptorCache::fetch(&host, identity, descriptor);
        info!(
            "{} Created passthrough device (bus {} address {}, {} configs)",
            identity,
            identity.bus_number,
            identity.address,
            descriptors.num_slots()
        );

        Self {
            kernel,
            identity,
            descriptors,
            session: InterfaceSession::new(identity),
            endpoints: HashMap::new(),
            host,
        }
    }

    /// Read the device descriptor from `host`, then wrap it
    pub fn open(kernel: Arc<dyn GuestKernel>, host: D) -> HostResult<Self> {
        let descriptor = host.device_descriptor()?;
        Ok(Self::new(kernel, host, descriptor))
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// vid << 32 | pid << 16 | bus << 8 | address
    pub fn id(&self) -> u64 {
        self.identity.id()
    }

    pub fn vid(&self) -> u16 {
        self.identity.vendor_id
    }

    pub fn pid(&self) -> u16 {
        self.identity.product_id
    }

    pub fn host(&self) -> &D {
        &self.host
    }

    pub fn device_descriptor(&self) -> DeviceDescriptor {
        *self.descriptors.device()
    }

    pub fn configurations(&self) -> Vec<ConfigDescriptor> {
        self.descriptors.configurations()
    }

    /// Valid configurations with the index to query their interfaces by
    pub fn indexed_configurations(&self) -> Vec<(u8, ConfigDescriptor)> {
        self.descriptors.indexed_configurations()
    }

    pub fn interfaces(&self, config: u8) -> Vec<InterfaceDescriptor> {
        self.descriptors.interfaces(config)
    }

    /// # Panics
    ///
    /// Panics if `interface` or `alt` is out of range for a valid configuration.
    pub fn endpoints(&self, config: u8, interface: u8, alt: u8) -> Vec<EndpointDescriptor> {
        self.descriptors.endpoints(config, interface, alt)
    }

    pub fn number_of_alt_settings(&self, interface: u8) -> usize {
        self.descriptors.number_of_alt_settings(interface)
    }

    pub fn error_name(&self, code: i32) -> &'static str {
        error_name(code)
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn active_interface(&self) -> Option<u8> {
        self.session.active_interface()
    }

    /// Claim `interface`, opening the device on first use
    ///
    /// Re-attaching the active interface does nothing.
    pub fn attach(&mut self, interface: u8) -> HostResult<()> {
        let num_interfaces = self.descriptors.num_interfaces(0);
        self.session.attach(&self.host, interface, num_interfaces)
    }

    /// Select an alternate setting on the claimed interface
    pub fn set_alt_setting(&mut self, alt_setting: u8) -> HostResult<()> {
        self.session.set_alt_setting(alt_setting)
    }

    /// Request cancellation of everything in flight on `endpoint`
    ///
    /// The cancelled transfers are answered through their completions.
    /// Fails with `NotFound` if nothing was ever submitted to `endpoint`.
    pub fn cancel_transfer(&mut self, endpoint: u8) -> HostResult<()> {
        info!(
            "{} Cancelling transfers (endpoint {:#04x})",
            self.identity, endpoint
        );
        let Some(registry) = self.endpoints.get(&endpoint) else {
            warn!(
                "{} No transfers were ever submitted on endpoint {:#04x}",
                self.identity, endpoint
            );
            return Err(rusb::Error::NotFound);
        };

        match self.session.handle() {
            Some(handle) => registry.cancel_transfers(handle),
            None => debug!("{} Device closed, nothing to cancel", self.identity),
        }
        Ok(())
    }

    /// Transfers still waiting for completion on `endpoint`
    pub fn pending_transfers(&self, endpoint: u8) -> usize {
        self.endpoints
            .get(&endpoint)
            .map_or(0, |registry| registry.pending())
    }

    /// Registry for `endpoint`, created on first use
    pub(super) fn endpoint_registry(&mut self, endpoint: u8) -> Arc<TransferEndpoint> {
        let identity = self.identity;
        Arc::clone(
            self.endpoints
                .entry(endpoint)
                .or_insert_with(|| Arc::new(TransferEndpoint::new(identity, endpoint))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::mock::{HostCall, MockDevice, MockOp, mock_config};
    use common::test_utils::{
        create_mock_device_descriptor, create_mock_endpoint_descriptor, create_test_kernel,
    };

    fn mock() -> MockDevice {
        MockDevice::new(create_mock_device_descriptor(0x057e, 0x0337, 1))
            .with_config(mock_config(
                1,
                vec![
                    vec![vec![create_mock_endpoint_descriptor(0x81, 0x02, 64)]],
                    vec![vec![], vec![]],
                ],
            ))
            .at(3, 7)
    }

    #[test]
    fn test_identity() {
        let (kernel, _bridge) = create_test_kernel();
        let descriptor = create_mock_device_descriptor(0x057e, 0x0337, 1);
        let device = PassthroughDevice::new(kernel, mock(), descriptor);

        assert_eq!(device.vid(), 0x057e);
        assert_eq!(device.pid(), 0x0337);
        assert_eq!(device.id(), 0x057e_0337_0307);
        assert_eq!(device.session_state(), SessionState::Closed);
    }

    #[test]
    fn test_open_reads_device_descriptor() {
        let (kernel, _bridge) = create_test_kernel();
        let device = PassthroughDevice::open(kernel, mock()).unwrap();

        assert_eq!(device.device_descriptor().num_configurations, 1);
        assert_eq!(device.configurations().len(), 1);
        assert_eq!(device.interfaces(0).len(), 3);
        assert_eq!(device.number_of_alt_settings(1), 2);
        assert_eq!(device.endpoints(0, 0, 0)[0].endpoint_address, 0x81);
    }

    #[test]
    fn test_attach_and_switch() {
        let (kernel, _bridge) = create_test_kernel();
        let mock = mock();
        let state = mock.state();
        let mut device = PassthroughDevice::open(kernel, mock).unwrap();

        device.attach(0).unwrap();
        device.attach(1).unwrap();
        assert_eq!(device.active_interface(), Some(1));
        assert_eq!(device.attach(2), Err(rusb::Error::NotFound));
        assert_eq!(state.count(HostCall::Open), 1);
    }

    #[test]
    fn test_attach_failure_is_reported() {
        let (kernel, _bridge) = create_test_kernel();
        let mock = mock();
        mock.state().fail(MockOp::ClaimInterface, rusb::Error::Busy);
        let mut device = PassthroughDevice::open(kernel, mock).unwrap();

        assert_eq!(device.attach(0), Err(rusb::Error::Busy));
        assert_eq!(device.session_state(), SessionState::Open);
        assert_eq!(
            device.error_name(crate::usb::error_code(rusb::Error::Busy)),
            "LIBUSB_ERROR_BUSY"
        );
    }

    #[test]
    fn test_cancel_unknown_endpoint() {
        let (kernel, _bridge) = create_test_kernel();
        let mut device = PassthroughDevice::open(kernel, mock()).unwrap();

        assert_eq!(device.cancel_transfer(0x81), Err(rusb::Error::NotFound));
    }

    #[test]
    fn test_drop_closes_handle_once() {
        let (kernel, _bridge) = create_test_kernel();
        let mock = mock();
        let state = mock.state();
        {
            let mut device = PassthroughDevice::open(kernel, mock).unwrap();
            device.attach(0).unwrap();
        }

        assert_eq!(state.count(HostCall::ReleaseInterface(0)), 1);
        assert_eq!(state.count(HostCall::Close), 1);
    }
}

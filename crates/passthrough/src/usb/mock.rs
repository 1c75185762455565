//! Scriptable host transport
//!
//! [`MockDevice`] and [`MockHandle`] implement the host traits without
//! hardware. Every host call is recorded in a shared [`MockState`]; tests
//! script failures per operation and complete submitted transfers by hand,
//! from whatever thread they like.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_device_descriptor, create_mock_endpoint_descriptor};
//! use passthrough::usb::mock::{HostCall, MockDevice, mock_config};
//! use passthrough::usb::HostDevice;
//!
//! let device = MockDevice::new(create_mock_device_descriptor(0x057e, 0x0337, 1))
//!     .with_config(mock_config(
//!         1,
//!         vec![vec![vec![create_mock_endpoint_descriptor(0x81, 0x02, 64)]]],
//!     ));
//!
//! let handle = device.open().unwrap();
//! drop(handle);
//! assert_eq!(device.state().calls(), vec![HostCall::Open, HostCall::Close]);
//! ```

use crate::usb::host::{
    AltSetting, ConfigTree, HostDevice, HostHandle, HostResult, InterfaceTree, Transfer,
    TransferId, TransferStatus,
};
use protocol::types::{
    CONFIG_DESCRIPTOR_SIZE, DESCRIPTOR_TYPE_CONFIG, DESCRIPTOR_TYPE_INTERFACE,
    ENDPOINT_DESCRIPTOR_SIZE, INTERFACE_DESCRIPTOR_SIZE,
};
use protocol::{ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// A recorded host call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCall {
    Open,
    DetachKernelDriver(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    SetAlternateSetting(u8, u8),
    SetConfiguration(u8),
    Submit(TransferId),
    Cancel(TransferId),
    Close,
}

/// A host operation that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open,
    DetachKernelDriver,
    ClaimInterface,
    ReleaseInterface,
    SetAlternateSetting,
    SetConfiguration,
    Submit,
    Cancel,
}

#[derive(Default)]
struct Inner {
    calls: Vec<HostCall>,
    failures: HashMap<MockOp, rusb::Error>,
    pending: Vec<Transfer>,
    cancelled: Vec<TransferId>,
}

/// Call log, scripted failures and pending transfers shared by a mock
/// device and its handles
#[derive(Default)]
pub struct MockState {
    inner: Mutex<Inner>,
}

impl MockState {
    /// Make `op` fail with `err` until cleared
    pub fn fail(&self, op: MockOp, err: rusb::Error) {
        self.lock().failures.insert(op, err);
    }

    pub fn clear_failure(&self, op: MockOp) {
        self.lock().failures.remove(&op);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.lock().calls.clone()
    }

    /// How many times `call` was made
    pub fn count(&self, call: HostCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Transfers submitted and not yet completed, in submission order
    pub fn submitted_ids(&self) -> Vec<TransferId> {
        self.lock().pending.iter().map(Transfer::id).collect()
    }

    /// Transfers the host was asked to cancel
    pub fn cancelled(&self) -> Vec<TransferId> {
        self.lock().cancelled.clone()
    }

    /// Look at a pending transfer
    ///
    /// # Panics
    ///
    /// Panics if `id` is not pending.
    pub fn with_transfer<R>(&self, id: TransferId, f: impl FnOnce(&Transfer) -> R) -> R {
        let inner = self.lock();
        let transfer = inner
            .pending
            .iter()
            .find(|t| t.id() == id)
            .unwrap_or_else(|| panic!("transfer {} is not pending", id));
        f(transfer)
    }

    /// Complete a pending transfer; false if it is not pending
    pub fn complete(&self, id: TransferId, status: TransferStatus, actual_length: usize) -> bool {
        self.complete_with(id, status, actual_length, |_| {})
    }

    /// Let `fill` write the received payload, then complete the transfer
    pub fn complete_with(
        &self,
        id: TransferId,
        status: TransferStatus,
        actual_length: usize,
        fill: impl FnOnce(&mut Transfer),
    ) -> bool {
        let Some(mut transfer) = self.take(id) else {
            return false;
        };
        fill(&mut transfer);
        transfer.complete(status, actual_length);
        true
    }

    /// Deliver a cancelled completion for every transfer cancel was requested for
    pub fn complete_cancelled(&self) -> usize {
        let ids = std::mem::take(&mut self.lock().cancelled);
        ids.into_iter()
            .filter(|id| self.complete(*id, TransferStatus::Cancelled, 0))
            .count()
    }

    fn take(&self, id: TransferId) -> Option<Transfer> {
        let mut inner = self.lock();
        let position = inner.pending.iter().position(|t| t.id() == id)?;
        Some(inner.pending.remove(position))
    }

    fn record(&self, call: HostCall, op: MockOp) -> HostResult<()> {
        let mut inner = self.lock();
        inner.calls.push(call);
        match inner.failures.get(&op) {
            Some(err) => Err(*err),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// An enumerated mock device
pub struct MockDevice {
    descriptor: DeviceDescriptor,
    configs: Vec<HostResult<ConfigTree>>,
    bus_number: u8,
    address: u8,
    state: Arc<MockState>,
}

impl MockDevice {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            configs: Vec::new(),
            bus_number: 1,
            address: 1,
            state: Arc::new(MockState::default()),
        }
    }

    /// Append the next configuration
    pub fn with_config(mut self, tree: ConfigTree) -> Self {
        self.configs.push(Ok(tree));
        self
    }

    /// Append a configuration the host fails to read
    pub fn with_broken_config(mut self, err: rusb::Error) -> Self {
        self.configs.push(Err(err));
        self
    }

    pub fn at(mut self, bus_number: u8, address: u8) -> Self {
        self.bus_number = bus_number;
        self.address = address;
        self
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }
}

impl HostDevice for MockDevice {
    type Handle = MockHandle;

    fn bus_number(&self) -> u8 {
        self.bus_number
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn device_descriptor(&self) -> HostResult<DeviceDescriptor> {
        Ok(self.descriptor)
    }

    fn config_descriptor(&self, index: u8) -> HostResult<ConfigTree> {
        self.configs
            .get(usize::from(index))
            .cloned()
            .unwrap_or(Err(rusb::Error::NotFound))
    }

    fn open(&self) -> HostResult<MockHandle> {
        self.state.record(HostCall::Open, MockOp::Open)?;
        Ok(MockHandle {
            state: Arc::clone(&self.state),
        })
    }
}

/// An open mock device
pub struct MockHandle {
    state: Arc<MockState>,
}

impl MockHandle {
    /// A handle with its own state, not opened from any device
    pub fn detached() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }
}

impl HostHandle for MockHandle {
    fn detach_kernel_driver(&self, interface: u8) -> HostResult<()> {
        self.state.record(
            HostCall::DetachKernelDriver(interface),
            MockOp::DetachKernelDriver,
        )
    }

    fn claim_interface(&self, interface: u8) -> HostResult<()> {
        self.state
            .record(HostCall::ClaimInterface(interface), MockOp::ClaimInterface)
    }

    fn release_interface(&self, interface: u8) -> HostResult<()> {
        self.state.record(
            HostCall::ReleaseInterface(interface),
            MockOp::ReleaseInterface,
        )
    }

    fn set_alternate_setting(&self, interface: u8, alt_setting: u8) -> HostResult<()> {
        self.state.record(
            HostCall::SetAlternateSetting(interface, alt_setting),
            MockOp::SetAlternateSetting,
        )
    }

    fn set_configuration(&self, configuration: u8) -> HostResult<()> {
        self.state.record(
            HostCall::SetConfiguration(configuration),
            MockOp::SetConfiguration,
        )
    }

    fn submit_transfer(&self, transfer: Transfer) -> HostResult<()> {
        self.state
            .record(HostCall::Submit(transfer.id()), MockOp::Submit)?;
        self.state.lock().pending.push(transfer);
        Ok(())
    }

    fn cancel_transfer(&self, id: TransferId) -> HostResult<()> {
        self.state.record(HostCall::Cancel(id), MockOp::Cancel)?;
        self.state.lock().cancelled.push(id);
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.state.lock().calls.push(HostCall::Close);
    }
}

/// Build a well-formed configuration tree
///
/// `interfaces[i][a]` lists the endpoints of alternate setting `a` of
/// interface `i`. Descriptor counts and total length are filled in.
pub fn mock_config(
    configuration_value: u8,
    interfaces: Vec<Vec<Vec<EndpointDescriptor>>>,
) -> ConfigTree {
    let mut total_length = u16::from(CONFIG_DESCRIPTOR_SIZE);
    let interfaces: Vec<InterfaceTree> = interfaces
        .into_iter()
        .enumerate()
        .map(|(number, alt_settings)| InterfaceTree {
            alt_settings: alt_settings
                .into_iter()
                .enumerate()
                .map(|(alt, endpoints)| {
                    total_length += u16::from(INTERFACE_DESCRIPTOR_SIZE)
                        + u16::from(ENDPOINT_DESCRIPTOR_SIZE) * endpoints.len() as u16;
                    AltSetting {
                        descriptor: InterfaceDescriptor {
                            length: INTERFACE_DESCRIPTOR_SIZE,
                            descriptor_type: DESCRIPTOR_TYPE_INTERFACE,
                            interface_number: number as u8,
                            alternate_setting: alt as u8,
                            num_endpoints: endpoints.len() as u8,
                            interface_class: 0xff,
                            interface_subclass: 0,
                            interface_protocol: 0,
                            interface_index: 0,
                        },
                        endpoints,
                    }
                })
                .collect(),
        })
        .collect();

    ConfigTree {
        descriptor: ConfigDescriptor {
            length: CONFIG_DESCRIPTOR_SIZE,
            descriptor_type: DESCRIPTOR_TYPE_CONFIG,
            total_length,
            num_interfaces: interfaces.len() as u8,
            configuration_value,
            configuration_index: 0,
            attributes: 0x80,
            max_power: 50,
        },
        interfaces,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::host::TransferKind;
    use common::test_utils::{create_mock_device_descriptor, create_mock_endpoint_descriptor};

    #[test]
    fn test_scripted_failure() {
        let device = MockDevice::new(create_mock_device_descriptor(1, 2, 0));
        device.state().fail(MockOp::Open, rusb::Error::Access);
        assert!(matches!(device.open(), Err(rusb::Error::Access)));

        device.state().clear_failure(MockOp::Open);
        assert!(device.open().is_ok());
        assert_eq!(device.state().count(HostCall::Open), 2);
    }

    #[test]
    fn test_missing_config_index() {
        let device = MockDevice::new(create_mock_device_descriptor(1, 2, 1));
        assert_eq!(device.config_descriptor(0), Err(rusb::Error::NotFound));
    }

    #[test]
    fn test_mock_config_counts() {
        let tree = mock_config(
            1,
            vec![vec![
                vec![],
                vec![create_mock_endpoint_descriptor(0x81, 0x01, 192)],
            ]],
        );

        assert_eq!(tree.descriptor.num_interfaces, 1);
        assert_eq!(tree.descriptor.total_length, 9 + 9 + 9 + 7);
        assert_eq!(tree.interfaces[0].alt_settings[1].descriptor.alternate_setting, 1);
        assert_eq!(tree.interfaces[0].alt_settings[1].descriptor.num_endpoints, 1);
    }

    #[test]
    fn test_complete_from_another_thread() {
        let handle = MockHandle::detached();
        let state = handle.state();
        let (tx, rx) = std::sync::mpsc::channel();

        let transfer = Transfer::new(TransferKind::Bulk, 0x81, vec![0; 8])
            .on_complete(move |transfer| tx.send(transfer.status()).unwrap());
        let id = transfer.id();
        handle.submit_transfer(transfer).unwrap();

        std::thread::spawn(move || state.complete(id, TransferStatus::Completed, 8))
            .join()
            .unwrap();
        assert_eq!(rx.recv().unwrap(), TransferStatus::Completed);
    }

    #[test]
    fn test_failed_submit_drops_transfer() {
        let handle = MockHandle::detached();
        handle.state().fail(MockOp::Submit, rusb::Error::NoDevice);

        let transfer = Transfer::new(TransferKind::Bulk, 0x81, vec![0; 8]);
        assert_eq!(handle.submit_transfer(transfer), Err(rusb::Error::NoDevice));
        assert!(handle.state().submitted_ids().is_empty());
    }
}

//! Request submission and completion handling
//!
//! Each guest request becomes one host transfer. The transfer's completion
//! callback owns an `Arc` of the endpoint registry the request was entered
//! into, so completions stay valid on host threads no matter what the
//! owning thread is doing.
//!
//! Two standard control requests never reach the wire as transfers: the host
//! stack must see SET_INTERFACE and SET_CONFIGURATION as its own calls to
//! keep its claim state consistent, so they are performed synchronously and
//! answered right away.

use crate::usb::command::TransferCommand;
use crate::usb::device::PassthroughDevice;
use crate::usb::endpoint::TransferEndpoint;
use crate::usb::host::{HostDevice, HostHandle, HostResult, Transfer, TransferKind};
use protocol::messages::{
    DIR_HOST2DEVICE, REC_DEVICE, REC_INTERFACE, REQUEST_SET_CONFIGURATION,
    REQUEST_SET_INTERFACE, TYPE_STANDARD,
};
use protocol::{
    BulkMessage, CONTROL_SETUP_SIZE, CtrlMessage, IPC_SUCCESS, IntrMessage, IsoMessage,
    TransferRequest, request_header,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const SET_INTERFACE: u16 = request_header(
    DIR_HOST2DEVICE,
    TYPE_STANDARD,
    REC_INTERFACE,
    REQUEST_SET_INTERFACE,
);

const SET_CONFIGURATION: u16 = request_header(
    DIR_HOST2DEVICE,
    TYPE_STANDARD,
    REC_DEVICE,
    REQUEST_SET_CONFIGURATION,
);

impl<D: HostDevice> PassthroughDevice<D> {
    /// Submit any guest request
    ///
    /// On success exactly one reply for the request will reach the guest,
    /// either right away or from the transfer's completion. On failure no
    /// reply is sent and the caller answers the guest itself.
    pub fn submit_transfer(&mut self, request: TransferRequest) -> HostResult<()> {
        match request {
            TransferRequest::Control(msg) => self.submit_control(msg),
            TransferRequest::Bulk(msg) => self.submit_bulk(msg),
            TransferRequest::Interrupt(msg) => self.submit_interrupt(msg),
            TransferRequest::Isochronous(msg) => self.submit_isochronous(msg),
        }
    }

    pub fn submit_control(&mut self, msg: CtrlMessage) -> HostResult<()> {
        self.ensure_attached()?;
        trace!(
            "{} Control: bRequestType={:02x} bRequest={:02x} wValue={:04x} wIndex={:04x} wLength={:04x}",
            self.identity, msg.request_type, msg.request, msg.value, msg.index, msg.length
        );

        match msg.header() {
            SET_INTERFACE => return self.set_interface(&msg),
            SET_CONFIGURATION => return self.set_configuration(&msg),
            _ => {}
        }

        let setup = msg.setup_packet();
        let length = usize::from(msg.length);
        let command =
            TransferCommand::new(TransferRequest::Control(msg), Arc::clone(&self.kernel));

        let mut buffer = Vec::with_capacity(CONTROL_SETUP_SIZE + length);
        buffer.extend_from_slice(&setup);
        buffer.extend_from_slice(&command.make_buffer(length));

        let registry = self.endpoint_registry(0);
        let completion = Arc::clone(&registry);
        let transfer = Transfer::new(TransferKind::Control, 0, buffer)
            .on_complete(move |transfer| completion.handle_transfer(transfer, control_result));
        self.register_and_submit(&registry, transfer, command)
    }

    pub fn submit_bulk(&mut self, msg: BulkMessage) -> HostResult<()> {
        self.ensure_attached()?;
        trace!(
            "{} Bulk: length={:04x} endpoint={:02x}",
            self.identity, msg.length, msg.endpoint
        );
        let (endpoint, length) = (msg.endpoint, usize::from(msg.length));
        self.submit_simple(TransferKind::Bulk, endpoint, length, TransferRequest::Bulk(msg))
    }

    pub fn submit_interrupt(&mut self, msg: IntrMessage) -> HostResult<()> {
        self.ensure_attached()?;
        trace!(
            "{} Interrupt: length={:04x} endpoint={:02x}",
            self.identity, msg.length, msg.endpoint
        );
        let (endpoint, length) = (msg.endpoint, usize::from(msg.length));
        self.submit_simple(
            TransferKind::Interrupt,
            endpoint,
            length,
            TransferRequest::Interrupt(msg),
        )
    }

    pub fn submit_isochronous(&mut self, msg: IsoMessage) -> HostResult<()> {
        self.ensure_attached()?;
        trace!(
            "{} Isochronous: length={:04x} endpoint={:02x} num_packets={:02x}",
            self.identity,
            msg.length,
            msg.endpoint,
            msg.num_packets()
        );

        let endpoint = msg.endpoint;
        let packet_sizes = msg.packet_sizes.clone();
        let length = usize::from(msg.length);
        let command = TransferCommand::new(
            TransferRequest::Isochronous(msg),
            Arc::clone(&self.kernel),
        );
        let buffer = command.make_buffer(length);

        let registry = self.endpoint_registry(endpoint);
        let completion = Arc::clone(&registry);
        let mut transfer = Transfer::new(TransferKind::Isochronous, endpoint, buffer)
            .with_timeout(Duration::ZERO)
            .with_iso_packets(packet_sizes.len())
            .on_complete(move |transfer| completion.handle_transfer(transfer, generic_result));
        for (index, size) in packet_sizes.iter().enumerate() {
            transfer.set_iso_packet_length(index, *size);
        }

        self.register_and_submit(&registry, transfer, command)
    }

    fn submit_simple(
        &mut self,
        kind: TransferKind,
        endpoint: u8,
        length: usize,
        request: TransferRequest,
    ) -> HostResult<()> {
        let command = TransferCommand::new(request, Arc::clone(&self.kernel));
        let buffer = command.make_buffer(length);

        let registry = self.endpoint_registry(endpoint);
        let completion = Arc::clone(&registry);
        let transfer = Transfer::new(kind, endpoint, buffer)
            .on_complete(move |transfer| completion.handle_transfer(transfer, generic_result));

        self.register_and_submit(&registry, transfer, command)
    }

    fn ensure_attached(&self) -> HostResult<()> {
        if self.session.is_attached() {
            Ok(())
        } else {
            warn!("{} Transfer submitted with no interface attached", self.identity);
            Err(rusb::Error::NotFound)
        }
    }

    /// Register first, then submit, so a completion can never miss its entry
    fn register_and_submit(
        &self,
        registry: &TransferEndpoint,
        transfer: Transfer,
        command: TransferCommand,
    ) -> HostResult<()> {
        let Some(handle) = self.session.handle() else {
            return Err(rusb::Error::NoDevice);
        };

        let id = transfer.id();
        let request = command.id();
        registry.add_transfer(id, command);

        match handle.submit_transfer(transfer) {
            Ok(()) => {
                debug!(
                    "{} Submitted transfer {} for request {:?} on endpoint {:#04x}",
                    self.identity,
                    id,
                    request,
                    registry.endpoint()
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "{} Failed to submit transfer on endpoint {:#04x}: {}",
                    self.identity,
                    registry.endpoint(),
                    e
                );
                registry.remove_transfer(id);
                Err(e)
            }
        }
    }

    fn set_interface(&mut self, msg: &CtrlMessage) -> HostResult<()> {
        let Ok(interface) = u8::try_from(msg.index) else {
            return Err(rusb::Error::InvalidParam);
        };
        let Ok(alt_setting) = u8::try_from(msg.value) else {
            return Err(rusb::Error::InvalidParam);
        };
        debug!(
            "{} SET_INTERFACE: interface {} alt setting {}",
            self.identity, interface, alt_setting
        );

        if self.session.active_interface() != Some(interface) {
            let num_interfaces = self.descriptors.num_interfaces(0);
            self.session
                .change_interface(interface, num_interfaces)
                .map_err(|e| {
                    error!(
                        "{} Failed to change interface to {}: {}",
                        self.identity, interface, e
                    );
                    e
                })?;
        }

        self.session.set_alt_setting(alt_setting)?;
        self.kernel.enqueue_reply(msg.id, i32::from(msg.length));
        Ok(())
    }

    fn set_configuration(&mut self, msg: &CtrlMessage) -> HostResult<()> {
        let Ok(configuration) = u8::try_from(msg.value) else {
            return Err(rusb::Error::InvalidParam);
        };
        debug!(
            "{} SET_CONFIGURATION: configuration {}",
            self.identity, configuration
        );

        self.session.set_configuration(configuration)?;
        self.kernel.enqueue_reply(msg.id, i32::from(msg.length));
        Ok(())
    }
}

/// Reply value of a completed control transfer: setup plus data length
fn control_result(command: &TransferCommand, transfer: &Transfer, buffer: &[u8]) -> i32 {
    let data = buffer.get(CONTROL_SETUP_SIZE..).unwrap_or_default();
    command.fill_buffer(data, transfer.actual_length());
    transfer.length() as i32
}

/// Reply value of a completed bulk, interrupt or isochronous transfer
fn generic_result(command: &TransferCommand, transfer: &Transfer, buffer: &[u8]) -> i32 {
    match transfer.kind() {
        TransferKind::Isochronous => {
            command.fill_buffer(buffer, transfer.length());
            for (index, packet) in transfer.iso_packets().iter().enumerate() {
                command.set_packet_return_value(index, packet.actual_length);
            }
            IPC_SUCCESS
        }
        _ => {
            command.fill_buffer(buffer, transfer.actual_length());
            transfer.actual_length() as i32
        }
    }
}

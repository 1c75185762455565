//! Guest-side half of a transfer
//!
//! A [`TransferCommand`] is what is left of a guest request once it has been
//! turned into a host transfer: where its payload lives in guest memory and
//! whom to reply to.

use common::GuestKernel;
use protocol::{RequestId, TransferOutcome, TransferRequest};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A guest request waiting for its transfer to complete
pub struct TransferCommand {
    request: TransferRequest,
    kernel: Arc<dyn GuestKernel>,
}

impl TransferCommand {
    pub fn new(request: TransferRequest, kernel: Arc<dyn GuestKernel>) -> Self {
        Self { request, kernel }
    }

    pub fn id(&self) -> RequestId {
        self.request.id()
    }

    /// Allocate a zeroed payload buffer of `size` bytes
    ///
    /// For host-to-device requests the buffer is filled from guest memory at
    /// the request's data address.
    pub fn make_buffer(&self, size: usize) -> Vec<u8> {
        let mut buffer = vec![0; size];
        if !self.request.is_device_to_host() && size > 0 {
            self.kernel
                .read_memory(self.request.data_address(), &mut buffer);
        }
        buffer
    }

    /// Copy up to `size` bytes of received payload into guest memory
    ///
    /// Never writes past the request's declared length.
    pub fn fill_buffer(&self, data: &[u8], size: usize) {
        let size = size
            .min(data.len())
            .min(usize::from(self.request.length()));
        if size == 0 {
            return;
        }
        trace!(
            "Copying {} bytes to guest at {:#010x}",
            size,
            self.request.data_address()
        );
        self.kernel
            .write_memory(self.request.data_address(), &data[..size]);
    }

    /// Write the actual length of isochronous packet `index` back to the guest
    ///
    /// Stored big-endian in the request's packet-size array. Ignored for
    /// other request kinds.
    pub fn set_packet_return_value(&self, index: usize, value: u16) {
        let TransferRequest::Isochronous(iso) = &self.request else {
            return;
        };
        let Ok(index) = u32::try_from(index) else {
            return;
        };
        let address = iso.packet_sizes_address.wrapping_add(index.wrapping_mul(2));
        self.kernel.write_memory(address, &value.to_be_bytes());
    }

    /// Deliver the one reply for this request
    pub fn on_transfer_complete(&self, outcome: TransferOutcome) {
        self.kernel.enqueue_reply(self.request.id(), outcome.code());
    }
}

impl fmt::Debug for TransferCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCommand")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_test_kernel;
    use protocol::{BulkMessage, IsoMessage};

    fn bulk(endpoint: u8, length: u16) -> TransferRequest {
        TransferRequest::Bulk(BulkMessage {
            id: RequestId(9),
            endpoint,
            length,
            data_address: 0x100,
        })
    }

    #[test]
    fn test_out_buffer_is_read_from_guest() {
        let (kernel, _bridge) = create_test_kernel();
        kernel.write_memory(0x100, &[1, 2, 3, 4]);

        let command = TransferCommand::new(bulk(0x02, 4), kernel);
        assert_eq!(command.make_buffer(4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_in_buffer_is_zeroed() {
        let (kernel, _bridge) = create_test_kernel();
        kernel.write_memory(0x100, &[1, 2, 3, 4]);

        let command = TransferCommand::new(bulk(0x82, 4), kernel);
        assert_eq!(command.make_buffer(4), vec![0; 4]);
    }

    #[test]
    fn test_fill_buffer_respects_declared_length() {
        let (kernel, _bridge) = create_test_kernel();
        let command = TransferCommand::new(bulk(0x81, 2), kernel.clone());

        command.fill_buffer(&[0xAA, 0xBB, 0xCC, 0xDD], 4);
        assert_eq!(kernel.dump(0x100, 4), vec![0xAA, 0xBB, 0, 0]);
    }

    #[test]
    fn test_packet_return_values_are_big_endian() {
        let (kernel, _bridge) = create_test_kernel();
        let command = TransferCommand::new(
            TransferRequest::Isochronous(IsoMessage {
                id: RequestId(1),
                endpoint: 0x83,
                length: 16,
                packet_sizes: vec![8, 8],
                packet_sizes_address: 0x200,
                data_address: 0x300,
            }),
            kernel.clone(),
        );

        command.set_packet_return_value(0, 0x0102);
        command.set_packet_return_value(1, 5);
        assert_eq!(kernel.dump(0x200, 4), vec![0x01, 0x02, 0x00, 0x05]);
    }

    #[test]
    fn test_reply_carries_outcome_code() {
        let (kernel, bridge) = create_test_kernel();
        let command = TransferCommand::new(bulk(0x81, 8), kernel);

        command.on_transfer_complete(TransferOutcome::Stalled);
        let reply = bridge.try_recv_reply().unwrap();
        assert_eq!(reply.request, RequestId(9));
        assert_eq!(reply.result, protocol::TRANSFER_STALLED);
    }
}

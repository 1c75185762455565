//! Per-endpoint registry of in-flight transfers
//!
//! Entries are added on the owning thread before a transfer is submitted and
//! removed from whatever thread the host completes the transfer on. Every
//! access goes through the registry's mutex.

use crate::usb::command::TransferCommand;
use crate::usb::host::{HostHandle, Transfer, TransferId, TransferStatus};
use crate::usb::identity::DeviceIdentity;
use protocol::TransferOutcome;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// In-flight transfers of one endpoint address
pub struct TransferEndpoint {
    identity: DeviceIdentity,
    endpoint: u8,
    transfers: Mutex<HashMap<TransferId, TransferCommand>>,
}

impl TransferEndpoint {
    pub fn new(identity: DeviceIdentity, endpoint: u8) -> Self {
        Self {
            identity,
            endpoint,
            transfers: Mutex::new(HashMap::new()),
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn add_transfer(&self, id: TransferId, command: TransferCommand) {
        self.lock().insert(id, command);
    }

    /// Forget a transfer that never reached the host
    pub fn remove_transfer(&self, id: TransferId) -> Option<TransferCommand> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of transfers still waiting for completion
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Complete a transfer: reply to its command and drop the entry
    ///
    /// `result_fn` computes the reply value of a successful transfer from the
    /// command, the completed transfer and its payload. It runs with the
    /// registry locked.
    pub fn handle_transfer<F>(&self, mut transfer: Transfer, result_fn: F)
    where
        F: FnOnce(&TransferCommand, &Transfer, &[u8]) -> i32,
    {
        let mut transfers = self.lock();
        let id = transfer.id();
        let Some(command) = transfers.get(&id) else {
            error!(
                "{} No such transfer {} on endpoint {:#04x}",
                self.identity, id, self.endpoint
            );
            return;
        };

        let buffer = transfer.take_buffer();
        let outcome = match transfer.status() {
            TransferStatus::Completed => {
                TransferOutcome::Completed(result_fn(command, &transfer, &buffer))
            }
            TransferStatus::Stall => {
                warn!(
                    "{} {} transfer on endpoint {:#04x} stalled",
                    self.identity,
                    transfer.kind().name(),
                    self.endpoint
                );
                TransferOutcome::Stalled
            }
            TransferStatus::NoDevice => {
                warn!(
                    "{} {} transfer on endpoint {:#04x}: device gone",
                    self.identity,
                    transfer.kind().name(),
                    self.endpoint
                );
                TransferOutcome::NoDevice
            }
            status => {
                error!(
                    "{} {} transfer on endpoint {:#04x} failed: {:?}",
                    self.identity,
                    transfer.kind().name(),
                    self.endpoint,
                    status
                );
                TransferOutcome::Failed
            }
        };

        debug!(
            "{} Transfer {} on endpoint {:#04x} -> {}",
            self.identity,
            id,
            self.endpoint,
            outcome.code()
        );
        command.on_transfer_complete(outcome);
        transfers.remove(&id);
    }

    /// Ask the host to cancel every transfer still registered here
    ///
    /// Entries stay registered; each is removed by its own cancelled
    /// completion.
    pub fn cancel_transfers(&self, handle: &dyn HostHandle) {
        let transfers = self.lock();
        if !transfers.is_empty() {
            debug!(
                "{} Cancelling {} transfers on endpoint {:#04x}",
                self.identity,
                transfers.len(),
                self.endpoint
            );
        }
        for id in transfers.keys() {
            if let Err(e) = handle.cancel_transfer(*id) {
                warn!("{} Failed to cancel transfer {}: {}", self.identity, id, e);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TransferId, TransferCommand>> {
        self.transfers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::host::TransferKind;
    use crate::usb::mock::MockHandle;
    use common::test_utils::create_test_kernel;
    use protocol::{BulkMessage, RequestId, TRANSFER_FAILED, TRANSFER_STALLED, TransferRequest};
    use std::sync::Arc;

    fn registry() -> Arc<TransferEndpoint> {
        Arc::new(TransferEndpoint::new(
            DeviceIdentity::new(0x057e, 0x0337, 1, 2),
            0x81,
        ))
    }

    fn command(kernel: Arc<common::ChannelKernel>, id: u64) -> TransferCommand {
        TransferCommand::new(
            TransferRequest::Bulk(BulkMessage {
                id: RequestId(id),
                endpoint: 0x81,
                length: 4,
                data_address: 0x40,
            }),
            kernel,
        )
    }

    fn bulk_transfer(registry: &Arc<TransferEndpoint>) -> Transfer {
        let registry = Arc::clone(registry);
        Transfer::new(TransferKind::Bulk, 0x81, vec![1, 2, 3, 4]).on_complete(move |transfer| {
            registry.handle_transfer(transfer, |command, transfer, buffer| {
                command.fill_buffer(buffer, transfer.actual_length());
                transfer.actual_length() as i32
            })
        })
    }

    #[test]
    fn test_completion_replies_and_erases() {
        let (kernel, bridge) = create_test_kernel();
        let registry = registry();
        let transfer = bulk_transfer(&registry);
        registry.add_transfer(transfer.id(), command(kernel.clone(), 1));
        assert_eq!(registry.pending(), 1);

        transfer.complete(TransferStatus::Completed, 3);

        assert_eq!(registry.pending(), 0);
        let reply = bridge.try_recv_reply().unwrap();
        assert_eq!((reply.request, reply.result), (RequestId(1), 3));
        assert_eq!(kernel.dump(0x40, 4), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_failure_statuses() {
        let cases = [
            (TransferStatus::Error, TRANSFER_FAILED),
            (TransferStatus::Cancelled, TRANSFER_FAILED),
            (TransferStatus::TimedOut, TRANSFER_FAILED),
            (TransferStatus::Overflow, TRANSFER_FAILED),
            (TransferStatus::Stall, TRANSFER_STALLED),
            (TransferStatus::NoDevice, protocol::IPC_ENOENT),
        ];

        for (status, code) in cases {
            let (kernel, bridge) = create_test_kernel();
            let registry = registry();
            let transfer = bulk_transfer(&registry);
            registry.add_transfer(transfer.id(), command(kernel.clone(), 2));

            transfer.complete(status, 4);

            assert_eq!(bridge.try_recv_reply().unwrap().result, code, "{:?}", status);
            assert_eq!(registry.pending(), 0);
            // Nothing copied on failure
            assert_eq!(kernel.dump(0x40, 4), vec![0; 4]);
        }
    }

    #[test]
    fn test_unknown_transfer_is_ignored() {
        let (_kernel, bridge) = create_test_kernel();
        let registry = registry();
        let transfer = bulk_transfer(&registry);

        transfer.complete(TransferStatus::Completed, 4);

        assert!(bridge.try_recv_reply().is_none());
    }

    #[test]
    fn test_remove_transfer() {
        let (kernel, _bridge) = create_test_kernel();
        let registry = registry();
        let transfer = bulk_transfer(&registry);
        registry.add_transfer(transfer.id(), command(kernel, 3));

        assert!(registry.remove_transfer(transfer.id()).is_some());
        assert!(!registry.contains(transfer.id()));
    }

    #[test]
    fn test_cancel_keeps_entries_until_completion() {
        let (kernel, bridge) = create_test_kernel();
        let handle = MockHandle::detached();
        let registry = registry();

        let first = bulk_transfer(&registry);
        let second = bulk_transfer(&registry);
        let ids = [first.id(), second.id()];
        registry.add_transfer(ids[0], command(kernel.clone(), 10));
        registry.add_transfer(ids[1], command(kernel.clone(), 11));

        registry.cancel_transfers(&handle);

        let mut cancelled = handle.state().cancelled();
        cancelled.sort();
        assert_eq!(cancelled, ids.to_vec());
        assert_eq!(registry.pending(), 2);
        assert!(bridge.try_recv_reply().is_none());

        first.complete(TransferStatus::Cancelled, 0);
        second.complete(TransferStatus::Cancelled, 0);
        assert_eq!(registry.pending(), 0);
        assert_eq!(bridge.pending(), 2);
    }
}

//! Guest kernel collaborator
//!
//! The passthrough core talks to the guest through exactly three things:
//! reading guest memory (outbound payloads), writing guest memory (inbound
//! payloads, isochronous packet lengths) and enqueueing a reply for a request.
//! [`GuestKernel`] is that boundary. [`ChannelKernel`] is a self-contained
//! implementation backed by a flat memory arena and a reply channel.

use crate::channel::{Reply, ReplyQueue};
use protocol::RequestId;
use std::sync::Mutex;
use tracing::{error, warn};

/// Guest-side services used by the passthrough core
///
/// Implementations are called from completion context as well as from the
/// owning thread, and must not block for long.
pub trait GuestKernel: Send + Sync {
    /// Copy `buf.len()` bytes of guest memory starting at `address` into `buf`
    fn read_memory(&self, address: u32, buf: &mut [u8]);

    /// Copy `data` into guest memory starting at `address`
    fn write_memory(&self, address: u32, data: &[u8]);

    /// Deliver the reply for `request` with a signed result code
    fn enqueue_reply(&self, request: RequestId, result: i32);
}

/// Guest kernel backed by an in-process memory arena and a reply channel
pub struct ChannelKernel {
    memory: Mutex<Vec<u8>>,
    replies: ReplyQueue,
}

impl ChannelKernel {
    /// Create a kernel with `memory_size` bytes of zeroed guest memory
    pub fn new(memory_size: usize, replies: ReplyQueue) -> Self {
        Self {
            memory: Mutex::new(vec![0; memory_size]),
            replies,
        }
    }

    /// Copy `len` bytes out of guest memory
    pub fn dump(&self, address: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.read_memory(address, &mut buf);
        buf
    }

    /// Size of the guest memory arena
    pub fn memory_size(&self) -> usize {
        self.memory.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn range(memory_len: usize, address: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = address as usize;
        let end = start.checked_add(len)?;
        (end <= memory_len).then_some(start..end)
    }
}

impl GuestKernel for ChannelKernel {
    fn read_memory(&self, address: u32, buf: &mut [u8]) {
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        match Self::range(memory.len(), address, buf.len()) {
            Some(range) => buf.copy_from_slice(&memory[range]),
            None => {
                warn!(
                    "Guest read out of range: {:#010x}+{} (memory size {})",
                    address,
                    buf.len(),
                    memory.len()
                );
                buf.fill(0);
            }
        }
    }

    fn write_memory(&self, address: u32, data: &[u8]) {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        let memory_len = memory.len();
        match Self::range(memory_len, address, data.len()) {
            Some(range) => memory[range].copy_from_slice(data),
            None => warn!(
                "Guest write out of range: {:#010x}+{} (memory size {})",
                address,
                data.len(),
                memory_len
            ),
        }
    }

    fn enqueue_reply(&self, request: RequestId, result: i32) {
        if let Err(e) = self.replies.enqueue(Reply { request, result }) {
            error!("Dropping reply for request {:?}: {}", request, e);
        }
    }
}

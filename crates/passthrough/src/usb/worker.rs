//! Transfer lanes for the rusb transport
//!
//! rusb only offers blocking transfers, so each endpoint address gets a
//! dedicated thread (a lane) that executes its transfers in submission
//! order and completes them from that thread. Lanes of one handle share the
//! device handle, the set of cancellation requests and a shutdown flag.
//!
//! Blocking reads are issued in short slices so a lane notices cancellation
//! and shutdown while the device has nothing to say. A slice that times out
//! after partial data does not end the transfer: reads continue into the rest
//! of the buffer until it is full or the device sends a short packet.

use crate::usb::host::{Transfer, TransferId, TransferKind, TransferStatus};
use async_channel::{Receiver, Sender, unbounded};
use byteorder::{ByteOrder, LittleEndian};
use protocol::CONTROL_SETUP_SIZE;
use rusb::{Context, DeviceHandle};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Longest a lane blocks in one read before checking for cancellation
const POLL_SLICE: Duration = Duration::from_millis(100);

/// libusb reads a zero timeout as "wait forever"
const MIN_SLICE: Duration = Duration::from_millis(1);

/// State shared by all lanes of one open device
pub struct LaneShared {
    handle: DeviceHandle<Context>,
    cancelled: Mutex<HashSet<TransferId>>,
    shutdown: AtomicBool,
}

impl LaneShared {
    pub fn new(handle: DeviceHandle<Context>) -> Self {
        Self {
            handle,
            cancelled: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    pub fn request_cancel(&self, id: TransferId) {
        self.lock_cancelled().insert(id);
    }

    /// Make every lane finish its queue with cancelled completions
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn should_stop(&self, id: TransferId) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.lock_cancelled().contains(&id)
    }

    fn forget(&self, id: TransferId) {
        self.lock_cancelled().remove(&id);
    }

    fn lock_cancelled(&self) -> MutexGuard<'_, HashSet<TransferId>> {
        self.cancelled.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Queue and thread of one endpoint address
pub struct TransferLane {
    tx: Sender<Transfer>,
    thread: Option<JoinHandle<()>>,
}

impl TransferLane {
    /// Start the lane of `endpoint`
    ///
    /// `max_packet_size` is the endpoint's wMaxPacketSize, used to recognise
    /// short packets; 0 when unknown, which makes every read final.
    pub fn spawn(
        endpoint: u8,
        max_packet_size: u16,
        shared: Arc<LaneShared>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let thread = std::thread::Builder::new()
            .name(format!("usb-lane-{:02x}", endpoint))
            .spawn(move || run_lane(endpoint, max_packet_size, shared, rx))?;

        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    /// Queue a transfer; gives it back if the lane is gone
    pub fn send(&self, transfer: Transfer) -> Result<(), Transfer> {
        self.tx.try_send(transfer).map_err(|e| e.into_inner())
    }

    /// Stop accepting transfers; the thread exits once its queue is drained
    pub fn close(&mut self) {
        self.tx.close();
        // Not joined: a control transfer without timeout may block indefinitely
        self.thread.take();
    }
}

impl Drop for TransferLane {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_lane(
    endpoint: u8,
    max_packet_size: u16,
    shared: Arc<LaneShared>,
    rx: Receiver<Transfer>,
) {
    debug!(
        "Transfer lane {:#04x} started (max packet {})",
        endpoint, max_packet_size
    );

    while let Ok(mut transfer) = rx.recv_blocking() {
        let id = transfer.id();
        let (status, actual_length) = if shared.should_stop(id) {
            (TransferStatus::Cancelled, 0)
        } else {
            execute(&shared, max_packet_size, &mut transfer)
        };
        trace!(
            "Lane {:#04x}: transfer {} -> {:?} ({} bytes)",
            endpoint, id, status, actual_length
        );

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            transfer.complete(status, actual_length)
        }));
        if let Err(e) = result {
            error!("Panic in completion of transfer {}: {:?}", id, e);
        }
        // No cancel request can arrive for a completed transfer
        shared.forget(id);
    }

    debug!("Transfer lane {:#04x} stopped", endpoint);
}

fn execute(
    shared: &LaneShared,
    max_packet_size: u16,
    transfer: &mut Transfer,
) -> (TransferStatus, usize) {
    let endpoint = transfer.endpoint();
    let timeout = transfer.timeout();
    let id = transfer.id();
    let is_in = endpoint & 0x80 != 0;
    let limits = ReadLimits {
        timeout,
        length: transfer.buffer().len(),
        max_packet_size,
    };

    match transfer.kind() {
        TransferKind::Control => execute_control(shared.handle(), transfer),
        TransferKind::Bulk if is_in => read_sliced(
            limits,
            || shared.should_stop(id),
            |offset, slice| {
                shared
                    .handle()
                    .read_bulk(endpoint, &mut transfer.buffer_mut()[offset..], slice)
            },
        ),
        TransferKind::Interrupt if is_in => read_sliced(
            limits,
            || shared.should_stop(id),
            |offset, slice| {
                shared
                    .handle()
                    .read_interrupt(endpoint, &mut transfer.buffer_mut()[offset..], slice)
            },
        ),
        TransferKind::Bulk => {
            completed(shared.handle().write_bulk(endpoint, transfer.buffer(), timeout))
        }
        TransferKind::Interrupt => completed(shared.handle().write_interrupt(
            endpoint,
            transfer.buffer(),
            timeout,
        )),
        TransferKind::Isochronous => {
            error!("Isochronous transfer {} reached a lane", id);
            (TransferStatus::Error, 0)
        }
    }
}

fn execute_control(
    handle: &DeviceHandle<Context>,
    transfer: &mut Transfer,
) -> (TransferStatus, usize) {
    let timeout = transfer.timeout();
    let buffer = transfer.buffer_mut();
    if buffer.len() < CONTROL_SETUP_SIZE {
        return (TransferStatus::Error, 0);
    }

    let (setup, data) = buffer.split_at_mut(CONTROL_SETUP_SIZE);
    let request_type = setup[0];
    let request = setup[1];
    let value = LittleEndian::read_u16(&setup[2..4]);
    let index = LittleEndian::read_u16(&setup[4..6]);
    let length = usize::from(LittleEndian::read_u16(&setup[6..8])).min(data.len());
    let data = &mut data[..length];

    if request_type & 0x80 != 0 {
        completed(handle.read_control(request_type, request, value, index, data, timeout))
    } else {
        completed(handle.write_control(request_type, request, value, index, data, timeout))
    }
}

/// Shape of one IN transfer
#[derive(Debug, Clone, Copy)]
struct ReadLimits {
    /// Zero waits forever
    timeout: Duration,
    length: usize,
    /// 0 when unknown
    max_packet_size: u16,
}

impl ReadLimits {
    /// Whether a read of `n` bytes, bringing the total to `received`, ends
    /// the transfer
    fn is_final(&self, n: usize, received: usize) -> bool {
        let max_packet = usize::from(self.max_packet_size);
        received >= self.length || n == 0 || max_packet == 0 || n % max_packet != 0
    }
}

/// Repeat a blocking read in slices until the buffer is full, a short packet
/// arrives, the transfer's own timeout passes, or the transfer is cancelled
///
/// `read` gets the offset to continue at. rusb reports a slice that timed
/// out after partial data as `Ok`; a whole number of full packets short of
/// the requested length therefore keeps the transfer going.
fn read_sliced<S, F>(limits: ReadLimits, should_stop: S, mut read: F) -> (TransferStatus, usize)
where
    S: Fn() -> bool,
    F: FnMut(usize, Duration) -> Result<usize, rusb::Error>,
{
    let deadline = (!limits.timeout.is_zero()).then(|| Instant::now() + limits.timeout);
    let mut received = 0;

    loop {
        if should_stop() {
            return (TransferStatus::Cancelled, received);
        }

        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return (TransferStatus::TimedOut, received);
                }
                remaining.clamp(MIN_SLICE, POLL_SLICE)
            }
            None => POLL_SLICE,
        };

        match read(received, slice) {
            Ok(n) => {
                received += n;
                if limits.is_final(n, received) {
                    return (TransferStatus::Completed, received);
                }
                trace!("Partial read of {} bytes ({} so far)", n, received);
            }
            Err(rusb::Error::Timeout) => continue,
            Err(e) => return (status_from_error(e), received),
        }
    }
}

fn completed(result: Result<usize, rusb::Error>) -> (TransferStatus, usize) {
    match result {
        Ok(n) => (TransferStatus::Completed, n),
        Err(e) => (status_from_error(e), 0),
    }
}

/// Terminal status for a failed blocking transfer
pub fn status_from_error(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Interrupted => TransferStatus::Cancelled,
        _ => TransferStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_error() {
        assert_eq!(status_from_error(rusb::Error::Timeout), TransferStatus::TimedOut);
        assert_eq!(status_from_error(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(status_from_error(rusb::Error::NoDevice), TransferStatus::NoDevice);
        assert_eq!(status_from_error(rusb::Error::Overflow), TransferStatus::Overflow);
        assert_eq!(status_from_error(rusb::Error::Io), TransferStatus::Error);
    }

    fn limits(timeout: Duration, length: usize, max_packet_size: u16) -> ReadLimits {
        ReadLimits {
            timeout,
            length,
            max_packet_size,
        }
    }

    #[test]
    fn test_read_sliced_returns_data() {
        let mut attempts = 0;
        let result = read_sliced(
            limits(Duration::ZERO, 64, 64),
            || false,
            |_, _| {
                attempts += 1;
                if attempts < 3 {
                    Err(rusb::Error::Timeout)
                } else {
                    Ok(5)
                }
            },
        );
        assert_eq!(result, (TransferStatus::Completed, 5));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_read_sliced_continues_after_partial_slice() {
        // 512-byte read on a 64-byte endpoint: the first slice times out after
        // one packet, the second ends with a short packet
        let mut offsets = Vec::new();
        let mut reads = [Ok(64), Err(rusb::Error::Timeout), Ok(128 + 10)].into_iter();
        let result = read_sliced(
            limits(Duration::ZERO, 512, 64),
            || false,
            |offset, _| {
                offsets.push(offset);
                reads.next().unwrap()
            },
        );
        assert_eq!(result, (TransferStatus::Completed, 202));
        assert_eq!(offsets, vec![0, 64, 64]);
    }

    #[test]
    fn test_read_sliced_stops_when_buffer_full() {
        let mut calls = 0;
        let result = read_sliced(
            limits(Duration::ZERO, 128, 64),
            || false,
            |_, _| {
                calls += 1;
                Ok(64)
            },
        );
        assert_eq!(result, (TransferStatus::Completed, 128));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_read_sliced_zero_length_packet_ends_transfer() {
        let mut reads = [Ok(64), Ok(0)].into_iter();
        let result = read_sliced(
            limits(Duration::ZERO, 512, 64),
            || false,
            |_, _| reads.next().unwrap(),
        );
        assert_eq!(result, (TransferStatus::Completed, 64));
    }

    #[test]
    fn test_read_sliced_unknown_packet_size_takes_first_read() {
        let result = read_sliced(limits(Duration::ZERO, 512, 0), || false, |_, _| Ok(64));
        assert_eq!(result, (TransferStatus::Completed, 64));
    }

    #[test]
    fn test_read_sliced_observes_cancellation() {
        let stop = AtomicBool::new(false);
        let result = read_sliced(
            limits(Duration::ZERO, 64, 64),
            || stop.load(Ordering::SeqCst),
            |_, slice| {
                assert!(slice <= POLL_SLICE);
                stop.store(true, Ordering::SeqCst);
                Err(rusb::Error::Timeout)
            },
        );
        assert_eq!(result, (TransferStatus::Cancelled, 0));
    }

    #[test]
    fn test_read_sliced_honours_timeout() {
        let result = read_sliced(
            limits(Duration::from_millis(30), 64, 64),
            || false,
            |_, slice| {
                std::thread::sleep(slice);
                Err(rusb::Error::Timeout)
            },
        );
        assert_eq!(result, (TransferStatus::TimedOut, 0));
    }

    #[test]
    fn test_read_sliced_never_issues_zero_timeout() {
        let mut slices = Vec::new();
        let result = read_sliced(
            limits(Duration::from_micros(1500), 64, 64),
            || false,
            |_, slice| {
                slices.push(slice);
                std::thread::sleep(Duration::from_micros(600));
                Err(rusb::Error::Timeout)
            },
        );
        assert_eq!(result.0, TransferStatus::TimedOut);
        assert!(!slices.is_empty());
        assert!(slices.iter().all(|slice| *slice >= MIN_SLICE));
    }

    #[test]
    fn test_read_sliced_maps_errors() {
        let result = read_sliced(
            limits(Duration::ZERO, 64, 64),
            || false,
            |_, _| Err(rusb::Error::Pipe),
        );
        assert_eq!(result, (TransferStatus::Stall, 0));
    }

    #[test]
    fn test_completed() {
        assert_eq!(completed(Ok(12)), (TransferStatus::Completed, 12));
        assert_eq!(completed(Err(rusb::Error::Pipe)), (TransferStatus::Stall, 0));
    }
}

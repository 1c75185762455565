//! Host transport boundary
//!
//! Everything the passthrough core needs from the host USB stack goes through
//! [`HostDevice`] (an enumerated, not yet opened device) and [`HostHandle`]
//! (an open device). The rusb-backed implementation lives in
//! [`crate::usb::rusb_host`]; [`crate::usb::mock`] provides a scriptable one.
//!
//! Host errors are `rusb::Error` values on both implementations, so the
//! native code can be surfaced to callers unchanged.
//!
//! # Transfers
//!
//! A [`Transfer`] is an owned value. Submitting it moves it into the host
//! transport; completing it moves it into its completion callback. Whoever
//! holds the transfer owns its data buffer, so the buffer is released exactly
//! once, wherever the transfer finally drops.

use protocol::{ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Result of a host transport operation
pub type HostResult<T> = Result<T, rusb::Error>;

/// Identity of a submitted transfer
///
/// Unique for the lifetime of the process, so a completion can never be
/// confused with an earlier transfer that happened to reuse a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// USB transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    pub fn name(self) -> &'static str {
        match self {
            TransferKind::Control => "Control",
            TransferKind::Isochronous => "Isochronous",
            TransferKind::Bulk => "Bulk",
            TransferKind::Interrupt => "Interrupt",
        }
    }
}

/// Terminal status of a transfer, as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Not completed yet
    Pending,
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

/// One packet of an isochronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacket {
    pub length: u16,
    pub actual_length: u16,
}

type CompletionFn = Box<dyn FnOnce(Transfer) + Send>;

/// An asynchronous USB transfer
///
/// For control transfers the buffer starts with the 8-byte setup packet and
/// `actual_length` counts data-stage bytes only. `length()` is always the
/// full buffer length, setup included.
pub struct Transfer {
    id: TransferId,
    kind: TransferKind,
    endpoint: u8,
    buffer: Vec<u8>,
    length: usize,
    timeout: Duration,
    iso_packets: Vec<IsoPacket>,
    status: TransferStatus,
    actual_length: usize,
    callback: Option<CompletionFn>,
}

impl Transfer {
    /// Create a transfer with no timeout and no completion callback
    pub fn new(kind: TransferKind, endpoint: u8, buffer: Vec<u8>) -> Self {
        let length = buffer.len();
        Self {
            id: TransferId::next(),
            kind,
            endpoint,
            buffer,
            length,
            timeout: Duration::ZERO,
            iso_packets: Vec::new(),
            status: TransferStatus::Pending,
            actual_length: 0,
            callback: None,
        }
    }

    /// Set the timeout; zero means none
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allocate `count` zero-length packet descriptors
    pub fn with_iso_packets(mut self, count: usize) -> Self {
        self.iso_packets = vec![IsoPacket::default(); count];
        self
    }

    /// Set the callback invoked when the host completes the transfer
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Transfer) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn set_iso_packet_length(&mut self, index: usize, length: u16) {
        self.iso_packets[index].length = length;
    }

    pub fn set_iso_packet_actual_length(&mut self, index: usize, actual_length: u16) {
        self.iso_packets[index].actual_length = actual_length;
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Take ownership of the data buffer, leaving the transfer empty
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Declared length of the transfer, unaffected by `take_buffer`
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn iso_packets(&self) -> &[IsoPacket] {
        &self.iso_packets
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Finish the transfer and hand it to its completion callback
    ///
    /// Called by host transports only. `actual_length` is clamped to what the
    /// buffer can hold.
    pub fn complete(mut self, status: TransferStatus, actual_length: usize) {
        self.status = status;
        self.actual_length = actual_length.min(self.payload_capacity());
        match self.callback.take() {
            Some(callback) => callback(self),
            None => warn!(
                "{} transfer {} (endpoint {:#04x}) completed without a callback",
                self.kind.name(),
                self.id,
                self.endpoint
            ),
        }
    }

    fn payload_capacity(&self) -> usize {
        match self.kind {
            TransferKind::Control => self.length.saturating_sub(protocol::CONTROL_SETUP_SIZE),
            _ => self.length,
        }
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("length", &self.length)
            .field("timeout", &self.timeout)
            .field("iso_packets", &self.iso_packets.len())
            .field("status", &self.status)
            .field("actual_length", &self.actual_length)
            .finish()
    }
}

/// One alternate setting of an interface, with its endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSetting {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// All alternate settings of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceTree {
    pub alt_settings: Vec<AltSetting>,
}

/// A configuration descriptor with its interface tree, as fetched from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTree {
    pub descriptor: ConfigDescriptor,
    pub interfaces: Vec<InterfaceTree>,
}

/// An enumerated host device that has not been opened
pub trait HostDevice: Send + 'static {
    type Handle: HostHandle;

    fn bus_number(&self) -> u8;

    fn address(&self) -> u8;

    fn device_descriptor(&self) -> HostResult<DeviceDescriptor>;

    /// Fetch configuration `index` (0-based, not bConfigurationValue)
    fn config_descriptor(&self, index: u8) -> HostResult<ConfigTree>;

    fn open(&self) -> HostResult<Self::Handle>;
}

/// An open host device handle
///
/// Closing the handle is dropping it.
pub trait HostHandle: Send + Sync + 'static {
    fn detach_kernel_driver(&self, interface: u8) -> HostResult<()>;

    fn claim_interface(&self, interface: u8) -> HostResult<()>;

    fn release_interface(&self, interface: u8) -> HostResult<()>;

    fn set_alternate_setting(&self, interface: u8, alt_setting: u8) -> HostResult<()>;

    fn set_configuration(&self, configuration: u8) -> HostResult<()>;

    /// Queue a transfer
    ///
    /// On success the transport owns the transfer until it calls
    /// [`Transfer::complete`], from a context of its choosing. On failure the
    /// transfer is dropped without its callback running.
    fn submit_transfer(&self, transfer: Transfer) -> HostResult<()>;

    /// Request cancellation of a submitted transfer
    ///
    /// Must not complete the transfer synchronously: the cancelled completion
    /// arrives later through the transfer's callback.
    fn cancel_transfer(&self, id: TransferId) -> HostResult<()>;
}

/// libusb numeric code for a host error
pub fn error_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

/// Human-readable name for a libusb numeric code
pub fn error_name(code: i32) -> &'static str {
    match code {
        0 => "LIBUSB_SUCCESS",
        -1 => "LIBUSB_ERROR_IO",
        -2 => "LIBUSB_ERROR_INVALID_PARAM",
        -3 => "LIBUSB_ERROR_ACCESS",
        -4 => "LIBUSB_ERROR_NO_DEVICE",
        -5 => "LIBUSB_ERROR_NOT_FOUND",
        -6 => "LIBUSB_ERROR_BUSY",
        -7 => "LIBUSB_ERROR_TIMEOUT",
        -8 => "LIBUSB_ERROR_OVERFLOW",
        -9 => "LIBUSB_ERROR_PIPE",
        -10 => "LIBUSB_ERROR_INTERRUPTED",
        -11 => "LIBUSB_ERROR_NO_MEM",
        -12 => "LIBUSB_ERROR_NOT_SUPPORTED",
        -99 => "LIBUSB_ERROR_OTHER",
        _ => "**UNKNOWN**",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_transfer_ids_are_unique() {
        let a = Transfer::new(TransferKind::Control, 0, vec![0; 8]);
        let b = Transfer::new(TransferKind::Control, 0, vec![0; 8]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_complete_invokes_callback_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let transfer = Transfer::new(TransferKind::Bulk, 0x81, vec![0; 64]).on_complete(
            move |transfer| {
                sink.lock()
                    .unwrap()
                    .push((transfer.status(), transfer.actual_length()));
            },
        );
        transfer.complete(TransferStatus::Completed, 32);

        assert_eq!(*seen.lock().unwrap(), vec![(TransferStatus::Completed, 32)]);
    }

    #[test]
    fn test_actual_length_is_clamped() {
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);

        // 8 setup bytes + 4 data bytes
        let transfer = Transfer::new(TransferKind::Control, 0, vec![0; 12])
            .on_complete(move |transfer| *sink.lock().unwrap() = transfer.actual_length());
        transfer.complete(TransferStatus::Completed, 100);

        assert_eq!(*seen.lock().unwrap(), 4);
    }

    #[test]
    fn test_take_buffer_keeps_length() {
        let mut transfer = Transfer::new(TransferKind::Interrupt, 0x82, vec![7; 16]);
        let buffer = transfer.take_buffer();
        assert_eq!(buffer.len(), 16);
        assert!(transfer.buffer().is_empty());
        assert_eq!(transfer.length(), 16);
    }

    #[test]
    fn test_iso_packets() {
        let mut transfer =
            Transfer::new(TransferKind::Isochronous, 0x83, vec![0; 24]).with_iso_packets(3);
        for i in 0..3 {
            transfer.set_iso_packet_length(i, 8);
        }
        transfer.set_iso_packet_actual_length(1, 5);

        assert_eq!(transfer.iso_packets().len(), 3);
        assert!(transfer.iso_packets().iter().all(|p| p.length == 8));
        assert_eq!(transfer.iso_packets()[1].actual_length, 5);
        assert_eq!(transfer.timeout(), Duration::ZERO);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(error_code(rusb::Error::NotFound), -5);
        assert_eq!(error_code(rusb::Error::NoDevice), -4);
        assert_eq!(error_code(rusb::Error::NotSupported), -12);
        assert_eq!(error_name(error_code(rusb::Error::Pipe)), "LIBUSB_ERROR_PIPE");
        assert_eq!(error_name(0), "LIBUSB_SUCCESS");
        assert_eq!(error_name(42), "**UNKNOWN**");
    }
}

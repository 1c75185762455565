//! Guest-facing vocabulary for usb-passthrough
//!
//! This crate defines what the guest side of the passthrough sees: the four
//! request kinds it can issue, the correlation id used to match replies, the
//! small result-code vocabulary replies are expressed in, and the descriptor
//! values the passthrough core hands back when asked about a device.
//!
//! Nothing here knows about the host USB stack. Host error codes never cross
//! into these types; they are normalized to [`TransferOutcome`] first.
//!
//! # Example
//!
//! ```
//! use protocol::{RequestId, TransferOutcome, TransferRequest, BulkMessage};
//!
//! let request = TransferRequest::Bulk(BulkMessage {
//!     id: RequestId(7),
//!     endpoint: 0x81,
//!     length: 64,
//!     data_address: 0x1000,
//! });
//! assert_eq!(request.endpoint(), 0x81);
//! assert_eq!(TransferOutcome::Completed(64).code(), 64);
//! assert_eq!(TransferOutcome::Stalled.code(), -7004);
//! ```

pub mod error;
pub mod messages;
pub mod types;

pub use error::{DescriptorError, Result};
pub use messages::{
    BulkMessage, CONTROL_SETUP_SIZE, CtrlMessage, IntrMessage, IsoMessage, TransferRequest,
    request_header,
};
pub use types::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, IPC_ENOENT, IPC_SUCCESS,
    InterfaceDescriptor, RequestId, TRANSFER_FAILED, TRANSFER_STALLED, TransferOutcome,
};

//! Common utilities for usb-passthrough
//!
//! This crate provides what the passthrough core and its embedders share:
//! error handling, logging setup, the guest-kernel collaborator boundary and
//! the reply channel that carries guest replies out of completion context.

pub mod channel;
pub mod error;
pub mod kernel;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use channel::{Reply, ReplyBridge, ReplyQueue, create_reply_bridge};
pub use error::{Error, Result};
pub use kernel::{ChannelKernel, GuestKernel};
pub use logging::setup_logging;

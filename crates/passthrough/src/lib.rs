//! USB device passthrough core
//!
//! Bridges a guest's USB requests to a physical device on the host. A
//! [`PassthroughDevice`] owns one host device: it reports descriptors, claims
//! interfaces on demand, submits the guest's control, bulk, interrupt and
//! isochronous requests to the host asynchronously, and delivers exactly one
//! reply per request through a [`common::GuestKernel`].
//!
//! The host side is abstracted behind [`usb::HostDevice`] and
//! [`usb::HostHandle`]; [`usb::RusbDevice`] talks to real hardware and
//! [`usb::mock`] provides a scriptable transport for tests.

pub mod config;
pub mod usb;

pub use usb::{DeviceIdentity, PassthroughDevice, SessionState};

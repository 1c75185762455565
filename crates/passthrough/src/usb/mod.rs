//! USB subsystem
//!
//! - `host`: transport boundary and the owned transfer object
//! - `descriptors`: per-device descriptor cache
//! - `session`: open handle and claimed interface state
//! - `endpoint` / `command`: in-flight transfer registries and guest replies
//! - `transfers`: request submission and completion handling
//! - `device`: the passthrough device tying it together
//! - `rusb_host` / `worker`: rusb-backed transport
//! - `manager`: host device enumeration
//! - `mock`: scriptable transport for tests

pub mod command;
pub mod descriptors;
pub mod device;
pub mod endpoint;
pub mod host;
pub mod identity;
pub mod manager;
pub mod mock;
pub mod rusb_host;
pub mod session;
pub mod transfers;
pub mod worker;

pub use command::TransferCommand;
pub use descriptors::DescriptorCache;
pub use device::PassthroughDevice;
pub use endpoint::TransferEndpoint;
pub use host::{
    AltSetting, ConfigTree, HostDevice, HostHandle, HostResult, InterfaceTree, IsoPacket,
    Transfer, TransferId, TransferKind, TransferStatus, error_code, error_name,
};
pub use identity::DeviceIdentity;
pub use manager::DeviceManager;
pub use rusb_host::{RusbDevice, RusbHandle};
pub use session::{InterfaceSession, SessionState};

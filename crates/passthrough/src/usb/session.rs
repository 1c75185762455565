//! Open handle and claimed interface
//!
//! At most one interface is claimed at a time. The guest names an interface
//! when it attaches; switching to another one releases the current claim
//! first.

use crate::usb::host::{HostDevice, HostHandle, HostResult};
use crate::usb::identity::DeviceIdentity;
use tracing::{debug, error, info, warn};

/// Where a session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handle
    Closed,
    /// Handle open, no interface claimed
    Open,
    /// Handle open and `interface` claimed
    Attached { interface: u8, alt_setting: u8 },
}

/// Handle and interface-claim state of one passthrough device
pub struct InterfaceSession<H: HostHandle> {
    identity: DeviceIdentity,
    handle: Option<H>,
    active: Option<(u8, u8)>,
}

impl<H: HostHandle> InterfaceSession<H> {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            handle: None,
            active: None,
        }
    }

    pub fn state(&self) -> SessionState {
        match (&self.handle, self.active) {
            (None, _) => SessionState::Closed,
            (Some(_), None) => SessionState::Open,
            (Some(_), Some((interface, alt_setting))) => SessionState::Attached {
                interface,
                alt_setting,
            },
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.state(), SessionState::Attached { .. })
    }

    pub fn active_interface(&self) -> Option<u8> {
        self.active.map(|(interface, _)| interface)
    }

    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    /// Make `interface` the claimed interface, opening the device if needed
    ///
    /// `num_interfaces` is the interface count of the first configuration,
    /// used to bounds-check a switch from another interface.
    pub fn attach<D>(
        &mut self,
        device: &D,
        interface: u8,
        num_interfaces: Option<u8>,
    ) -> HostResult<()>
    where
        D: HostDevice<Handle = H>,
    {
        match self.active_interface() {
            Some(active) if active == interface => return Ok(()),
            Some(_) => return self.change_interface(interface, num_interfaces),
            None => {}
        }

        if self.handle.is_none() {
            info!("{} Opening device", self.identity);
            let handle = device.open().map_err(|e| {
                error!("{} Failed to open: {}", self.identity, e);
                e
            })?;
            self.handle = Some(handle);
        }

        self.attach_interface(interface)
    }

    /// Take `interface` away from any kernel driver and claim it
    pub fn attach_interface(&mut self, interface: u8) -> HostResult<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Err(rusb::Error::Io);
        };

        info!("{} Attaching interface {}", self.identity, interface);
        match handle.detach_kernel_driver(interface) {
            Ok(()) | Err(rusb::Error::NotFound) | Err(rusb::Error::NotSupported) => {}
            Err(e) => {
                error!(
                    "{} Failed to detach kernel driver: {}",
                    self.identity, e
                );
                return Err(e);
            }
        }

        handle.claim_interface(interface).map_err(|e| {
            error!(
                "{} Failed to claim interface {}: {}",
                self.identity, interface, e
            );
            e
        })?;

        self.active = Some((interface, 0));
        Ok(())
    }

    /// Release the claimed interface, if any
    pub fn detach_interface(&mut self) -> HostResult<()> {
        let (Some(handle), Some((interface, _))) = (self.handle.as_ref(), self.active) else {
            return Ok(());
        };

        info!("{} Detaching interface {}", self.identity, interface);
        match handle.release_interface(interface) {
            Ok(()) => {}
            Err(rusb::Error::NoDevice) => {
                debug!("{} Device gone while releasing interface", self.identity);
            }
            Err(e) => {
                error!(
                    "{} Failed to release interface {}: {}",
                    self.identity, interface, e
                );
                return Err(e);
            }
        }

        self.active = None;
        Ok(())
    }

    /// Switch the claim from the active interface to `interface`
    ///
    /// If the new claim fails the session is left without a claimed interface.
    pub fn change_interface(
        &mut self,
        interface: u8,
        num_interfaces: Option<u8>,
    ) -> HostResult<()> {
        let Some(active) = self.active_interface() else {
            return Err(rusb::Error::NotFound);
        };
        if interface >= num_interfaces.unwrap_or(0) {
            warn!(
                "{} Interface {} does not exist (first config has {:?} interfaces)",
                self.identity, interface, num_interfaces
            );
            return Err(rusb::Error::NotFound);
        }

        info!(
            "{} Changing interface from {} to {}",
            self.identity, active, interface
        );
        self.detach_interface()?;
        self.attach_interface(interface)
    }

    /// Select an alternate setting on the claimed interface
    pub fn set_alt_setting(&mut self, alt_setting: u8) -> HostResult<()> {
        let (Some(handle), Some((interface, _))) = (self.handle.as_ref(), self.active) else {
            return Err(rusb::Error::NotFound);
        };

        debug!(
            "{} Setting alt setting {} on interface {}",
            self.identity, alt_setting, interface
        );
        handle.set_alternate_setting(interface, alt_setting)?;
        self.active = Some((interface, alt_setting));
        Ok(())
    }

    /// Select the active configuration by bConfigurationValue
    pub fn set_configuration(&mut self, configuration: u8) -> HostResult<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Err(rusb::Error::NotFound);
        };

        debug!(
            "{} Setting configuration {}",
            self.identity, configuration
        );
        handle.set_configuration(configuration)
    }

    /// Release any claimed interface and close the handle
    pub fn close(&mut self) {
        if self.active.is_some() {
            if let Err(e) = self.detach_interface() {
                warn!(
                    "{} Closing with interface still claimed: {}",
                    self.identity, e
                );
                self.active = None;
            }
        }
        if self.handle.take().is_some() {
            info!("{} Closed device", self.identity);
        }
    }
}

impl<H: HostHandle> Drop for InterfaceSession<H> {
    fn drop(&mut self) {
        self.close();
    }
}

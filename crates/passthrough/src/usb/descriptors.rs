//! Descriptor cache
//!
//! Configuration trees are fetched once, when the device is constructed.
//! Every configuration index gets a slot; a slot is empty when the host could
//! not produce that configuration or it failed validation. Queries skip empty
//! slots instead of failing.

use crate::usb::host::{ConfigTree, HostDevice};
use crate::usb::identity::DeviceIdentity;
use protocol::{
    ConfigDescriptor, DescriptorError, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
};
use tracing::{debug, error, warn};

/// Device and configuration descriptors of one host device
#[derive(Debug, Clone)]
pub struct DescriptorCache {
    identity: DeviceIdentity,
    device: DeviceDescriptor,
    configs: Vec<Option<ConfigTree>>,
}

impl DescriptorCache {
    /// Fetch every configuration the device descriptor announces
    pub fn fetch<D: HostDevice>(
        host: &D,
        identity: DeviceIdentity,
        device: DeviceDescriptor,
    ) -> Self {
        let configs = (0..device.num_configurations)
            .map(|index| match host.config_descriptor(index) {
                Ok(tree) => match validate_config(&tree) {
                    Ok(()) => {
                        debug!(
                            "{} Cached config {} ({} interfaces)",
                            identity,
                            index,
                            tree.interfaces.len()
                        );
                        Some(tree)
                    }
                    Err(e) => {
                        warn!("{} Config {} is malformed: {}", identity, index, e);
                        None
                    }
                },
                Err(e) => {
                    warn!(
                        "{} Failed to get config descriptor {}: {}",
                        identity, index, e
                    );
                    None
                }
            })
            .collect();

        Self {
            identity,
            device,
            configs,
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Number of configuration slots, valid or not
    pub fn num_slots(&self) -> usize {
        self.configs.len()
    }

    /// Descriptors of all valid configurations, in index order
    pub fn configurations(&self) -> Vec<ConfigDescriptor> {
        self.indexed_configurations()
            .into_iter()
            .map(|(_, descriptor)| descriptor)
            .collect()
    }

    /// Valid configurations paired with their configuration index
    ///
    /// The index is what [`Self::interfaces`] and [`Self::endpoints`] take;
    /// it differs from the position in [`Self::configurations`] once an
    /// invalid slot has been skipped.
    pub fn indexed_configurations(&self) -> Vec<(u8, ConfigDescriptor)> {
        self.configs
            .iter()
            .zip(0u8..)
            .filter_map(|(slot, index)| match slot {
                Some(tree) => Some((index, tree.descriptor)),
                None => {
                    error!("{} Ignoring invalid config descriptor {}", self.identity, index);
                    None
                }
            })
            .collect()
    }

    /// Every alternate setting of every interface of configuration `config`
    ///
    /// Ordered by interface, then alternate setting. Empty when the
    /// configuration is out of range or invalid.
    pub fn interfaces(&self, config: u8) -> Vec<InterfaceDescriptor> {
        let Some(tree) = self.config(config) else {
            error!(
                "{} Invalid config descriptor index {}",
                self.identity, config
            );
            return Vec::new();
        };

        tree.interfaces
            .iter()
            .flat_map(|interface| interface.alt_settings.iter().map(|alt| alt.descriptor))
            .collect()
    }

    /// Endpoints of one alternate setting
    ///
    /// Empty when the configuration is out of range or invalid.
    ///
    /// # Panics
    ///
    /// Panics if `interface` or `alt` does not exist in a valid configuration.
    pub fn endpoints(&self, config: u8, interface: u8, alt: u8) -> Vec<EndpointDescriptor> {
        let Some(tree) = self.config(config) else {
            error!(
                "{} Invalid config descriptor index {}",
                self.identity, config
            );
            return Vec::new();
        };

        let interface = usize::from(interface);
        let alt = usize::from(alt);
        assert!(
            interface < tree.interfaces.len(),
            "interface {} out of range ({} interfaces)",
            interface,
            tree.interfaces.len()
        );
        let alt_settings = &tree.interfaces[interface].alt_settings;
        assert!(
            alt < alt_settings.len(),
            "alternate setting {} out of range ({} settings)",
            alt,
            alt_settings.len()
        );

        alt_settings[alt].endpoints.clone()
    }

    /// Number of interfaces in configuration `config`, if that configuration is valid
    pub fn num_interfaces(&self, config: u8) -> Option<u8> {
        self.config(config).map(|tree| tree.descriptor.num_interfaces)
    }

    /// Alternate settings of `interface` in the first configuration
    pub fn number_of_alt_settings(&self, interface: u8) -> usize {
        self.config(0)
            .and_then(|tree| tree.interfaces.get(usize::from(interface)))
            .map(|interface| interface.alt_settings.len())
            .unwrap_or(0)
    }

    fn config(&self, index: u8) -> Option<&ConfigTree> {
        self.configs.get(usize::from(index))?.as_ref()
    }
}

/// Check that a fetched configuration tree is internally consistent
pub fn validate_config(tree: &ConfigTree) -> protocol::Result<()> {
    tree.descriptor.validate()?;
    if usize::from(tree.descriptor.num_interfaces) != tree.interfaces.len() {
        return Err(DescriptorError::CountMismatch {
            kind: "interface",
            declared: tree.descriptor.num_interfaces,
            actual: tree.interfaces.len(),
        });
    }

    for (index, interface) in tree.interfaces.iter().enumerate() {
        let Some(first) = interface.alt_settings.first() else {
            return Err(DescriptorError::CountMismatch {
                kind: "alternate setting",
                declared: 1,
                actual: 0,
            });
        };
        // Interfaces are looked up by number, which must be their index
        let number = first.descriptor.interface_number;
        if usize::from(number) != index {
            return Err(DescriptorError::Misnumbered {
                interface: number,
                alternate: first.descriptor.alternate_setting,
                position: index,
            });
        }

        for (position, alt) in interface.alt_settings.iter().enumerate() {
            alt.descriptor.validate()?;
            if alt.descriptor.interface_number != number
                || usize::from(alt.descriptor.alternate_setting) != position
            {
                return Err(DescriptorError::Misnumbered {
                    interface: alt.descriptor.interface_number,
                    alternate: alt.descriptor.alternate_setting,
                    position,
                });
            }
            if usize::from(alt.descriptor.num_endpoints) != alt.endpoints.len() {
                return Err(DescriptorError::CountMismatch {
                    kind: "endpoint",
                    declared: alt.descriptor.num_endpoints,
                    actual: alt.endpoints.len(),
                });
            }
            for endpoint in &alt.endpoints {
                endpoint.validate()?;
            }
        }
    }

    Ok(())
}

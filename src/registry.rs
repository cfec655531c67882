//! Plugin registration: named factories per capability.
//!
//! The registry is filled once at startup and then shared read-only
//! (`Arc<PluginRegistry>`) by every pipeline run. Plugins are constructed per
//! run, so no plugin state leaks between concurrent builds.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::blockdevice::linux::{self, LinuxBlockDevice};
use crate::blockdevice::loopback::LoopPlatform;
use crate::blockdevice::virtio::{self, VirtioBlockDevice};
use crate::blockdevice::{BlockDevicePlugin, VolumePlatform};
use crate::build::config::PluginConfig;
use crate::download::{Downloader, HttpDownloader};
use crate::error::BuildError;
use crate::process::{CommandRunner, SystemRunner};
use crate::provisioner::chef::{self, ChefProvisioner};
use crate::provisioner::shell::{self, ShellProvisioner};
use crate::provisioner::Provisioner;

/// A role a plugin fulfils.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    BlockDevice,
    Provisioner,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::BlockDevice => "block-device",
            Capability::Provisioner => "provisioner",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborators handed to plugin factories.
#[derive(Clone)]
pub struct Services {
    pub runner: Arc<dyn CommandRunner>,
    pub downloader: Arc<dyn Downloader>,
    pub platform: Arc<dyn VolumePlatform>,
    pub lease_dir: PathBuf,
}

impl Services {
    /// Host processes, HTTP downloads and loop-device volumes.
    pub fn system(lease_dir: PathBuf) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Ok(Self {
            platform: Arc::new(LoopPlatform::new(Arc::clone(&runner))),
            downloader: Arc::new(HttpDownloader::new()?),
            runner,
            lease_dir,
        })
    }
}

pub type BlockDeviceFactory =
    Arc<dyn Fn(&Services, PluginConfig) -> Result<Box<dyn BlockDevicePlugin>> + Send + Sync>;
pub type ProvisionerFactory =
    Arc<dyn Fn(&Services, PluginConfig) -> Result<Box<dyn Provisioner>> + Send + Sync>;

#[derive(Default)]
pub struct PluginRegistry {
    block_devices: BTreeMap<String, BlockDeviceFactory>,
    provisioners: BTreeMap<String, ProvisionerFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `linux` and `virtio` block devices and the `chef`
    /// and `shell` provisioners.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_block_device(linux::PLUGIN_NAME, |services, config| {
            Ok(Box::new(LinuxBlockDevice::new(
                config,
                Arc::clone(&services.platform),
                services.lease_dir.clone(),
            )) as Box<dyn BlockDevicePlugin>)
        });
        registry.register_block_device(virtio::PLUGIN_NAME, |services, config| {
            Ok(Box::new(VirtioBlockDevice::new(
                config,
                Arc::clone(&services.platform),
                services.lease_dir.clone(),
            )) as Box<dyn BlockDevicePlugin>)
        });
        registry.register_provisioner(chef::PLUGIN_NAME, |services, config| {
            Ok(Box::new(ChefProvisioner::new(
                config,
                Arc::clone(&services.runner),
                Arc::clone(&services.downloader),
            )) as Box<dyn Provisioner>)
        });
        registry.register_provisioner(shell::PLUGIN_NAME, |services, config| {
            Ok(Box::new(ShellProvisioner::new(
                config,
                Arc::clone(&services.runner),
                Arc::clone(&services.downloader),
            )) as Box<dyn Provisioner>)
        });
        registry
    }

    /// Register (or replace) a block device factory under `name`.
    pub fn register_block_device<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Services, PluginConfig) -> Result<Box<dyn BlockDevicePlugin>> + Send + Sync + 'static,
    {
        self.block_devices.insert(name.into(), Arc::new(factory));
    }

    /// Register (or replace) a provisioner factory under `name`.
    pub fn register_provisioner<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Services, PluginConfig) -> Result<Box<dyn Provisioner>> + Send + Sync + 'static,
    {
        self.provisioners.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, capability: Capability, name: &str) -> bool {
        match capability {
            Capability::BlockDevice => self.block_devices.contains_key(name),
            Capability::Provisioner => self.provisioners.contains_key(name),
        }
    }

    /// Registered names for `capability`, sorted.
    pub fn names(&self, capability: Capability) -> Vec<&str> {
        match capability {
            Capability::BlockDevice => self.block_devices.keys().map(String::as_str).collect(),
            Capability::Provisioner => self.provisioners.keys().map(String::as_str).collect(),
        }
    }

    /// Fail with [`BuildError::PluginNotFound`] unless `name` is registered.
    pub fn ensure(&self, capability: Capability, name: &str) -> Result<(), BuildError> {
        if self.contains(capability, name) {
            return Ok(());
        }
        Err(BuildError::PluginNotFound {
            capability,
            name: name.to_string(),
        })
    }

    pub fn resolve_block_device(
        &self,
        name: &str,
        services: &Services,
        config: PluginConfig,
    ) -> Result<Box<dyn BlockDevicePlugin>, BuildError> {
        let factory = self
            .block_devices
            .get(name)
            .ok_or_else(|| BuildError::PluginNotFound {
                capability: Capability::BlockDevice,
                name: name.to_string(),
            })?;
        factory(services, config).map_err(|e| BuildError::PluginInit {
            capability: Capability::BlockDevice,
            name: name.to_string(),
            detail: format!("{:#}", e),
        })
    }

    pub fn resolve_provisioner(
        &self,
        name: &str,
        services: &Services,
        config: PluginConfig,
    ) -> Result<Box<dyn Provisioner>, BuildError> {
        let factory = self
            .provisioners
            .get(name)
            .ok_or_else(|| BuildError::PluginNotFound {
                capability: Capability::Provisioner,
                name: name.to_string(),
            })?;
        factory(services, config).map_err(|e| BuildError::PluginInit {
            capability: Capability::Provisioner,
            name: name.to_string(),
            detail: format!("{:#}", e),
        })
    }
}

//! Generic Linux block device: SCSI/Xen style device slots.

use std::path::PathBuf;
use std::sync::Arc;

use super::{slot_names, BlockDevice, BlockDevicePlugin, DeviceBus, VolumeLifecycle, VolumePlatform};
use crate::build::config::PluginConfig;
use crate::build::context::BuildContext;
use crate::error::BuildError;
use crate::process::CommandResult;

pub const PLUGIN_NAME: &str = "linux";

/// Device prefix used when `device_prefix` is not configured.
pub const DEFAULT_DEVICE_PREFIX: &str = "sd";

/// Attaches volumes as `<prefix>f` through `<prefix>p`, leaving the low
/// letters to devices the host already uses.
pub struct LinuxBlockDevice {
    lifecycle: VolumeLifecycle,
    slots: Vec<String>,
}

impl LinuxBlockDevice {
    pub fn new(config: PluginConfig, platform: Arc<dyn VolumePlatform>, lease_dir: PathBuf) -> Self {
        let prefix = config.get_or("device_prefix", DEFAULT_DEVICE_PREFIX);
        Self {
            slots: slot_names(&prefix, 'f'..='p'),
            lifecycle: VolumeLifecycle::new(PLUGIN_NAME, config, platform, lease_dir),
        }
    }
}

impl BlockDevicePlugin for LinuxBlockDevice {
    fn name(&self) -> &str {
        self.lifecycle.plugin()
    }

    fn attach(&mut self, context: &BuildContext) -> Result<BlockDevice, BuildError> {
        self.lifecycle.attach(context, DeviceBus::Scsi, &self.slots)
    }

    fn detach(&mut self, device: &mut BlockDevice) -> Result<CommandResult, BuildError> {
        self.lifecycle.detach(device)
    }
}

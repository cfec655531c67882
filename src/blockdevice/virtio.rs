//! Virtio block device: volumes appear as `/dev/vdb` onwards.

use std::path::PathBuf;
use std::sync::Arc;

use super::{slot_names, BlockDevice, BlockDevicePlugin, DeviceBus, VolumeLifecycle, VolumePlatform};
use crate::build::config::PluginConfig;
use crate::build::context::BuildContext;
use crate::error::BuildError;
use crate::process::CommandResult;

pub const PLUGIN_NAME: &str = "virtio";

pub struct VirtioBlockDevice {
    lifecycle: VolumeLifecycle,
    slots: Vec<String>,
}

impl VirtioBlockDevice {
    pub fn new(config: PluginConfig, platform: Arc<dyn VolumePlatform>, lease_dir: PathBuf) -> Self {
        Self {
            // vda is the boot disk
            slots: slot_names("vd", 'b'..='z'),
            lifecycle: VolumeLifecycle::new(PLUGIN_NAME, config, platform, lease_dir),
        }
    }
}

impl BlockDevicePlugin for VirtioBlockDevice {
    fn name(&self) -> &str {
        self.lifecycle.plugin()
    }

    fn attach(&mut self, context: &BuildContext) -> Result<BlockDevice, BuildError> {
        self.lifecycle.attach(context, DeviceBus::Virtio, &self.slots)
    }

    fn detach(&mut self, device: &mut BlockDevice) -> Result<CommandResult, BuildError> {
        self.lifecycle.detach(device)
    }
}

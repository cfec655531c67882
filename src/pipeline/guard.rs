//! Release guards for the two resources a run acquires: an attached device
//! and an activated service block.
//!
//! Both release exactly once. The explicit `release` path reports the
//! result; `Drop` covers unwinding out of a panicking phase.

use anyhow::Result;

use crate::blockdevice::{BlockDevice, BlockDevicePlugin};
use crate::error::BuildError;
use crate::process::CommandResult;
use crate::provisioner::{ProvisionTarget, Provisioner};

pub(crate) struct DeviceGuard<'a> {
    plugin: &'a mut dyn BlockDevicePlugin,
    device: BlockDevice,
    released: bool,
}

impl<'a> DeviceGuard<'a> {
    pub(crate) fn new(plugin: &'a mut dyn BlockDevicePlugin, device: BlockDevice) -> Self {
        Self {
            plugin,
            device,
            released: false,
        }
    }

    pub(crate) fn device(&self) -> &BlockDevice {
        &self.device
    }

    pub(crate) fn release(&mut self) -> Result<CommandResult, BuildError> {
        self.released = true;
        self.plugin.detach(&mut self.device)
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        tracing::warn!(device = %self.device.path().display(), "detaching volume while unwinding");
        match self.plugin.detach(&mut self.device) {
            Ok(result) if result.success() => {}
            Ok(result) => {
                tracing::error!(output = %result.output().trim(), "detach failed while unwinding")
            }
            Err(e) => tracing::error!(error = %e, "detach failed while unwinding"),
        }
    }
}

pub(crate) struct ServiceBlockGuard<'a> {
    provisioner: &'a mut dyn Provisioner,
    target: &'a ProvisionTarget,
    released: bool,
}

impl<'a> ServiceBlockGuard<'a> {
    /// Arm the guard and run phase 1. From here on phase 5 is owed.
    pub(crate) fn activate(
        provisioner: &'a mut dyn Provisioner,
        target: &'a ProvisionTarget,
    ) -> (Self, Result<CommandResult>) {
        let mut guard = Self {
            provisioner,
            target,
            released: false,
        };
        let result = guard.provisioner.activate_service_block(target);
        (guard, result)
    }

    pub(crate) fn provisioner(&mut self) -> &mut dyn Provisioner {
        &mut *self.provisioner
    }

    pub(crate) fn release(&mut self) -> Result<CommandResult> {
        self.released = true;
        self.provisioner.deactivate_service_block(self.target)
    }
}

impl Drop for ServiceBlockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        tracing::warn!("restoring services while unwinding");
        match self.provisioner.deactivate_service_block(self.target) {
            Ok(result) if result.success() => {}
            Ok(result) => {
                tracing::error!(output = %result.output().trim(), "deactivate failed while unwinding")
            }
            Err(e) => tracing::error!(error = %format!("{:#}", e), "deactivate failed while unwinding"),
        }
    }
}

//! Provisioner capability: the phased lifecycle run against an attached volume.
//!
//! The orchestrator drives every provisioner through the same five phases,
//! in [`Phase`] order. Variants only differ in which commands each phase
//! issues:
//!
//! - [`chef::ChefProvisioner`] - omnibus chef-solo with a downloaded payload
//! - [`shell::ShellProvisioner`] - a script or command run inside the target

pub mod chef;
pub mod linux;
pub mod shell;

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::blockdevice::BlockDevice;
use crate::build::context::BuildContext;
use crate::process::{CommandResult, CommandSpec};

/// Provisioning lifecycle phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Suspend services inside the target that could interfere.
    ActivateServiceBlock = 1,
    /// Install the provisioning engine and fetch its payload.
    RefreshPackageMetadata = 2,
    /// Run the actual provisioning.
    ProvisionPackage = 3,
    /// Record name/version/release of the resulting artifact.
    StorePackageMetadata = 4,
    /// Restore services suspended by phase 1.
    DeactivateServiceBlock = 5,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::ActivateServiceBlock,
        Phase::RefreshPackageMetadata,
        Phase::ProvisionPackage,
        Phase::StorePackageMetadata,
        Phase::DeactivateServiceBlock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ActivateServiceBlock => "activate_service_block",
            Phase::RefreshPackageMetadata => "refresh_package_metadata",
            Phase::ProvisionPackage => "provision_package",
            Phase::StorePackageMetadata => "store_package_metadata",
            Phase::DeactivateServiceBlock => "deactivate_service_block",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The attached volume as seen by a provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionTarget {
    /// Device node of the attached volume.
    pub device: PathBuf,
    /// Filesystem root to provision. `/` when the volume is not mounted.
    pub root: PathBuf,
}

impl ProvisionTarget {
    pub fn new(device: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            root: root.into(),
        }
    }

    pub fn from_device(device: &BlockDevice) -> Self {
        Self::new(
            device.path(),
            device.mount_point().unwrap_or_else(|| Path::new("/")),
        )
    }

    /// Host path of `path` inside the target root.
    pub fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// A shell line executed inside the target.
    pub fn shell(&self, line: impl Into<String>) -> CommandSpec {
        CommandSpec::shell(line).chrooted(&self.root)
    }
}

/// Provisioner capability.
///
/// Phase methods report phase-local failure as a `CommandResult` with
/// `success == false`; `Err` is for failures the phase could not even
/// observe (spawn errors, I/O).
pub trait Provisioner: Send {
    /// Registered plugin name.
    fn name(&self) -> &str;

    fn activate_service_block(&mut self, target: &ProvisionTarget) -> Result<CommandResult>;

    fn refresh_package_metadata(
        &mut self,
        target: &ProvisionTarget,
        context: &BuildContext,
    ) -> Result<CommandResult>;

    fn provision_package(
        &mut self,
        target: &ProvisionTarget,
        context: &BuildContext,
    ) -> Result<CommandResult>;

    /// In-memory only; cannot fail.
    fn store_package_metadata(&mut self, context: &mut BuildContext);

    fn deactivate_service_block(&mut self, target: &ProvisionTarget) -> Result<CommandResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        let mut sorted = Phase::ALL;
        sorted.sort();
        assert_eq!(sorted, Phase::ALL);
        assert!(Phase::ActivateServiceBlock < Phase::DeactivateServiceBlock);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::RefreshPackageMetadata.to_string(), "refresh_package_metadata");
        assert_eq!(Phase::ProvisionPackage.to_string(), "provision_package");
    }

    #[test]
    fn test_host_path_joins_under_root() {
        let target = ProvisionTarget::new("/dev/vdb", "/mnt/image");
        assert_eq!(
            target.host_path("/tmp/solo.rb"),
            PathBuf::from("/mnt/image/tmp/solo.rb")
        );
    }

    #[test]
    fn test_shell_is_chrooted_for_mounted_targets() {
        let mounted = ProvisionTarget::new("/dev/vdb", "/mnt/image");
        assert_eq!(mounted.shell("true").program(), "chroot");

        let host = ProvisionTarget::new("/dev/vdb", "/");
        assert_eq!(host.shell("true").program(), "sh");
    }
}

//! Loop-device volume platform.
//!
//! Realises a volume as a loop device over a backing image file, optionally
//! mounting it. Every step goes through the [`CommandRunner`].

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use super::{DeviceHandle, VolumePlatform, VolumeSpec};
use crate::process::{CommandRunner, CommandSpec};

/// Host tools the loop platform shells out to, as (command, package).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
];

pub struct LoopPlatform {
    runner: Arc<dyn CommandRunner>,
}

impl LoopPlatform {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn run(&self, spec: CommandSpec) -> Result<String> {
        let result = self
            .runner
            .run(&spec)
            .with_context(|| format!("running '{}'", spec))?;
        if !result.success() {
            bail!("'{}' failed: {}", spec, result.output().trim());
        }
        Ok(result.output().to_string())
    }
}

impl VolumePlatform for LoopPlatform {
    fn attach_volume(&self, spec: &VolumeSpec) -> Result<DeviceHandle> {
        let source = spec.source.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "volume '{}' has no source_image; the loop platform needs a backing file",
                spec.volume_id
            )
        })?;
        if !source.is_file() {
            bail!("backing image not found: {}", source.display());
        }

        let stdout = self.run(
            CommandSpec::new("losetup")
                .args(["--find", "--show"])
                .arg(source.display().to_string()),
        )?;
        let device = stdout
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("/dev/"))
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("losetup did not report a device: {}", stdout.trim()))?;

        if let Some(mount_point) = &spec.mount_point {
            std::fs::create_dir_all(mount_point).with_context(|| {
                format!("creating mount point '{}'", mount_point.display())
            })?;
            let mounted = self.run(
                CommandSpec::new("mount")
                    .arg(device.display().to_string())
                    .arg(mount_point.display().to_string()),
            );
            if let Err(e) = mounted {
                // Do not leak the loop device when the mount fails.
                let _ = self.run(
                    CommandSpec::new("losetup")
                        .arg("-d")
                        .arg(device.display().to_string()),
                );
                return Err(e);
            }
        }

        Ok(DeviceHandle {
            id: spec.volume_id.clone(),
            path: device,
            mount_point: spec.mount_point.clone(),
        })
    }

    fn detach_volume(&self, handle: &DeviceHandle) -> Result<()> {
        if let Some(mount_point) = &handle.mount_point {
            self.run(CommandSpec::new("umount").arg(mount_point.display().to_string()))?;
        }
        self.run(
            CommandSpec::new("losetup")
                .arg("-d")
                .arg(handle.path.display().to_string()),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdevice::DeviceBus;
    use crate::process::CommandResult;
    use crate::testing::RecordingRunner;
    use tempfile::TempDir;

    fn spec(source: Option<PathBuf>, mount_point: Option<PathBuf>) -> VolumeSpec {
        VolumeSpec {
            volume_id: "root".into(),
            device_path: PathBuf::from("/dev/sdf"),
            bus: DeviceBus::Scsi,
            source,
            mount_point,
        }
    }

    #[test]
    fn test_attach_and_detach_with_mount() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("base.img");
        std::fs::write(&image, b"").unwrap();
        let mount_point = temp.path().join("mnt");

        let runner = Arc::new(RecordingRunner::default());
        runner.respond("losetup --find", CommandResult::ok("/dev/loop7\n"));
        let platform = LoopPlatform::new(runner.clone());

        let handle = platform
            .attach_volume(&spec(Some(image.clone()), Some(mount_point.clone())))
            .unwrap();
        assert_eq!(handle.path, PathBuf::from("/dev/loop7"));
        assert!(mount_point.is_dir());

        platform.detach_volume(&handle).unwrap();

        let commands = runner.commands();
        assert_eq!(commands.len(), 4);
        assert!(commands[0].starts_with("losetup --find --show"));
        assert!(commands[1].starts_with("mount /dev/loop7"));
        assert!(commands[2].starts_with("umount"));
        assert_eq!(commands[3], "losetup -d /dev/loop7");
    }

    #[test]
    fn test_attach_requires_source() {
        let runner = Arc::new(RecordingRunner::default());
        let platform = LoopPlatform::new(runner.clone());

        let err = platform.attach_volume(&spec(None, None)).unwrap_err();
        assert!(err.to_string().contains("source_image"));
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_failed_mount_releases_loop_device() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("base.img");
        std::fs::write(&image, b"").unwrap();

        let runner = Arc::new(RecordingRunner::default());
        runner.respond("losetup --find", CommandResult::ok("/dev/loop3\n"));
        runner.respond("mount", CommandResult::failed("wrong fs type"));
        let platform = LoopPlatform::new(runner.clone());

        let err = platform
            .attach_volume(&spec(Some(image), Some(temp.path().join("mnt"))))
            .unwrap_err();
        assert!(err.to_string().contains("wrong fs type"));
        assert_eq!(runner.commands().last().unwrap(), "losetup -d /dev/loop3");
    }
}

//! Block device capability: attach a working volume, detach it again.
//!
//! All variants share one state machine, implemented by [`VolumeLifecycle`]:
//!
//! ```text
//! Detached ──attach──▶ Attaching ──ok──▶ Attached ──detach──▶ Detaching ──ok──▶ Detached
//!                          │                                      │
//!                          └──────────err──────▶ Failed ◀────err──┘
//! ```
//!
//! Variants only decide how a device slot is named and which bus the
//! [`VolumePlatform`] is asked to use:
//!
//! - [`linux::LinuxBlockDevice`] - SCSI/Xen style slots (`/dev/sdf`..`/dev/sdp`)
//! - [`virtio::VirtioBlockDevice`] - virtio slots (`/dev/vdb`..`/dev/vdz`)
//!
//! The platform realising the volume is an external collaborator.
//! [`loopback::LoopPlatform`] is the built-in one.

pub mod lease;
pub mod linux;
pub mod loopback;
pub mod virtio;

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::build::config::PluginConfig;
use crate::build::context::BuildContext;
use crate::error::BuildError;
use crate::process::CommandResult;
use lease::Lease;

/// Block device capability.
pub trait BlockDevicePlugin: Send {
    /// Registered plugin name.
    fn name(&self) -> &str;

    /// Request a volume and block until it is attached.
    ///
    /// Calling this again before detaching is a
    /// [`BuildError::LifecycleViolation`] and performs no platform call.
    fn attach(&mut self, context: &BuildContext) -> Result<BlockDevice, BuildError>;

    /// Release a device. Safe to call on a failed or already-detached device.
    fn detach(&mut self, device: &mut BlockDevice) -> Result<CommandResult, BuildError>;
}

/// Attach/detach state of a [`BlockDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Detached,
    Attaching,
    Attached,
    Detaching,
    /// Absorbing: nothing further happens to a failed device.
    Failed,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Detached => "detached",
            DeviceState::Attaching => "attaching",
            DeviceState::Attached => "attached",
            DeviceState::Detaching => "detaching",
            DeviceState::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: DeviceState) -> bool {
        matches!(
            (self, next),
            (DeviceState::Detached, DeviceState::Attaching)
                | (DeviceState::Attaching, DeviceState::Attached)
                | (DeviceState::Attaching, DeviceState::Failed)
                | (DeviceState::Attached, DeviceState::Detaching)
                | (DeviceState::Detaching, DeviceState::Detached)
                | (DeviceState::Detaching, DeviceState::Failed)
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A volume attached to the build host.
#[derive(Debug, PartialEq, Eq)]
pub struct BlockDevice {
    volume_id: String,
    path: PathBuf,
    mount_point: Option<PathBuf>,
    state: DeviceState,
    handle: Option<DeviceHandle>,
}

impl BlockDevice {
    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    /// Device node, e.g. `/dev/vdb`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the volume's filesystem is mounted, if the platform mounted it.
    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    fn transition(&mut self, next: DeviceState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid device transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }
}

/// Bus the platform should expose the volume on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBus {
    Scsi,
    Virtio,
}

/// What a block device plugin asks the platform for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub volume_id: String,
    /// Requested device node. Platforms may assign a different one.
    pub device_path: PathBuf,
    pub bus: DeviceBus,
    /// Backing image or snapshot the volume is created from.
    pub source: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,
}

/// Platform-side identity of an attached volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: String,
    pub path: PathBuf,
    pub mount_point: Option<PathBuf>,
}

/// Cloud or host API that realises volumes.
pub trait VolumePlatform: Send + Sync {
    fn attach_volume(&self, spec: &VolumeSpec) -> Result<DeviceHandle>;
    fn detach_volume(&self, handle: &DeviceHandle) -> Result<()>;
}

/// Options every block device variant understands.
#[derive(Debug, Clone)]
struct VolumeOptions {
    volume_id: String,
    source: Option<PathBuf>,
    mount_point: Option<PathBuf>,
    dev_root: PathBuf,
}

impl VolumeOptions {
    fn resolve(config: &PluginConfig, context: &BuildContext) -> Self {
        let fallback = if context.package.name.is_empty() {
            "default"
        } else {
            context.package.name.as_str()
        };
        Self {
            volume_id: config.get_or("volume", fallback),
            source: config.get_path("source_image"),
            mount_point: config.get_path("mount_point"),
            dev_root: config
                .get_path("dev_root")
                .unwrap_or_else(|| PathBuf::from("/dev")),
        }
    }
}

struct ActiveVolume {
    volume_id: String,
    _volume_lease: Lease,
    _slot_lease: Lease,
}

/// State machine and leasing shared by all block device variants.
pub struct VolumeLifecycle {
    plugin: String,
    config: PluginConfig,
    platform: Arc<dyn VolumePlatform>,
    lease_dir: PathBuf,
    active: Option<ActiveVolume>,
}

impl VolumeLifecycle {
    pub fn new(
        plugin: &str,
        config: PluginConfig,
        platform: Arc<dyn VolumePlatform>,
        lease_dir: PathBuf,
    ) -> Self {
        Self {
            plugin: plugin.to_string(),
            config,
            platform,
            lease_dir,
            active: None,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Attach through the first free slot among `slots` (names under `dev_root`).
    pub fn attach(
        &mut self,
        context: &BuildContext,
        bus: DeviceBus,
        slots: &[String],
    ) -> Result<BlockDevice, BuildError> {
        if let Some(active) = &self.active {
            return Err(BuildError::lifecycle(
                &self.plugin,
                format!(
                    "attach called while volume '{}' is still held",
                    active.volume_id
                ),
            ));
        }

        let options = VolumeOptions::resolve(&self.config, context);
        let attach_failed = |detail: String| BuildError::AttachFailed {
            volume: options.volume_id.clone(),
            detail,
        };

        let volume_lease = Lease::acquire(&self.lease_dir, "volume", &options.volume_id)
            .map_err(|e| attach_failed(format!("{:#}", e)))?;
        let (slot, slot_lease) = self
            .claim_slot(&options.dev_root, slots)
            .ok_or_else(|| attach_failed("no free device slot".to_string()))?;

        let mut device = BlockDevice {
            volume_id: options.volume_id.clone(),
            path: options.dev_root.join(&slot),
            mount_point: None,
            state: DeviceState::Detached,
            handle: None,
        };
        device.transition(DeviceState::Attaching);

        let spec = VolumeSpec {
            volume_id: options.volume_id.clone(),
            device_path: device.path.clone(),
            bus,
            source: options.source.clone(),
            mount_point: options.mount_point.clone(),
        };

        tracing::info!(
            plugin = %self.plugin,
            volume = %spec.volume_id,
            device = %spec.device_path.display(),
            "attaching volume"
        );

        match self.platform.attach_volume(&spec) {
            Ok(handle) => {
                device.path = handle.path.clone();
                device.mount_point = handle.mount_point.clone();
                device.handle = Some(handle);
                device.transition(DeviceState::Attached);
                self.active = Some(ActiveVolume {
                    volume_id: device.volume_id.clone(),
                    _volume_lease: volume_lease,
                    _slot_lease: slot_lease,
                });
                tracing::info!(device = %device.path.display(), "volume attached");
                Ok(device)
            }
            Err(e) => {
                device.transition(DeviceState::Failed);
                tracing::warn!(volume = %spec.volume_id, error = %format!("{:#}", e), "attach failed");
                Err(attach_failed(format!("{:#}", e)))
            }
        }
    }

    pub fn detach(&mut self, device: &mut BlockDevice) -> Result<CommandResult, BuildError> {
        match device.state {
            DeviceState::Detached => {
                return Ok(CommandResult::ok(format!(
                    "{} already detached",
                    device.path.display()
                )));
            }
            DeviceState::Failed => {
                return Ok(CommandResult::ok(format!(
                    "{} failed earlier; nothing to release",
                    device.path.display()
                )));
            }
            DeviceState::Attaching | DeviceState::Detaching => {
                return Err(BuildError::lifecycle(
                    &self.plugin,
                    format!(
                        "detach called on {} while {}",
                        device.path.display(),
                        device.state
                    ),
                ));
            }
            DeviceState::Attached => {}
        }

        let owns = self
            .active
            .as_ref()
            .is_some_and(|active| active.volume_id == device.volume_id);
        let handle = match (&device.handle, owns) {
            (Some(handle), true) => handle.clone(),
            _ => {
                return Err(BuildError::lifecycle(
                    &self.plugin,
                    format!(
                        "detach called for {} which this plugin did not attach",
                        device.path.display()
                    ),
                ));
            }
        };

        device.transition(DeviceState::Detaching);
        tracing::info!(device = %device.path.display(), "detaching volume");
        let result = self.platform.detach_volume(&handle);
        match result {
            Ok(()) => {
                self.active = None;
                device.transition(DeviceState::Detached);
                Ok(CommandResult::ok(format!(
                    "detached {}",
                    device.path.display()
                )))
            }
            Err(e) => {
                // The volume may still be attached; its leases stay held
                // until this plugin is dropped.
                device.transition(DeviceState::Failed);
                tracing::warn!(
                    device = %device.path.display(),
                    error = %format!("{:#}", e),
                    "detach failed; keeping volume lease"
                );
                Ok(CommandResult::failed(format!("{:#}", e)))
            }
        }
    }

    fn claim_slot(&self, dev_root: &Path, slots: &[String]) -> Option<(String, Lease)> {
        for slot in slots {
            if dev_root.join(slot).exists() {
                continue;
            }
            if let Ok(lease) = Lease::acquire(&self.lease_dir, "slot", slot) {
                return Some((slot.clone(), lease));
            }
        }
        None
    }
}

/// Slot names `<prefix><letter>` for each letter in `letters`.
pub(crate) fn slot_names(prefix: &str, letters: std::ops::RangeInclusive<char>) -> Vec<String> {
    letters.map(|letter| format!("{}{}", prefix, letter)).collect()
}

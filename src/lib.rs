//! Stage pipeline for building machine images.
//!
//! A build attaches a working volume, provisions it with a
//! configuration-management tool and detaches it again. Block device
//! handling and provisioning are capabilities filled by named plugins:
//!
//! - **Block devices** - [`blockdevice::linux`], [`blockdevice::virtio`]
//! - **Provisioners** - [`provisioner::chef`], [`provisioner::shell`]
//! - **Pipeline** - [`pipeline::Pipeline`] sequences attach, the five
//!   provisioning phases and detach, and guarantees release on every exit path
//!
//! # Architecture
//!
//! ```text
//! Pipeline ──resolve──▶ PluginRegistry
//!     │
//!     ├── BlockDevicePlugin ──▶ VolumePlatform (loop devices, cloud APIs)
//!     └── Provisioner ───────▶ CommandRunner, Downloader
//!                │
//!                └── writes BuildContext.package
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use image_builder::{BuildConfig, Pipeline, PluginRegistry, Services};
//!
//! let config = BuildConfig::load("build.toml".as_ref())?;
//! let (settings, mut context) = config.into_context();
//! let services = Services::system(image_builder::default_lease_dir())?;
//! let pipeline = Pipeline::new(Arc::new(PluginRegistry::builtin()), services);
//! let outcome = pipeline.run(&mut context, &settings.block_device, &settings.provisioner)?;
//! ```

pub mod blockdevice;
pub mod build;
pub mod download;
pub mod error;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod provisioner;
pub mod registry;
pub mod runs;

#[cfg(test)]
mod testing;

pub use blockdevice::lease::default_lease_dir;
pub use blockdevice::{BlockDevice, BlockDevicePlugin, DeviceState, VolumePlatform};
pub use build::config::{BuildConfig, PipelineSettings, PluginConfig};
pub use build::context::{BuildContext, Package};
pub use error::BuildError;
pub use pipeline::{BuildOutcome, Pipeline, Step};
pub use process::{CommandResult, CommandRunner, CommandSpec, SystemRunner};
pub use provisioner::{Phase, Provisioner};
pub use registry::{Capability, PluginRegistry, Services};

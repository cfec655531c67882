//! Shared pieces for provisioners targeting Linux root filesystems.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::ProvisionTarget;
use crate::build::config::PluginConfig;
use crate::build::context::BuildContext;
use crate::process::CommandResult;

/// invoke-rc.d consults this hook; exit status 101 means "action forbidden".
pub const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";
const POLICY_RC_D_BACKUP: &str = "usr/sbin/policy-rc.d.image-builder";
const POLICY_RC_D_DENY_ALL: &str = "#!/bin/sh\nexit 101\n";

/// Blocks init scripts inside the target while it is being provisioned.
#[derive(Debug, Default)]
pub struct ServiceBlock {
    active: Option<ActiveBlock>,
}

/// What activation changed so far; deactivation undoes exactly that.
#[derive(Debug)]
struct ActiveBlock {
    root: PathBuf,
    backed_up: bool,
    hook_written: bool,
}

impl ServiceBlock {
    /// Install the deny-all hook.
    ///
    /// Progress is recorded before each filesystem change, so a later
    /// [`deactivate`](Self::deactivate) also repairs a partial activation.
    pub fn activate(&mut self, target: &ProvisionTarget) -> Result<CommandResult> {
        if target.root == Path::new("/") {
            return Ok(CommandResult::ok(
                "target is the host root; service block skipped",
            ));
        }

        let hook = target.root.join(POLICY_RC_D);
        let backup = target.root.join(POLICY_RC_D_BACKUP);
        let active = self.active.insert(ActiveBlock {
            root: target.root.clone(),
            backed_up: false,
            hook_written: false,
        });

        if let Some(parent) = hook.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        if hook.exists() {
            fs::rename(&hook, &backup).with_context(|| {
                format!("moving '{}' aside to '{}'", hook.display(), backup.display())
            })?;
            active.backed_up = true;
        }
        active.hook_written = true;
        fs::write(&hook, POLICY_RC_D_DENY_ALL)
            .with_context(|| format!("writing '{}'", hook.display()))?;
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("setting mode of '{}'", hook.display()))?;

        Ok(CommandResult::ok(format!(
            "services blocked via {}",
            hook.display()
        )))
    }

    /// Restore the hook that was in place before [`activate`](Self::activate).
    pub fn deactivate(&mut self, target: &ProvisionTarget) -> Result<CommandResult> {
        let Some(active) = self.active.take() else {
            return Ok(CommandResult::ok("no service block active"));
        };
        debug_assert_eq!(active.root, target.root);

        let hook = active.root.join(POLICY_RC_D);
        let backup = active.root.join(POLICY_RC_D_BACKUP);
        if active.hook_written && hook.exists() {
            fs::remove_file(&hook).with_context(|| format!("removing '{}'", hook.display()))?;
        }
        if active.backed_up {
            fs::rename(&backup, &hook).with_context(|| {
                format!("restoring '{}' from '{}'", hook.display(), backup.display())
            })?;
        }
        Ok(CommandResult::ok(format!(
            "services restored in {}",
            active.root.display()
        )))
    }
}

/// Store `name`, `version` and `release` options into the package metadata.
///
/// Absent options keep whatever the context already carried.
pub fn store_package_metadata_from_config(config: &PluginConfig, context: &mut BuildContext) {
    let name = config.get_or("name", &context.package.name);
    let version = config.get_or("version", &context.package.version);
    let release = config.get_or("release", &context.package.release);
    context.set_package_metadata(name, version, release);
}

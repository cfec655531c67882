//! Chef provisioner: omnibus chef-solo driven by a downloaded payload.
//!
//! Phase commands, in order:
//!
//! 1. install the engine: `bash /tmp/install-chef.sh [-v <chef_version>]`
//! 2. unpack the payload: `tar -C <root> -xf <root>/tmp/chef-payload.tar.gz`
//! 3. provision: `chef-solo -j /tmp/node.json -c /tmp/solo.rb -o <run-list>`
//!
//! The payload archive is expected to carry `tmp/node.json`, `tmp/solo.rb`
//! and the cookbooks they reference.

use anyhow::Result;
use std::sync::Arc;

use super::linux::store_package_metadata_from_config;
use super::{ProvisionTarget, Provisioner};
use crate::build::config::PluginConfig;
use crate::build::context::BuildContext;
use crate::download::{verify_sha256, Downloader};
use crate::process::{CommandResult, CommandRunner, CommandSpec};

pub const PLUGIN_NAME: &str = "chef";
pub const DEFAULT_INSTALLER_URL: &str = "https://www.opscode.com/chef/install.sh";

const INSTALLER_PATH: &str = "/tmp/install-chef.sh";
const PAYLOAD_PATH: &str = "/tmp/chef-payload.tar.gz";
const NODE_JSON: &str = "/tmp/node.json";
const SOLO_RB: &str = "/tmp/solo.rb";

pub struct ChefProvisioner {
    config: PluginConfig,
    runner: Arc<dyn CommandRunner>,
    downloader: Arc<dyn Downloader>,
}

impl ChefProvisioner {
    pub fn new(
        config: PluginConfig,
        runner: Arc<dyn CommandRunner>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Self {
            config,
            runner,
            downloader,
        }
    }

    fn install_chef(&self, target: &ProvisionTarget, chef_version: Option<&str>) -> Result<CommandResult> {
        let installer_url = self.config.get_or("installer_url", DEFAULT_INSTALLER_URL);
        if let Err(e) = self
            .downloader
            .download_file(&installer_url, &target.host_path(INSTALLER_PATH))
        {
            return Ok(CommandResult::failed(format!(
                "downloading chef installer from {}: {:#}",
                installer_url, e
            )));
        }
        self.runner.run(&install_command(target, chef_version))
    }

    fn fetch_payload(&self, target: &ProvisionTarget) -> Result<CommandResult> {
        let Some(payload_url) = self.config.get("payload_url") else {
            return Ok(CommandResult::failed("chef payload_url is not configured"));
        };

        let archive = target.host_path(PAYLOAD_PATH);
        tracing::debug!(%payload_url, "downloading chef payload");
        if let Err(e) = self.downloader.download_file(payload_url, &archive) {
            return Ok(CommandResult::failed(format!(
                "downloading payload from {}: {:#}",
                payload_url, e
            )));
        }
        if let Some(expected) = self.config.get("payload_sha256") {
            if let Err(e) = verify_sha256(&archive, expected) {
                return Ok(CommandResult::failed(format!("{:#}", e)));
            }
        }

        // Extraction happens from the host side; tar lands files under the root.
        self.runner.run(
            &CommandSpec::new("tar")
                .arg("-C")
                .arg(target.root.display().to_string())
                .arg("-xf")
                .arg(archive.display().to_string()),
        )
    }
}

fn install_command(target: &ProvisionTarget, chef_version: Option<&str>) -> CommandSpec {
    let mut spec = CommandSpec::new("bash").arg(INSTALLER_PATH);
    if let Some(version) = chef_version {
        spec = spec.arg("-v").arg(version);
    }
    spec.chrooted(&target.root)
}

fn chef_solo_command(target: &ProvisionTarget, runlist: &str) -> CommandSpec {
    CommandSpec::new("chef-solo")
        .args(["-j", NODE_JSON, "-c", SOLO_RB, "-o", runlist])
        .chrooted(&target.root)
}

impl Provisioner for ChefProvisioner {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn activate_service_block(&mut self, _target: &ProvisionTarget) -> Result<CommandResult> {
        Ok(CommandResult::ok("chef does not block services"))
    }

    fn refresh_package_metadata(
        &mut self,
        target: &ProvisionTarget,
        _context: &BuildContext,
    ) -> Result<CommandResult> {
        let chef_version = self.config.get("chef_version").map(str::to_string);

        tracing::debug!(chef_version = chef_version.as_deref().unwrap_or("latest"), "installing omnibus chef-solo");
        let installed = self.install_chef(target, chef_version.as_deref())?;
        if !installed.success() {
            tracing::error!(output = %installed.output().trim(), "failed to install chef");
            return Ok(installed);
        }

        self.fetch_payload(target)
    }

    fn provision_package(
        &mut self,
        target: &ProvisionTarget,
        context: &BuildContext,
    ) -> Result<CommandResult> {
        let runlist = context.package.arg.trim();
        if runlist.is_empty() {
            return Ok(CommandResult::failed("chef run-list (package arg) is empty"));
        }
        tracing::debug!(%runlist, "running chef-solo");
        self.runner.run(&chef_solo_command(target, runlist))
    }

    fn store_package_metadata(&mut self, context: &mut BuildContext) {
        store_package_metadata_from_config(&self.config, context);
    }

    fn deactivate_service_block(&mut self, _target: &ProvisionTarget) -> Result<CommandResult> {
        Ok(CommandResult::ok("chef does not block services"))
    }
}

//! Shell provisioner: runs a script or a single command inside the target.

use anyhow::Result;
use std::sync::Arc;

use super::linux::{store_package_metadata_from_config, ServiceBlock};
use super::{ProvisionTarget, Provisioner};
use crate::build::config::PluginConfig;
use crate::build::context::BuildContext;
use crate::download::{verify_sha256, Downloader};
use crate::process::{CommandResult, CommandRunner, CommandSpec};

pub const PLUGIN_NAME: &str = "shell";

const SCRIPT_PATH: &str = "/tmp/image-builder-provision.sh";
const PAYLOAD_PATH: &str = "/tmp/shell-payload.tar.gz";

/// Exported to the provisioning command; carries the package argument.
pub const ARG_ENV: &str = "IMAGE_BUILDER_ARG";

pub struct ShellProvisioner {
    config: PluginConfig,
    runner: Arc<dyn CommandRunner>,
    downloader: Arc<dyn Downloader>,
    service_block: ServiceBlock,
}

impl ShellProvisioner {
    pub fn new(
        config: PluginConfig,
        runner: Arc<dyn CommandRunner>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Self {
            config,
            runner,
            downloader,
            service_block: ServiceBlock::default(),
        }
    }

    fn download(&self, url: &str, target: &ProvisionTarget, path: &str) -> Option<CommandResult> {
        match self.downloader.download_file(url, &target.host_path(path)) {
            Ok(()) => None,
            Err(e) => Some(CommandResult::failed(format!(
                "downloading {}: {:#}",
                url, e
            ))),
        }
    }
}

impl Provisioner for ShellProvisioner {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn activate_service_block(&mut self, target: &ProvisionTarget) -> Result<CommandResult> {
        self.service_block.activate(target)
    }

    fn refresh_package_metadata(
        &mut self,
        target: &ProvisionTarget,
        _context: &BuildContext,
    ) -> Result<CommandResult> {
        if self.config.get("script_url").is_none() && self.config.get("command").is_none() {
            return Ok(CommandResult::failed(
                "shell provisioner needs either script_url or command",
            ));
        }

        let mut output = String::new();
        if let Some(url) = self.config.get("script_url") {
            if let Some(failed) = self.download(url, target, SCRIPT_PATH) {
                return Ok(failed);
            }
            output.push_str(&format!("fetched {}\n", url));
        }

        if let Some(url) = self.config.get("payload_url") {
            if let Some(failed) = self.download(url, target, PAYLOAD_PATH) {
                return Ok(failed);
            }
            let archive = target.host_path(PAYLOAD_PATH);
            if let Some(expected) = self.config.get("payload_sha256") {
                if let Err(e) = verify_sha256(&archive, expected) {
                    return Ok(CommandResult::failed(format!("{:#}", e)));
                }
            }
            let extracted = self.runner.run(
                &CommandSpec::new("tar")
                    .arg("-C")
                    .arg(target.root.display().to_string())
                    .arg("-xf")
                    .arg(archive.display().to_string()),
            )?;
            if !extracted.success() {
                return Ok(extracted);
            }
            output.push_str(extracted.output());
        }

        Ok(CommandResult::ok(output))
    }

    fn provision_package(
        &mut self,
        target: &ProvisionTarget,
        context: &BuildContext,
    ) -> Result<CommandResult> {
        let spec = if self.config.get("script_url").is_some() {
            CommandSpec::new("sh")
                .arg(SCRIPT_PATH)
                .args(context.package.arg.split_whitespace())
                .chrooted(&target.root)
        } else if let Some(command) = self.config.get("command") {
            target.shell(command)
        } else {
            return Ok(CommandResult::failed(
                "shell provisioner needs either script_url or command",
            ));
        };

        tracing::debug!(command = %spec, "running shell provisioner");
        self.runner.run(&spec.env(ARG_ENV, context.package.arg.clone()))
    }

    fn store_package_metadata(&mut self, context: &mut BuildContext) {
        store_package_metadata_from_config(&self.config, context);
    }

    fn deactivate_service_block(&mut self, target: &ProvisionTarget) -> Result<CommandResult> {
        self.service_block.deactivate(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::context::Package;
    use crate::provisioner::linux::POLICY_RC_D;
    use crate::testing::{FakeDownloader, RecordingRunner};
    use tempfile::TempDir;

    fn shell(config: PluginConfig) -> (ShellProvisioner, Arc<RecordingRunner>, Arc<FakeDownloader>) {
        let runner = Arc::new(RecordingRunner::default());
        let downloader = Arc::new(FakeDownloader::default());
        let provisioner = ShellProvisioner::new(config, runner.clone(), downloader.clone());
        (provisioner, runner, downloader)
    }

    fn context() -> BuildContext {
        BuildContext::new(Package {
            arg: "--role web".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_command_runs_inside_target() {
        let temp = TempDir::new().unwrap();
        let target = ProvisionTarget::new("/dev/vdb", temp.path());
        let (mut shell, runner, downloader) =
            shell(PluginConfig::new().set("command", "apt-get install -y nginx"));

        assert!(shell.refresh_package_metadata(&target, &context()).unwrap().success());
        assert!(shell.provision_package(&target, &context()).unwrap().success());

        assert!(downloader.requests().is_empty());
        assert_eq!(
            runner.commands(),
            [format!(
                "chroot {} sh -c 'apt-get install -y nginx'",
                temp.path().display()
            )]
        );
    }

    #[test]
    fn test_script_is_fetched_then_run_with_arg() {
        let target = ProvisionTarget::new("/dev/vdb", "/");
        let (mut shell, runner, downloader) =
            shell(PluginConfig::new().set("script_url", "http://x/setup.sh"));

        shell.refresh_package_metadata(&target, &context()).unwrap();
        shell.provision_package(&target, &context()).unwrap();

        assert_eq!(downloader.requests().len(), 1);
        assert_eq!(
            runner.commands(),
            ["sh /tmp/image-builder-provision.sh --role web"]
        );
    }

    #[test]
    fn test_refresh_without_script_or_command_fails() {
        let target = ProvisionTarget::new("/dev/vdb", "/");
        let (mut shell, runner, _) = shell(PluginConfig::new());

        let result = shell.refresh_package_metadata(&target, &context()).unwrap();
        assert!(!result.success());
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_payload_extraction_failure_is_reported() {
        let target = ProvisionTarget::new("/dev/vdb", "/");
        let config = PluginConfig::new()
            .set("command", "true")
            .set("payload_url", "http://x/files.tar.gz");
        let (mut shell, runner, _) = shell(config);
        runner.respond("tar", CommandResult::failed("not in gzip format"));

        let result = shell.refresh_package_metadata(&target, &context()).unwrap();
        assert!(!result.success());
        assert!(result.output().contains("gzip"));
    }

    #[test]
    fn test_service_block_wraps_target() {
        let temp = TempDir::new().unwrap();
        let target = ProvisionTarget::new("/dev/vdb", temp.path());
        let (mut shell, _, _) = shell(PluginConfig::new().set("command", "true"));

        shell.activate_service_block(&target).unwrap();
        assert!(temp.path().join(POLICY_RC_D).exists());
        shell.deactivate_service_block(&target).unwrap();
        assert!(!temp.path().join(POLICY_RC_D).exists());
    }
}

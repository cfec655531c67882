//! Recording fakes for the external collaborators.

use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::blockdevice::{DeviceBus, DeviceHandle, VolumePlatform, VolumeSpec};
use crate::build::context::BuildContext;
use crate::download::Downloader;
use crate::process::{CommandResult, CommandRunner, CommandSpec};
use crate::provisioner::{Phase, ProvisionTarget, Provisioner};

/// Ordered log shared between fakes so tests can assert cross-plugin ordering.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }
}

/// Records every command; answers with canned results matched by prefix.
#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, CommandResult)>>,
}

impl RecordingRunner {
    pub fn respond(&self, prefix: &str, result: CommandResult) {
        self.responses
            .lock()
            .unwrap()
            .push((prefix.to_string(), result));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult> {
        let line = spec.to_string();
        self.commands.lock().unwrap().push(line.clone());
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| CommandResult::ok("")))
    }
}

/// Records download requests without touching the filesystem.
#[derive(Default)]
pub struct FakeDownloader {
    requests: Mutex<Vec<(String, PathBuf)>>,
    failing: Mutex<BTreeSet<String>>,
}

impl FakeDownloader {
    pub fn fail_on(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn requests(&self) -> Vec<(String, PathBuf)> {
        self.requests.lock().unwrap().clone()
    }
}

impl Downloader for FakeDownloader {
    fn download_file(&self, url: &str, destination: &Path) -> Result<()> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), destination.to_path_buf()));
        if self.failing.lock().unwrap().contains(url) {
            bail!("HTTP 404 for {}", url);
        }
        Ok(())
    }
}

/// Volume platform that hands back the requested slot.
#[derive(Default)]
pub struct FakePlatform {
    calls: Mutex<Vec<String>>,
    attach_error: Mutex<Option<String>>,
    detach_error: Mutex<Option<String>>,
    last_bus: Mutex<Option<DeviceBus>>,
    journal: Option<Journal>,
}

impl FakePlatform {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Default::default()
        }
    }

    pub fn fail_attach(&self, detail: &str) {
        *self.attach_error.lock().unwrap() = Some(detail.to_string());
    }

    pub fn fail_detach(&self, detail: &str) {
        *self.detach_error.lock().unwrap() = Some(detail.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_bus(&self) -> Option<DeviceBus> {
        *self.last_bus.lock().unwrap()
    }

    fn record(&self, call: String) {
        if let Some(journal) = &self.journal {
            journal.push(call.clone());
        }
        self.calls.lock().unwrap().push(call);
    }
}

impl VolumePlatform for FakePlatform {
    fn attach_volume(&self, spec: &VolumeSpec) -> Result<DeviceHandle> {
        self.record(format!("attach {}", spec.volume_id));
        *self.last_bus.lock().unwrap() = Some(spec.bus);
        if let Some(detail) = self.attach_error.lock().unwrap().clone() {
            return Err(anyhow!(detail));
        }
        Ok(DeviceHandle {
            id: spec.volume_id.clone(),
            path: spec.device_path.clone(),
            mount_point: spec.mount_point.clone(),
        })
    }

    fn detach_volume(&self, handle: &DeviceHandle) -> Result<()> {
        self.record(format!("detach {}", handle.id));
        if let Some(detail) = self.detach_error.lock().unwrap().clone() {
            return Err(anyhow!(detail));
        }
        Ok(())
    }
}

/// How a [`ScriptedProvisioner`] answers a phase.
#[derive(Debug, Clone)]
pub enum Script {
    Fail(&'static str),
    Error(&'static str),
    Panic,
}

/// Provisioner whose phases are scripted; writes every call into a journal.
#[derive(Debug, Clone)]
pub struct ScriptedProvisioner {
    journal: Journal,
    scripts: BTreeMap<Phase, Script>,
}

impl ScriptedProvisioner {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            scripts: BTreeMap::new(),
        }
    }

    pub fn on(mut self, phase: Phase, script: Script) -> Self {
        self.scripts.insert(phase, script);
        self
    }

    fn play(&self, phase: Phase) -> Result<CommandResult> {
        self.journal.push(phase.as_str());
        match self.scripts.get(&phase) {
            None => Ok(CommandResult::ok(format!("{} ok", phase))),
            Some(Script::Fail(output)) => Ok(CommandResult::failed(*output)),
            Some(Script::Error(detail)) => Err(anyhow!(*detail)),
            Some(Script::Panic) => panic!("scripted panic in {}", phase),
        }
    }
}

impl Provisioner for ScriptedProvisioner {
    fn name(&self) -> &str {
        "scripted"
    }

    fn activate_service_block(&mut self, _target: &ProvisionTarget) -> Result<CommandResult> {
        self.play(Phase::ActivateServiceBlock)
    }

    fn refresh_package_metadata(
        &mut self,
        _target: &ProvisionTarget,
        _context: &BuildContext,
    ) -> Result<CommandResult> {
        self.play(Phase::RefreshPackageMetadata)
    }

    fn provision_package(
        &mut self,
        _target: &ProvisionTarget,
        _context: &BuildContext,
    ) -> Result<CommandResult> {
        self.play(Phase::ProvisionPackage)
    }

    fn store_package_metadata(&mut self, context: &mut BuildContext) {
        self.journal.push(Phase::StorePackageMetadata.as_str());
        context.set_package_metadata("scripted".into(), "0.1".into(), "1".into());
    }

    fn deactivate_service_block(&mut self, _target: &ProvisionTarget) -> Result<CommandResult> {
        self.play(Phase::DeactivateServiceBlock)
    }
}

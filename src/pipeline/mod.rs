//! Pipeline orchestrator: attach, provision, detach.
//!
//! One run is a single sequential flow:
//!
//! ```text
//! resolve plugins ─▶ attach ─▶ activate ─▶ refresh ─▶ provision ─▶ store ─▶ deactivate ─▶ detach
//! ```
//!
//! - Unknown plugin names abort before anything is constructed or attached.
//! - A failed attach ends the run; there is nothing to detach.
//! - Once attach succeeded, detach runs exactly once on every exit path.
//! - Once activate was invoked, deactivate runs exactly once on every exit path.
//! - A failing refresh or provision skips the remaining provisioning phases
//!   but not deactivate or detach.
//!
//! The release guarantees hold across panics inside a plugin: the guards in
//! [`guard`] release on unwind, then the panic continues to the caller.

mod guard;
mod outcome;

pub use outcome::{BuildOutcome, Step, StepRecord};

use anyhow::Result as AnyResult;
use std::path::PathBuf;
use std::sync::Arc;

use crate::blockdevice::BlockDevicePlugin;
use crate::build::context::BuildContext;
use crate::error::BuildError;
use crate::process::CommandResult;
use crate::provisioner::{Phase, ProvisionTarget, Provisioner};
use crate::registry::{Capability, PluginRegistry, Services};
use crate::runs::{self, RunMetadata};
use guard::{DeviceGuard, ServiceBlockGuard};

pub struct Pipeline {
    registry: Arc<PluginRegistry>,
    services: Services,
    span: tracing::Span,
    runs_dir: Option<PathBuf>,
    keep_runs: Option<usize>,
}

impl Pipeline {
    pub fn new(registry: Arc<PluginRegistry>, services: Services) -> Self {
        Self {
            registry,
            services,
            span: tracing::Span::none(),
            runs_dir: None,
            keep_runs: None,
        }
    }

    /// Parent span for every run this pipeline executes.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Write a run manifest per run under `runs_dir`.
    pub fn with_runs_dir(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(runs_dir.into());
        self
    }

    /// Prune all but the `keep` most recent runs after each run.
    pub fn keep_runs(mut self, keep: usize) -> Self {
        self.keep_runs = Some(keep);
        self
    }

    /// Run one build against `context`.
    ///
    /// `Err` is reserved for contract violations (unknown plugin, plugin
    /// construction failure, lifecycle violation). Every other failure is
    /// reported through the returned [`BuildOutcome`].
    pub fn run(
        &self,
        context: &mut BuildContext,
        block_device: &str,
        provisioner: &str,
    ) -> Result<BuildOutcome, BuildError> {
        self.registry.ensure(Capability::BlockDevice, block_device)?;
        self.registry.ensure(Capability::Provisioner, provisioner)?;

        let mut device_plugin = self.registry.resolve_block_device(
            block_device,
            &self.services,
            context.plugin_config(block_device),
        )?;
        let mut provisioner_plugin = self.registry.resolve_provisioner(
            provisioner,
            &self.services,
            context.plugin_config(provisioner),
        )?;

        let run_id = runs::generate_run_id()?;
        let span = tracing::info_span!(
            parent: &self.span,
            "build",
            run_id = %run_id,
            block_device = %block_device,
            provisioner = %provisioner
        );
        let _entered = span.enter();

        let created_at_utc = runs::now_utc_compact();
        let mut outcome = BuildOutcome::new(run_id, block_device, provisioner);
        self.record_run(&outcome, context, &created_at_utc, None, None);

        tracing::info!("starting build");
        let result = execute(
            device_plugin.as_mut(),
            provisioner_plugin.as_mut(),
            context,
            &mut outcome,
        );

        let finished_at_utc = runs::now_utc_compact();
        self.record_run(
            &outcome,
            context,
            &created_at_utc,
            Some(finished_at_utc),
            result.as_ref().err(),
        );

        result?;
        if outcome.is_success() {
            tracing::info!(package = %context.package.name, "build succeeded");
        } else if let Some(failure) = outcome.failure() {
            tracing::error!(error = %failure, "build failed");
        }
        Ok(outcome)
    }

    fn record_run(
        &self,
        outcome: &BuildOutcome,
        context: &BuildContext,
        created_at_utc: &str,
        finished_at_utc: Option<String>,
        violation: Option<&BuildError>,
    ) {
        let Some(runs_dir) = &self.runs_dir else {
            return;
        };
        let status = match &finished_at_utc {
            None => runs::STATUS_BUILDING,
            Some(_) if violation.is_none() && outcome.is_success() => runs::STATUS_SUCCESS,
            Some(_) => runs::STATUS_FAILED,
        };
        let finished = finished_at_utc.is_some();
        let metadata = RunMetadata {
            run_id: outcome.run_id.clone(),
            status: status.to_string(),
            created_at_utc: created_at_utc.to_string(),
            finished_at_utc,
            block_device: outcome.block_device.clone(),
            provisioner: outcome.provisioner.clone(),
            failed_step: outcome.failed_step().map(|record| record.step.to_string()),
            errors: outcome
                .errors
                .iter()
                .chain(violation)
                .map(|e| e.to_string())
                .collect(),
            package: Some(context.package.clone()),
        };
        if let Err(e) = runs::write_run_metadata(runs_dir, &metadata) {
            tracing::warn!(error = %format!("{:#}", e), "failed to write run manifest");
            return;
        }
        if let (true, Some(keep)) = (finished, self.keep_runs) {
            if let Err(e) = runs::prune_old_runs(runs_dir, keep) {
                tracing::warn!(error = %format!("{:#}", e), "failed to prune old runs");
            }
        }
    }
}

fn execute(
    device_plugin: &mut dyn BlockDevicePlugin,
    provisioner: &mut dyn Provisioner,
    context: &mut BuildContext,
    outcome: &mut BuildOutcome,
) -> Result<(), BuildError> {
    let device = match device_plugin.attach(context) {
        Ok(device) => device,
        Err(e) if e.is_contract_violation() => return Err(e),
        Err(e) => {
            outcome.record(Step::Attach, false, e.to_string());
            outcome.push_error(e);
            return Ok(());
        }
    };
    outcome.device = Some(device.path().to_path_buf());
    outcome.record(
        Step::Attach,
        true,
        format!("attached {} at {}", device.volume_id(), device.path().display()),
    );

    let mut device_guard = DeviceGuard::new(device_plugin, device);
    let target = ProvisionTarget::from_device(device_guard.device());
    provision(provisioner, &target, context, outcome);

    let device_path = device_guard.device().path().display().to_string();
    match device_guard.release()? {
        result if result.success() => outcome.record(Step::Detach, true, result.output()),
        result => {
            tracing::error!(device = %device_path, output = %result.output().trim(), "detach failed");
            outcome.record(Step::Detach, false, result.output());
            outcome.push_error(BuildError::DetachFailed {
                device: device_path,
                detail: result.output().to_string(),
            });
        }
    }
    Ok(())
}

fn provision(
    provisioner: &mut dyn Provisioner,
    target: &ProvisionTarget,
    context: &mut BuildContext,
    outcome: &mut BuildOutcome,
) {
    let (mut service_block, activated) = ServiceBlockGuard::activate(provisioner, target);
    let mut proceed = record_phase(outcome, Phase::ActivateServiceBlock, activated);

    if proceed {
        let refreshed = service_block
            .provisioner()
            .refresh_package_metadata(target, context);
        proceed = record_phase(outcome, Phase::RefreshPackageMetadata, refreshed);
    }
    if proceed {
        let provisioned = service_block.provisioner().provision_package(target, context);
        proceed = record_phase(outcome, Phase::ProvisionPackage, provisioned);
    }
    if proceed {
        service_block.provisioner().store_package_metadata(context);
        outcome.record(
            Step::Provisioner(Phase::StorePackageMetadata),
            true,
            format!(
                "{} {}-{}",
                context.package.name, context.package.version, context.package.release
            ),
        );
    }

    let deactivated = service_block.release();
    record_phase(outcome, Phase::DeactivateServiceBlock, deactivated);
}

/// Record a phase result; `false` when the phase failed.
fn record_phase(outcome: &mut BuildOutcome, phase: Phase, result: AnyResult<CommandResult>) -> bool {
    let step = Step::Provisioner(phase);
    let detail = match result {
        Ok(result) if result.success() => {
            tracing::info!(%phase, "phase succeeded");
            outcome.record(step, true, result.output());
            return true;
        }
        Ok(result) => result.output().to_string(),
        Err(e) => format!("{:#}", e),
    };
    tracing::error!(%phase, output = %detail.trim(), "phase failed");
    outcome.record(step, false, detail.clone());
    outcome.push_error(BuildError::ProvisioningPhaseFailed { phase, detail });
    false
}

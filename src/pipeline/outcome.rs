//! Aggregated result of one pipeline run.

use std::fmt;
use std::path::PathBuf;

use crate::error::BuildError;
use crate::provisioner::Phase;

/// One step the orchestrator executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Attach,
    Provisioner(Phase),
    Detach,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Attach => f.write_str("attach"),
            Step::Provisioner(phase) => write!(f, "{}", phase),
            Step::Detach => f.write_str("detach"),
        }
    }
}

/// Captured result of a step, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: Step,
    pub success: bool,
    pub output: String,
}

#[derive(Debug)]
pub struct BuildOutcome {
    pub run_id: String,
    pub block_device: String,
    pub provisioner: String,
    /// Device node the volume was attached at, if attach succeeded.
    pub device: Option<PathBuf>,
    pub steps: Vec<StepRecord>,
    /// First fatal error first; later errors (e.g. a detach failure after a
    /// failed phase) follow in the order they happened.
    pub errors: Vec<BuildError>,
}

impl BuildOutcome {
    pub(crate) fn new(run_id: String, block_device: &str, provisioner: &str) -> Self {
        Self {
            run_id,
            block_device: block_device.to_string(),
            provisioner: provisioner.to_string(),
            device: None,
            steps: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, step: Step, success: bool, output: impl Into<String>) {
        self.steps.push(StepRecord {
            step,
            success,
            output: output.into(),
        });
    }

    pub(crate) fn push_error(&mut self, error: BuildError) {
        self.errors.push(error);
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.steps.iter().all(|record| record.success)
    }

    /// The first fatal error of the run.
    pub fn failure(&self) -> Option<&BuildError> {
        self.errors.first()
    }

    /// First step that did not succeed.
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|record| !record.success)
    }

    /// Phase named by the first fatal error, when it was a provisioning phase.
    pub fn failed_phase(&self) -> Option<Phase> {
        match self.failure() {
            Some(BuildError::ProvisioningPhaseFailed { phase, .. }) => Some(*phase),
            _ => None,
        }
    }

    /// Steps executed, in order.
    pub fn executed(&self) -> Vec<Step> {
        self.steps.iter().map(|record| record.step).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_display() {
        assert_eq!(Step::Attach.to_string(), "attach");
        assert_eq!(
            Step::Provisioner(Phase::ProvisionPackage).to_string(),
            "provision_package"
        );
    }

    #[test]
    fn test_first_error_is_primary() {
        let mut outcome = BuildOutcome::new("r1".into(), "virtio", "chef");
        outcome.record(Step::Provisioner(Phase::ProvisionPackage), false, "boom");
        outcome.push_error(BuildError::ProvisioningPhaseFailed {
            phase: Phase::ProvisionPackage,
            detail: "boom".into(),
        });
        outcome.record(Step::Detach, false, "busy");
        outcome.push_error(BuildError::DetachFailed {
            device: "/dev/vdb".into(),
            detail: "busy".into(),
        });

        assert!(!outcome.is_success());
        assert_eq!(outcome.failed_phase(), Some(Phase::ProvisionPackage));
        assert_eq!(
            outcome.failed_step().map(|record| record.step),
            Some(Step::Provisioner(Phase::ProvisionPackage))
        );
        assert_eq!(outcome.errors.len(), 2);
    }
}

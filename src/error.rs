//! Error taxonomy for pipeline runs.
//!
//! Contract violations ([`BuildError::LifecycleViolation`],
//! [`BuildError::PluginNotFound`]) are returned to the caller immediately.
//! Everything else is collected into the run's
//! [`BuildOutcome`](crate::pipeline::BuildOutcome).

use thiserror::Error;

use crate::provisioner::Phase;
use crate::registry::Capability;

#[derive(Error, Debug)]
pub enum BuildError {
    /// A plugin was driven out of its state order.
    #[error("lifecycle violation in '{plugin}': {detail}")]
    LifecycleViolation { plugin: String, detail: String },

    #[error("attach failed for volume '{volume}': {detail}")]
    AttachFailed { volume: String, detail: String },

    #[error("detach failed for device '{device}': {detail}")]
    DetachFailed { device: String, detail: String },

    #[error("provisioning phase '{phase}' failed: {detail}")]
    ProvisioningPhaseFailed { phase: Phase, detail: String },

    #[error("no {capability} plugin registered under '{name}'")]
    PluginNotFound { capability: Capability, name: String },

    #[error("failed to initialize {capability} plugin '{name}': {detail}")]
    PluginInit {
        capability: Capability,
        name: String,
        detail: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    pub(crate) fn lifecycle(plugin: &str, detail: impl Into<String>) -> Self {
        BuildError::LifecycleViolation {
            plugin: plugin.to_string(),
            detail: detail.into(),
        }
    }

    /// Errors that abort the caller instead of being folded into an outcome.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            BuildError::LifecycleViolation { .. } | BuildError::PluginNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_failure_display() {
        let err = BuildError::ProvisioningPhaseFailed {
            phase: Phase::ProvisionPackage,
            detail: "chef-solo exited 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "provisioning phase 'provision_package' failed: chef-solo exited 1"
        );
    }

    #[test]
    fn test_plugin_not_found_display() {
        let err = BuildError::PluginNotFound {
            capability: Capability::Provisioner,
            name: "puppet".into(),
        };
        assert_eq!(err.to_string(), "no provisioner plugin registered under 'puppet'");
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_attach_failed_is_not_contract_violation() {
        let err = BuildError::AttachFailed {
            volume: "root".into(),
            detail: "quota".into(),
        };
        assert!(!err.is_contract_violation());
    }
}

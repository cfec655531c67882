//! Preflight checks for build validation.
//!
//! Validates that the host has the tools a platform shells out to, so a
//! missing `losetup` is reported before any volume is touched.
//!
//! # Example
//!
//! ```rust
//! use image_builder::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("losetup") {
//!     println!("util-linux not installed");
//! }
//!
//! let tools = &[("tar", "tar"), ("chroot", "coreutils")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Host tools every build needs regardless of plugin, as (command, package).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("tar", "tar"), ("chroot", "coreutils")];

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool with the package to install.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists_finds_sh() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_missing_tools_are_listed_with_package() {
        let err = check_required_tools(&[
            ("sh", "dash"),
            ("definitely_not_a_real_command_12345", "nowhere-utils"),
        ])
        .unwrap_err()
        .to_string();
        assert!(err.contains("definitely_not_a_real_command_12345 (install: nowhere-utils)"));
        assert!(!err.contains("dash"));
    }
}

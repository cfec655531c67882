//! External command execution.
//!
//! Every command a plugin issues goes through a [`CommandRunner`]. The runner
//! only executes and captures; it never interprets what the output means.
//! A non-zero exit is a normal [`CommandResult`] with `success == false`.
//! `Err` is reserved for failures to spawn or to collect the process.

use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;
use std::process::Command;

/// A fully-formed process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Run `line` through `sh -c`.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Wrap this invocation so it executes inside `root` via `chroot`.
    ///
    /// A root of `/` leaves the command untouched.
    pub fn chrooted(self, root: &Path) -> Self {
        if root == Path::new("/") {
            return self;
        }
        let mut wrapped = Self::new("chroot")
            .arg(root.display().to_string())
            .arg(self.program)
            .args(self.args);
        wrapped.env = self.env;
        wrapped
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Immutable outcome of an externally-invoked command or plugin step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    success: bool,
    output: String,
    exit_code: Option<i32>,
}

impl CommandResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            exit_code: Some(0),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            output: detail.into(),
            exit_code: None,
        }
    }

    pub fn from_exit(exit_code: Option<i32>, success: bool, output: String) -> Self {
        Self {
            success,
            output,
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Combined stdout and stderr, or the error detail for synthesized results.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

/// Executes commands on behalf of plugins.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult>;
}

/// Runs commands as host processes, blocking until they exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        tracing::debug!(command = %spec, "running command");
        let output = command
            .output()
            .with_context(|| format!("spawning '{}'", spec))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}{}", stdout, stderr);

        if !output.status.success() {
            tracing::debug!(command = %spec, status = %output.status, "command failed");
        }

        Ok(CommandResult::from_exit(
            output.status.code(),
            output.status.success(),
            combined,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_runner_captures_output() {
        let result = SystemRunner
            .run(&CommandSpec::shell("echo out; echo err >&2"))
            .unwrap();
        assert!(result.success());
        assert_eq!(result.exit_code(), Some(0));
        assert!(result.output().contains("out"));
        assert!(result.output().contains("err"));
    }

    #[test]
    fn test_non_zero_exit_is_not_an_error() {
        let result = SystemRunner
            .run(&CommandSpec::shell("echo broken; exit 3"))
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code(), Some(3));
        assert!(result.output().contains("broken"));
    }

    #[test]
    fn test_spawn_failure_is_an_error() {
        let result = SystemRunner.run(&CommandSpec::new("definitely_not_a_real_command_12345"));
        assert!(result.is_err());
    }

    #[test]
    fn test_chrooted_wraps_only_non_root_targets() {
        let spec = CommandSpec::shell("true");
        assert_eq!(spec.clone().chrooted(Path::new("/")), spec);

        let wrapped = spec.chrooted(Path::new("/mnt/image"));
        assert_eq!(wrapped.program(), "chroot");
        assert_eq!(wrapped.get_args(), ["/mnt/image", "sh", "-c", "true"]);
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let spec = CommandSpec::shell("tar -xf a.tar");
        assert_eq!(spec.to_string(), "sh -c 'tar -xf a.tar'");
    }
}

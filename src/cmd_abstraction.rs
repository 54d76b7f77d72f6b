//! Command execution abstraction for testability.
//!
//! This module provides a trait-based abstraction over command execution,
//! allowing unit tests to script firewall tool output without running it.

use anyhow::{Context, Result};
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;

use crate::error::ChainbanError;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Successful output with the given stdout (used by fakes and tests).
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    /// Failed output with the given stderr and exit code.
    pub fn failed(stderr: impl Into<String>, code: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            code: Some(code),
        }
    }
}

/// Trait for command execution, allowing dependency injection for testing.
///
/// The real implementation spawns the program; tests use `MockCommandExecutor`
/// or the in-memory iptables simulator.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command with the given arguments.
    ///
    /// An `Err` means the program could not be spawned at all; a non-zero exit
    /// is reported through `CommandOutput::success`.
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Real implementation of CommandExecutor that runs actual system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute {}", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for &E {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        (**self).execute(cmd, args)
    }
}

/// Run a command and return its stdout as ordered lines.
///
/// A non-zero exit becomes [`ChainbanError::Command`] carrying the captured
/// stderr and exit status.
pub fn run_lines<E: CommandExecutor + ?Sized>(
    executor: &E,
    program: &str,
    args: &[String],
) -> Result<Vec<String>> {
    let output = executor.execute(program, args)?;
    if !output.success {
        return Err(ChainbanError::Command {
            program: program.to_string(),
            code: output.code,
            stderr: output.stderr,
        }
        .into());
    }
    Ok(output.stdout.lines().map(str::to_string).collect())
}

/// Helper function to convert a slice of &str to Vec<String>.
///
/// mockall has issues with lifetimes in `&[&str]`, so the trait takes
/// `&[String]` instead.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

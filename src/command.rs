use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, DispatchError};

/// Abstract external tool invocation, always spawned from an argument vector
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

/// Captured result of a finished tool invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Last non-empty stderr line, or the exit status when stderr is empty
    pub fn failure_summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.trim().to_string())
            .unwrap_or_else(|| format!("exit status {}", self.status))
    }
}

impl ToolCommand {
    /// Create a new tool command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add a flag followed by its value
    pub fn flag<S1: Into<String>, S2: Into<String>>(self, flag: S1, value: S2) -> Self {
        self.arg(flag).arg(value)
    }

    /// Add a flag followed by a path value
    pub fn path_flag<S: Into<String>, P: AsRef<Path>>(self, flag: S, path: P) -> Self {
        self.flag(flag, path.as_ref().to_string_lossy().to_string())
    }

    /// Run the command to completion, capturing stdout and stderr.
    ///
    /// The child is killed if the returned future is dropped, so wrapping
    /// this call in `tokio::time::timeout` also terminates the process.
    pub async fn output(&self) -> Result<ToolOutput> {
        debug!("Executing command: {} {:?}", self.binary_path, self.args);
        debug!("Description: {}", self.description);

        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run the command and fail with `wrap` unless it exits successfully
    pub async fn execute_with<F>(&self, wrap: F) -> Result<ToolOutput>
    where
        F: Fn(String) -> DispatchError,
    {
        let output = self
            .output()
            .await
            .map_err(|e| wrap(format!("Failed to execute {}: {}", self.binary_path, e)))?;

        if !output.success() {
            return Err(wrap(format!(
                "{} failed: {}",
                self.description,
                output.failure_summary()
            )));
        }

        Ok(output)
    }
}

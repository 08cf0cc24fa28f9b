//! Availability probe and time-boxed runner for external security tools.

use crate::{Result, ScanError};
use log::debug;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Captured output of a finished tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Last non-empty stderr line, for error messages.
    pub fn stderr_summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("no diagnostic output")
            .to_string()
    }
}

/// Run `binary version_arg`; available means it exited 0 within `limit`.
pub async fn is_available(binary: &str, version_arg: &str, limit: Duration) -> bool {
    let mut cmd = Command::new(binary);
    cmd.arg(version_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match timeout(limit, cmd.status()).await {
        Ok(Ok(status)) => {
            debug!("{} {} exited with {}", binary, version_arg, status);
            status.success()
        }
        Ok(Err(e)) => {
            debug!("{} is not runnable: {}", binary, e);
            false
        }
        Err(_) => {
            debug!("{} availability probe timed out after {:?}", binary, limit);
            false
        }
    }
}

/// Run a tool to completion, killing it if it outlives `limit`.
pub async fn run_tool(binary: &str, args: &[String], limit: Duration) -> Result<ToolOutput> {
    debug!("Running {} {}", binary, args.join(" "));

    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                ScanError::ToolUnavailable(format!("{}: {}", binary, e))
            }
            _ => ScanError::Network(e),
        })?;

    // Dropping the future on timeout drops the child, which kills it.
    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ScanError::SubprocessTimeout {
                tool: binary.to_string(),
                seconds: limit.as_secs(),
            })
        }
    };

    Ok(ToolOutput {
        code: output.status.code(),
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

//! Bounded execution of short-lived external commands

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Outcome of [`run_command`]. Spawn failures and timeouts are reported
/// here, never as an error.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Set when the command could not be started or waited on
    pub error: Option<String>,
}

impl CommandOutput {
    /// stdout and stderr joined, lowercased, for marker matching
    pub fn combined_lower(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr).to_lowercase()
    }
}

/// Run `program` to completion, killing it once `timeout` elapses.
pub async fn run_command<P, A, S>(program: P, args: A, timeout: Duration) -> CommandOutput
where
    P: AsRef<OsStr>,
    A: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program_name = program.as_ref().to_string_lossy().into_owned();
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            debug!(program = %program_name, "Failed to spawn: {}", e);
            return CommandOutput {
                error: Some(format!("Failed to run {program_name}: {e}")),
                ..Default::default()
            };
        }
    };

    // Dropping the future on timeout drops the child, which kills it
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            error: None,
        },
        Ok(Err(e)) => CommandOutput {
            error: Some(format!("Failed to wait for {program_name}: {e}")),
            ..Default::default()
        },
        Err(_) => {
            debug!(program = %program_name, ?timeout, "Command timed out");
            CommandOutput {
                timed_out: true,
                error: Some(format!("{program_name} timed out after {}ms", timeout.as_millis())),
                ..Default::default()
            }
        }
    }
}

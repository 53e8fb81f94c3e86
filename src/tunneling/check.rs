use std::process::Stdio;

use futures::future::join_all;
use tokio::process::Command;
use tracing::{error, info};

use super::command::{LaunchCommand, PING_REPLY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CheckResult {
    pub label: String,
    /// `None` when the login answered as expected
    pub error: Option<String>,
}

/// Runs one connectivity check and compares its output to the expected reply.
pub(crate) async fn run_check(command: &LaunchCommand) -> CheckResult {
    let output = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .output()
        .await;
    let error = match output {
        Err(e) => Some(format!("unable to run {}: {e}", command.program.display())),
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if output.status.success() && stdout.trim() == PING_REPLY {
                None
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Some(if stderr.is_empty() {
                    format!("bad response: {}", stdout.trim())
                } else {
                    stderr
                })
            }
        }
    };
    match &error {
        None => info!(group = %command.label, "connection ok"),
        Some(reason) => error!(group = %command.label, "unable to connect: {reason}"),
    }
    CheckResult {
        label: command.label.clone(),
        error,
    }
}

/// Checks every group concurrently; results keep the input order.
pub(crate) async fn run_checks(commands: &[LaunchCommand]) -> Vec<CheckResult> {
    join_all(commands.iter().map(run_check)).await
}

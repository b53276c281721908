//! Shell extension: runs a step's `command` input through `sh -c`.
//!
//! Registered as `Bash` with the single tool `execute_command`. Outputs are
//! `stdout`, `stderr` and `exit_code`; a trailing newline is stripped from
//! both streams. A non-zero exit is reported as an error response carrying
//! stderr.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use paws_core::workflow::boundary::{
    DispatchError, ExtensionInvoker, ExtensionRequest, ExtensionResponse,
};

/// Extension name documents use for shell steps.
pub const SHELL_EXTENSION: &str = "Bash";

/// The only tool the shell extension offers.
pub const EXECUTE_COMMAND: &str = "execute_command";

/// Default per-command time limit (30 seconds).
pub const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 30;

/// Host shell extension.
#[derive(Debug, Clone)]
pub struct ShellExtension {
    timeout: Duration,
}

impl ShellExtension {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShellExtension {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_SHELL_TIMEOUT_SECS))
    }
}

fn strip_newline(bytes: &[u8]) -> String {
    let lossy = String::from_utf8_lossy(bytes);
    let text: &str = &lossy;
    text.strip_suffix('\n')
        .map(|t| t.strip_suffix('\r').unwrap_or(t))
        .unwrap_or(text)
        .to_string()
}

impl ExtensionInvoker for ShellExtension {
    fn has_extension(&self, extension: &str) -> bool {
        extension == SHELL_EXTENSION
    }

    async fn invoke(&self, request: ExtensionRequest) -> Result<ExtensionResponse, DispatchError> {
        if let Some(tool) = request.tool.as_deref() {
            if tool != EXECUTE_COMMAND {
                return Ok(ExtensionResponse::error(format!(
                    "unknown tool '{tool}' for extension {SHELL_EXTENSION}"
                )));
            }
        }
        let Some(command) = request.inputs.get("command") else {
            return Ok(ExtensionResponse::error("missing required input 'command'"));
        };

        // The engine enforces the step timeout too; the shorter limit wins.
        let timeout = self.timeout.min(Duration::from_millis(request.timeout_ms));

        tracing::debug!(
            attempt_id = request.attempt_id.as_str(),
            command = command.as_str(),
            timeout_ms = timeout.as_millis() as u64,
            "running shell command"
        );

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DispatchError::Unreachable {
                extension: SHELL_EXTENSION.to_string(),
                reason: format!("failed to spawn sh: {e}"),
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => {
                return Err(DispatchError::Timeout {
                    extension: SHELL_EXTENSION.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Ok(result) => result.map_err(|e| DispatchError::Unreachable {
                extension: SHELL_EXTENSION.to_string(),
                reason: format!("failed to wait for sh: {e}"),
            })?,
        };

        let stdout = strip_newline(&output.stdout);
        let stderr = strip_newline(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            tracing::debug!(exit_code, stderr = stderr.as_str(), "shell command failed");
            let message = if stderr.trim().is_empty() {
                format!("command exited with status {exit_code}")
            } else {
                format!("command exited with status {exit_code}: {}", stderr.trim())
            };
            return Ok(ExtensionResponse::error(message));
        }

        Ok(ExtensionResponse::success(BTreeMap::from([
            ("stdout".to_string(), stdout),
            ("stderr".to_string(), stderr),
            ("exit_code".to_string(), exit_code.to_string()),
        ])))
    }
}

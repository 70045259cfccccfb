//! Local command execution using `tokio::process`

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, instrument};

use crate::command::CommandSpec;
use crate::error::ExecError;
use crate::result::{CommandOutput, SIGNAL_RETURN_CODE};
use crate::traits::RemoteExecutor;

/// Local command executor
///
/// Spawns the argv directly (no shell) on the local machine using
/// `tokio::process::Command`.
#[derive(Debug, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Create a new local executor
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Internal method to execute command
    #[instrument(skip(self, spec), fields(command = %spec), level = "debug")]
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let start = Instant::now();

        debug!("executing local command");

        let child = Command::new(spec.program())
            .args(spec.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn {
                program: spec.program().to_string(),
                reason: e.to_string(),
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecError::Io(e.to_string()))?;

        let duration = start.elapsed();

        // terminated by a signal
        let return_code = output.status.code().unwrap_or(SIGNAL_RETURN_CODE);

        debug!(
            return_code = return_code,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            duration = ?duration,
            "command completed"
        );

        Ok(CommandOutput {
            return_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration,
        })
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.execute(spec).await
    }

    async fn run_with_timeout(
        &self,
        spec: &CommandSpec,
        timeout_duration: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let start = Instant::now();

        debug!(command = %spec, timeout = ?timeout_duration, "executing with timeout");

        match timeout(timeout_duration, self.execute(spec)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    command = %spec,
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    fn description(&self) -> String {
        "localhost".to_string()
    }

    fn executor_type(&self) -> &'static str {
        "local"
    }
}

//! Command executor trait

use std::time::Duration;

use async_trait::async_trait;

use crate::command::CommandSpec;
use crate::error::ExecError;
use crate::result::CommandOutput;

/// Run a command against one backend and capture its output
///
/// Implementations never retry; a non-zero exit is reported through
/// `CommandOutput::return_code`.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;

    async fn run_with_timeout(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError>;

    /// Human-readable identity, for logs and error context only
    fn description(&self) -> String;

    fn executor_type(&self) -> &'static str;
}

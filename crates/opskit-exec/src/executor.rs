//! Closed set of execution backends

use std::time::Duration;

use async_trait::async_trait;

use crate::command::CommandSpec;
use crate::error::ExecError;
use crate::local::LocalExecutor;
use crate::result::CommandOutput;
use crate::ssh::SshExecutor;
use crate::traits::RemoteExecutor;

/// Backend chosen once, when a host is constructed
#[derive(Debug, Clone)]
pub enum CommandExecutor {
    /// Child processes on this machine
    Local(LocalExecutor),
    /// A fresh SSH session per command
    Ssh(SshExecutor),
}

impl CommandExecutor {
    /// Whether commands run on this machine
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, CommandExecutor::Local(_))
    }

    /// The SSH backend, if this is one
    #[must_use]
    pub fn as_ssh(&self) -> Option<&SshExecutor> {
        match self {
            CommandExecutor::Ssh(ssh) => Some(ssh),
            CommandExecutor::Local(_) => None,
        }
    }
}

impl From<LocalExecutor> for CommandExecutor {
    fn from(executor: LocalExecutor) -> Self {
        CommandExecutor::Local(executor)
    }
}

impl From<SshExecutor> for CommandExecutor {
    fn from(executor: SshExecutor) -> Self {
        CommandExecutor::Ssh(executor)
    }
}

#[async_trait]
impl RemoteExecutor for CommandExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        match self {
            CommandExecutor::Local(local) => local.run(spec).await,
            CommandExecutor::Ssh(ssh) => ssh.run(spec).await,
        }
    }

    async fn run_with_timeout(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        match self {
            CommandExecutor::Local(local) => local.run_with_timeout(spec, timeout).await,
            CommandExecutor::Ssh(ssh) => ssh.run_with_timeout(spec, timeout).await,
        }
    }

    fn description(&self) -> String {
        match self {
            CommandExecutor::Local(local) => local.description(),
            CommandExecutor::Ssh(ssh) => ssh.description(),
        }
    }

    fn executor_type(&self) -> &'static str {
        match self {
            CommandExecutor::Local(local) => local.executor_type(),
            CommandExecutor::Ssh(ssh) => ssh.executor_type(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Credentials;
    use crate::ssh::SshExecutorBuilder;

    #[tokio::test]
    async fn test_local_variant_dispatches() {
        let executor = CommandExecutor::from(LocalExecutor::new());
        let spec = CommandSpec::new(["echo", "via enum"]).unwrap();

        let output = executor.run(&spec).await.unwrap();
        assert_eq!(output.stdout, b"via enum\n");
        assert!(executor.is_local());
        assert!(executor.as_ssh().is_none());
        assert_eq!(executor.executor_type(), "local");
    }

    #[test]
    fn test_ssh_variant_description() {
        let ssh = SshExecutorBuilder::new("web1", Credentials::password("deploy", "pw"))
            .build()
            .unwrap();
        let executor = CommandExecutor::from(ssh);

        assert!(!executor.is_local());
        assert_eq!(executor.description(), "deploy@web1:22");
    }
}

//! Host: a named execution target bound to one backend
//!
//! The backend is picked once in [`HostBuilder::build`]: `localhost` runs
//! child processes, anything else goes over SSH. A host never falls back
//! from one to the other.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use opskit_exec::{
    CommandExecutor, CommandOutput, CommandSpec, Credentials, HostKeyPolicy, LocalExecutor,
    RemoteExecutor, SshExecutorBuilder,
};
use opskit_exec::result::DEFAULT_HANDSHAKE_TIMEOUT;

use crate::config::HostConfig;
use crate::error::CoreError;
use crate::identity::HostIdentity;
use crate::log::Logger;
use crate::probes::{KnownHostRenewal, wait_for_ssh};
use crate::reach::{RetryBudget, WaitReport};

/// Raw bytes per upload command; base64 grows this by a third
const UPLOAD_CHUNK_SIZE: usize = 32 * 1024;

/// Distinguishes concurrent installs from this process
static INSTALL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Temporary path next to `dest`, unique within this process
fn temp_path(dest: &str) -> String {
    let seq = INSTALL_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{dest}.opskit-tmp.{}.{seq}", std::process::id())
}

/// Single-quote `value` for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Ownership and mode applied after installing a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// `chown` argument, e.g. `root:root`
    pub owner: Option<String>,
    /// Permission bits
    pub mode: u32,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            owner: None,
            mode: 0o755,
        }
    }
}

/// Builder for [`Host`]
#[derive(Debug)]
pub struct HostBuilder {
    identity: HostIdentity,
    port: u16,
    credentials: Option<Credentials>,
    host_key_policy: HostKeyPolicy,
    handshake_timeout: Duration,
    logger: Logger,
}

impl HostBuilder {
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Select the backend and build the host
    ///
    /// # Errors
    /// `CoreError::MissingCredentials` for a remote host without credentials;
    /// `CoreError::Exec` if the SSH target is unusable
    pub fn build(self) -> Result<Host, CoreError> {
        let executor = if self.identity.is_localhost() {
            CommandExecutor::Local(LocalExecutor::new())
        } else {
            let hostname = self.identity.hostname();
            let credentials = self
                .credentials
                .ok_or_else(|| CoreError::MissingCredentials(self.identity.to_string()))?;
            let credentials = match self.identity.username() {
                Some(user) => credentials.with_username(user),
                None => credentials,
            };

            let ssh = SshExecutorBuilder::new(hostname, credentials)
                .with_port(self.port)
                .with_host_key_policy(self.host_key_policy)
                .with_handshake_timeout(self.handshake_timeout)
                .build()
                .map_err(|e| CoreError::exec(hostname, "configure SSH", e))?;
            CommandExecutor::Ssh(ssh)
        };

        self.logger.debug(format!(
            "bound {} to {} executor",
            self.identity,
            executor.executor_type()
        ));

        Ok(Host {
            identity: self.identity,
            executor,
            logger: self.logger,
        })
    }
}

/// A named execution target
///
/// Read-only after construction; safe to share between tasks.
#[derive(Debug)]
pub struct Host {
    identity: HostIdentity,
    executor: CommandExecutor,
    logger: Logger,
}

impl Host {
    /// Start building a host for `identity`
    #[must_use]
    pub fn builder(identity: HostIdentity) -> HostBuilder {
        HostBuilder {
            identity,
            port: 22,
            credentials: None,
            host_key_policy: HostKeyPolicy::AcceptAny,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            logger: Logger::default(),
        }
    }

    /// The local machine
    #[must_use]
    pub fn localhost(logger: Logger) -> Self {
        Self {
            identity: HostIdentity::localhost(),
            executor: CommandExecutor::Local(LocalExecutor::new()),
            logger,
        }
    }

    /// Build a host from a config entry
    ///
    /// # Errors
    /// Propagates identity, credential and SSH configuration errors
    pub fn from_config(config: &HostConfig, logger: Logger) -> Result<Self, CoreError> {
        let mut builder = Host::builder(config.identity()?)
            .port(config.port)
            .host_key_policy(config.host_key_policy())
            .logger(logger);
        if let Some(credentials) = config.credentials()? {
            builder = builder.credentials(credentials);
        }
        builder.build()
    }

    #[must_use]
    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    #[must_use]
    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.executor.is_local()
    }

    /// Human-readable identity, for logs and error context
    #[must_use]
    pub fn description(&self) -> String {
        self.executor.description()
    }

    /// Run a command; a non-zero exit is returned, not raised
    ///
    /// # Errors
    /// `CoreError::Exec` wrapping the backend failure
    pub async fn run_command(&self, spec: &CommandSpec) -> Result<CommandOutput, CoreError> {
        self.logger
            .debug(format!("{}: running `{spec}`", self.description()));
        self.executor
            .run(spec)
            .await
            .map_err(|e| CoreError::exec(self.description(), format!("run `{spec}`"), e))
    }

    /// Run a command, giving up after `timeout`
    ///
    /// # Errors
    /// `CoreError::Exec` wrapping the backend failure or `ExecError::Timeout`
    pub async fn run_command_with_timeout(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, CoreError> {
        self.executor
            .run_with_timeout(spec, timeout)
            .await
            .map_err(|e| CoreError::exec(self.description(), format!("run `{spec}`"), e))
    }

    /// Wait until the host accepts an SSH login
    ///
    /// Local hosts are always reachable. With `renew_host_key`, the cached
    /// host key is replaced before each attempt.
    ///
    /// # Errors
    /// `CoreError::Timeout`, or `CoreError::ProbeFailed` on rejected credentials
    pub async fn check_reachable(
        &self,
        budget: &RetryBudget,
        renew_host_key: bool,
    ) -> Result<WaitReport, CoreError> {
        let Some(ssh) = self.executor.as_ssh() else {
            return Ok(WaitReport {
                attempts: 0,
                elapsed: Duration::ZERO,
            });
        };

        let renewal = if renew_host_key {
            Some(KnownHostRenewal::for_policy(&ssh.target().host_key_policy)?)
        } else {
            None
        };

        wait_for_ssh(ssh, budget, &self.logger, renewal.as_ref()).await
    }

    /// Copy a local file to `dest` on this host
    ///
    /// The content is written to a temporary file next to `dest` and then
    /// moved into place, so `dest` never holds a partial file. Ownership and
    /// mode are applied afterwards.
    ///
    /// # Errors
    /// `CoreError::Io` if the local file cannot be read; `CoreError::Exec` if
    /// any remote step fails (the temporary file is removed)
    pub async fn install_binary(
        &self,
        local_path: &Path,
        dest: &str,
        options: &InstallOptions,
    ) -> Result<(), CoreError> {
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| CoreError::Io(format!("{}: {e}", local_path.display())))?;

        let tmp = temp_path(dest);
        let result = self.upload_and_move(&content, &tmp, dest, options).await;

        if result.is_err() {
            let cleanup = format!("rm -f {}", shell_quote(&tmp));
            if let Err(e) = self.run_script(&cleanup, "remove temporary file").await {
                self.logger
                    .warn(format!("could not remove {tmp} on {}: {e}", self.description()));
            }
        }
        result?;

        self.logger.changed(format!(
            "installed {} to {}:{dest} (mode {:o})",
            local_path.display(),
            self.identity.hostname(),
            options.mode
        ));
        Ok(())
    }

    async fn upload_and_move(
        &self,
        content: &[u8],
        tmp: &str,
        dest: &str,
        options: &InstallOptions,
    ) -> Result<(), CoreError> {
        let tmp_q = shell_quote(tmp);
        let dest_q = shell_quote(dest);

        self.run_script(&format!(": > {tmp_q}"), "create temporary file")
            .await?;
        for chunk in content.chunks(UPLOAD_CHUNK_SIZE) {
            let encoded = STANDARD.encode(chunk);
            self.run_script(
                &format!("printf '%s' {encoded} | base64 -d >> {tmp_q}"),
                "upload chunk",
            )
            .await?;
        }

        self.run_script(&format!("mv -f {tmp_q} {dest_q}"), "move into place")
            .await?;
        if let Some(owner) = &options.owner {
            self.run_script(
                &format!("chown {} {dest_q}", shell_quote(owner)),
                "change owner",
            )
            .await?;
        }
        self.run_script(&format!("chmod {:o} {dest_q}", options.mode), "change mode")
            .await?;
        Ok(())
    }

    /// Spec that has `script` interpreted by a POSIX shell on this host
    fn shell_spec(&self, script: &str) -> Result<CommandSpec, CoreError> {
        let spec = if self.is_local() {
            CommandSpec::new(["sh", "-c", script])
        } else {
            // the remote side already hands the line to a shell
            CommandSpec::new([script])
        };
        spec.map_err(|e| CoreError::exec(self.description(), "build command", e))
    }

    /// Run a shell script and require a zero exit
    async fn run_script(&self, script: &str, context: &str) -> Result<CommandOutput, CoreError> {
        let spec = self.shell_spec(script)?;
        self.run_command(&spec)
            .await?
            .into_checked()
            .map_err(|e| CoreError::exec(self.description(), context, e))
    }

    /// Handle to a directory on this host
    #[must_use]
    pub fn directory(&self, path: impl Into<String>) -> HostDirectory<'_> {
        HostDirectory {
            host: self,
            path: path.into(),
        }
    }
}

/// A directory path on a [`Host`]; nothing is touched until a method runs
#[derive(Debug, Clone)]
pub struct HostDirectory<'a> {
    host: &'a Host,
    path: String,
}

impl HostDirectory<'_> {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// # Errors
    /// `CoreError::Exec` if the check cannot be run
    pub async fn exists(&self) -> Result<bool, CoreError> {
        let spec = self
            .host
            .shell_spec(&format!("test -d {}", shell_quote(&self.path)))?;
        Ok(self.host.run_command(&spec).await?.success())
    }

    /// Create the directory and any missing parents
    ///
    /// # Errors
    /// `CoreError::Exec` if `mkdir` fails
    pub async fn create(&self) -> Result<(), CoreError> {
        self.host
            .run_script(
                &format!("mkdir -p {}", shell_quote(&self.path)),
                "create directory",
            )
            .await?;
        Ok(())
    }

    /// Entry names, including hidden ones, sorted
    ///
    /// # Errors
    /// `CoreError::Exec` if the directory cannot be listed
    pub async fn list(&self) -> Result<Vec<String>, CoreError> {
        let output = self
            .host
            .run_script(
                &format!("ls -1A {}", shell_quote(&self.path)),
                "list directory",
            )
            .await?;
        let mut entries: Vec<String> = output
            .stdout_lossy()
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// Remove the directory and everything below it
    ///
    /// # Errors
    /// `CoreError::Exec` if `rm` fails
    pub async fn remove(&self) -> Result<(), CoreError> {
        self.host
            .run_script(
                &format!("rm -rf {}", shell_quote(&self.path)),
                "remove directory",
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    use crate::log::{LogLevel, MemorySink};

    fn local_host() -> Host {
        Host::builder(HostIdentity::localhost()).build().unwrap()
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_temp_paths_are_unique() {
        let first = temp_path("/usr/local/bin/tool");
        let second = temp_path("/usr/local/bin/tool");
        assert_ne!(first, second);
        assert!(first.starts_with("/usr/local/bin/tool.opskit-tmp."));
    }

    #[test]
    fn test_localhost_binds_local_backend() {
        let host = Host::builder(HostIdentity::localhost())
            .credentials(Credentials::password("ignored", "ignored"))
            .build()
            .unwrap();
        assert!(host.is_local());
        assert_eq!(host.description(), "localhost");
    }

    #[test]
    fn test_remote_requires_credentials() {
        let result = Host::builder(HostIdentity::new("web1").unwrap()).build();
        assert!(matches!(result, Err(CoreError::MissingCredentials(_))));
    }

    #[test]
    fn test_remote_binds_ssh_with_identity_username() {
        let identity = "deploy@web1".parse::<HostIdentity>().unwrap();
        let host = Host::builder(identity)
            .port(2200)
            .credentials(Credentials::password("someone-else", "pw"))
            .build()
            .unwrap();

        assert!(!host.is_local());
        assert_eq!(host.description(), "deploy@web1:2200");
    }

    #[test]
    fn test_loopback_address_is_still_remote() {
        let host = Host::builder(HostIdentity::new("127.0.0.1").unwrap())
            .credentials(Credentials::password("ops", "pw"))
            .build()
            .unwrap();
        assert!(!host.is_local());
    }

    #[tokio::test]
    async fn test_run_command_locally() {
        let host = local_host();
        let spec = CommandSpec::new(["sh", "-c", "printf out; printf err >&2; exit 3"]).unwrap();

        let output = host.run_command(&spec).await.unwrap();
        assert_eq!(output.return_code, 3);
        assert_eq!(output.stdout, b"out");
        assert_eq!(output.stderr, b"err");
    }

    #[tokio::test]
    async fn test_run_command_wraps_spawn_error() {
        let host = local_host();
        let spec = CommandSpec::new(["opskit-no-such-binary"]).unwrap();

        let err = host.run_command(&spec).await.unwrap_err();
        assert_eq!(err.exec_kind(), Some(opskit_exec::ErrorKind::Execution));
        assert!(err.to_string().contains("opskit-no-such-binary"));
    }

    #[tokio::test]
    async fn test_run_command_with_timeout() {
        let host = local_host();

        let quick = host
            .run_command_with_timeout(
                &CommandSpec::new(["echo", "hi"]).unwrap(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(quick.stdout, b"hi\n");

        let err = host
            .run_command_with_timeout(
                &CommandSpec::new(["sleep", "5"]).unwrap(),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert_eq!(err.exec_kind(), Some(opskit_exec::ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_concurrent_installs_to_same_dest() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        let a: Vec<u8> = vec![b'a'; 70_000];
        let b: Vec<u8> = vec![b'b'; 70_000];
        std::fs::write(&first, &a).unwrap();
        std::fs::write(&second, &b).unwrap();

        let dest = dir.path().join("tool");
        let dest = dest.to_str().unwrap();
        let host = local_host();
        let options = InstallOptions::default();

        let (r1, r2) = tokio::join!(
            host.install_binary(&first, dest, &options),
            host.install_binary(&second, dest, &options),
        );
        r1.unwrap();
        r2.unwrap();

        let installed = std::fs::read(dest).unwrap();
        assert!(installed == a || installed == b);
    }

    #[tokio::test]
    async fn test_local_host_is_always_reachable() {
        let report = local_host()
            .check_reachable(&RetryBudget::default(), false)
            .await
            .unwrap();
        assert_eq!(report.attempts, 0);
    }

    #[tokio::test]
    async fn test_install_binary_locally() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tool");
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &content).unwrap();

        let dest = dir.path().join("bin tool's copy");
        let sink = Arc::new(MemorySink::new());
        let host = Host::localhost(Logger::new(sink.clone(), false));

        host.install_binary(
            &source,
            dest.to_str().unwrap(),
            &InstallOptions {
                owner: None,
                mode: 0o750,
            },
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), content);
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
        assert_eq!(sink.messages_at(LogLevel::Changed).len(), 1);

        // no temporary files left behind
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains("opskit-tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_install_binary_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = local_host()
            .install_binary(
                &dir.path().join("missing"),
                dir.path().join("dest").to_str().unwrap(),
                &InstallOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[tokio::test]
    async fn test_install_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tool");
        std::fs::write(&source, b"#!/bin/sh\n").unwrap();
        let dest = dir.path().join("dest");

        let err = local_host()
            .install_binary(
                &source,
                dest.to_str().unwrap(),
                &InstallOptions {
                    owner: Some("opskit-no-such-user".to_string()),
                    mode: 0o755,
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.exec_kind(), Some(opskit_exec::ErrorKind::CommandFailed));
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.contains("opskit-tmp")));
    }

    #[tokio::test]
    async fn test_directory_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a b/nested");
        let host = local_host();
        let handle = host.directory(path.to_str().unwrap());

        assert!(!handle.exists().await.unwrap());
        handle.create().await.unwrap();
        assert!(handle.exists().await.unwrap());

        std::fs::write(path.join("z.txt"), b"z").unwrap();
        std::fs::write(path.join(".hidden"), b"h").unwrap();
        assert_eq!(handle.list().await.unwrap(), vec![".hidden", "z.txt"]);

        handle.remove().await.unwrap();
        assert!(!handle.exists().await.unwrap());
    }
}

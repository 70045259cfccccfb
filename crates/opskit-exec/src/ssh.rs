//! SSH command execution using russh crate
//!
//! Every call opens its own session with a single channel and closes both
//! before returning, whatever the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::{PrivateKeyWithHashAlg, check_known_hosts_path, ssh_key};
use russh::{Channel, ChannelMsg, Disconnect, client};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::command::CommandSpec;
use crate::error::ExecError;
use crate::keys::{Credentials, ResolvedSecret};
use crate::result::{CommandOutput, HostKeyPolicy, RemoteTarget, SIGNAL_RETURN_CODE};
use crate::traits::RemoteExecutor;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    /// Set when the server key is refused, so the caller can tell a key
    /// rejection apart from other handshake failures
    rejected: Arc<AtomicBool>,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let HostKeyPolicy::KnownHosts(path) = &self.policy else {
            return Ok(true);
        };

        match check_known_hosts_path(&self.host, self.port, server_public_key, path) {
            Ok(true) => {
                debug!(host = %self.host, port = self.port, "host key verified");
                Ok(true)
            }
            Ok(false) => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    known_hosts = %path.display(),
                    "host key not present in known_hosts"
                );
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
            Err(e) => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    error = %e,
                    "host key verification failed"
                );
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

/// One authenticated connection, used for a single channel
struct SshSession {
    handle: client::Handle<SshClientHandler>,
    host: String,
}

impl SshSession {
    async fn exec(&self, line: &str) -> Result<CommandOutput, ExecError> {
        let start = Instant::now();
        let mut channel = self.open_channel().await?;

        let collected = match channel.exec(true, line).await {
            Ok(()) => collect_output(&mut channel, &self.host).await,
            Err(e) => Err(self.transport_error(e)),
        };
        close_channel(&channel, &self.host).await;

        let (return_code, stdout, stderr) = collected?;
        Ok(CommandOutput {
            return_code,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    async fn shell(&self, input: &[u8]) -> Result<CommandOutput, ExecError> {
        let start = Instant::now();
        let mut channel = self.open_channel().await?;

        let collected = async {
            channel
                .request_shell(true)
                .await
                .map_err(|e| self.transport_error(e))?;
            channel
                .data(input)
                .await
                .map_err(|e| self.transport_error(e))?;
            channel.eof().await.map_err(|e| self.transport_error(e))?;
            collect_output(&mut channel, &self.host).await
        }
        .await;
        close_channel(&channel, &self.host).await;

        let (return_code, stdout, stderr) = collected?;
        Ok(CommandOutput {
            return_code,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    async fn open_channel(&self) -> Result<Channel<client::Msg>, ExecError> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: russh::Error) -> ExecError {
        ExecError::Transport {
            host: self.host.clone(),
            reason: e.to_string(),
        }
    }

    async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(host = %self.host, error = %e, "disconnect failed");
        }
        debug!(host = %self.host, "SSH session closed");
    }
}

/// Output and exit state gathered from one channel
#[derive(Debug, Default)]
struct OutputCollector {
    status: Option<i32>,
    signal: Option<String>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl OutputCollector {
    /// Record one message; false once the channel is closed
    fn accept(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                self.stdout.extend_from_slice(&data);
            }
            ChannelMsg::ExtendedData { data, ext } => {
                if ext == 1 {
                    // stderr
                    self.stderr.extend_from_slice(&data);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.status = Some(exit_status.cast_signed());
            }
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                ..
            } => {
                debug!(signal = ?signal_name, core_dumped, error = %error_message, "remote process killed");
                self.signal = Some(format!("{signal_name:?}"));
            }
            ChannelMsg::Close => return false,
            _ => {}
        }
        true
    }

    /// An explicit exit status wins over a signal
    fn finish(self, host: &str) -> Result<(i32, Vec<u8>, Vec<u8>), ExecError> {
        let code = match (self.status, self.signal) {
            (Some(code), _) => code,
            (None, Some(_)) => SIGNAL_RETURN_CODE,
            (None, None) => {
                return Err(ExecError::Transport {
                    host: host.to_string(),
                    reason: "channel closed without exit status".to_string(),
                });
            }
        };
        Ok((code, self.stdout, self.stderr))
    }
}

/// Read channel messages until the remote side closes the channel
///
/// Data is appended in arrival order. A channel that closes with neither an
/// exit status nor an exit signal is a transport error.
async fn collect_output(
    channel: &mut Channel<client::Msg>,
    host: &str,
) -> Result<(i32, Vec<u8>, Vec<u8>), ExecError> {
    let mut collector = OutputCollector::default();
    while let Some(msg) = channel.wait().await {
        if !collector.accept(msg) {
            break;
        }
    }
    collector.finish(host)
}

async fn close_channel(channel: &Channel<client::Msg>, host: &str) {
    // the server usually closed it already
    if let Err(e) = channel.close().await {
        debug!(host = %host, error = %e, "channel close after remote close");
    }
}

/// SSH command executor
///
/// Holds the target and credentials only; sessions are opened per call and
/// never shared between callers.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    /// Connection configuration
    target: RemoteTarget,
}

impl SshExecutor {
    /// Create a new SSH executor
    ///
    /// # Errors
    /// Returns `ExecError::Credentials` if the host or username is blank
    pub fn new(target: RemoteTarget) -> Result<Self, ExecError> {
        if target.host.trim().is_empty() {
            return Err(ExecError::Credentials("host is empty".to_string()));
        }
        target.credentials.validate()?;

        Ok(Self { target })
    }

    /// Get connection target
    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Dial and authenticate, bounded by the handshake timeout
    #[instrument(skip(self), fields(host = %self.target.host, port = self.target.port))]
    async fn connect(&self) -> Result<SshSession, ExecError> {
        // resolve before dialing so bad key material never reaches the network
        let secret = self.target.credentials.resolve()?;
        let handshake_timeout = self.target.handshake_timeout;

        match timeout(handshake_timeout, self.handshake(secret)).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::ConnectionFailed {
                host: self.target.host.clone(),
                reason: format!("handshake timed out after {handshake_timeout:?}"),
            }),
        }
    }

    async fn handshake(&self, secret: ResolvedSecret) -> Result<SshSession, ExecError> {
        let host = &self.target.host;
        let Credentials { username, .. } = &self.target.credentials;

        info!(
            host = %host,
            port = self.target.port,
            user = %username,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let rejected = Arc::new(AtomicBool::new(false));
        let handler = SshClientHandler {
            host: host.clone(),
            port: self.target.port,
            policy: self.target.host_key_policy.clone(),
            rejected: Arc::clone(&rejected),
        };

        let mut handle = client::connect(config, (host.as_str(), self.target.port), handler)
            .await
            .map_err(|e| {
                if rejected.load(Ordering::SeqCst) {
                    ExecError::HostKeyRejected { host: host.clone() }
                } else {
                    ExecError::ConnectionFailed {
                        host: host.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let auth_res = match secret {
            ResolvedSecret::Password(password) => {
                handle.authenticate_password(username, password).await
            }
            ResolvedSecret::Key(key) => {
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                handle
                    .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key, hash_alg))
                    .await
            }
        }
        .map_err(|e| ExecError::Transport {
            host: host.clone(),
            reason: e.to_string(),
        })?;

        let session = SshSession {
            handle,
            host: host.clone(),
        };

        if !auth_res.success() {
            session.close().await;
            return Err(ExecError::AuthenticationFailed {
                host: host.clone(),
                reason: format!("credentials for {username} rejected"),
            });
        }

        info!(host = %host, "SSH connected and authenticated");
        Ok(session)
    }

    /// Open a session, authenticate, and disconnect again
    ///
    /// # Errors
    /// Same as [`RemoteExecutor::run`] minus any channel failures
    #[instrument(skip(self), fields(host = %self.target.host))]
    pub async fn check_connection(&self) -> Result<(), ExecError> {
        let session = self.connect().await?;
        session.close().await;
        Ok(())
    }

    /// Request an interactive shell, feed it `input`, then signal EOF
    ///
    /// # Errors
    /// Returns transport errors; the shell's exit status is reported through
    /// `return_code`
    #[instrument(skip(self, input), fields(host = %self.target.host))]
    pub async fn run_shell(&self, input: &[u8]) -> Result<CommandOutput, ExecError> {
        let session = self.connect().await?;
        let result = session.shell(input).await;
        session.close().await;
        result
    }

    async fn execute_remote(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let line = spec.to_shell_line();
        debug!(command = %line, "executing remote command");

        let session = self.connect().await?;
        let result = session.exec(&line).await;
        session.close().await;

        if let Ok(output) = &result {
            debug!(
                command = %line,
                return_code = output.return_code,
                duration = ?output.duration,
                "remote command completed"
            );
        }
        result
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self, spec), fields(host = %self.target.host, command = %spec))]
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.execute_remote(spec).await
    }

    #[instrument(skip(self, spec), fields(host = %self.target.host, command = %spec))]
    async fn run_with_timeout(
        &self,
        spec: &CommandSpec,
        timeout_duration: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let start = Instant::now();

        debug!(timeout = ?timeout_duration, "executing with timeout");

        match timeout(timeout_duration, self.execute_remote(spec)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
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
        format!(
            "{}@{}",
            self.target.credentials.username,
            self.target.address()
        )
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}

/// Builder for `SshExecutor`
pub struct SshExecutorBuilder {
    target: RemoteTarget,
}

impl SshExecutorBuilder {
    /// Create builder with required fields
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            target: RemoteTarget::new(host, credentials),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.target.port = port;
        self
    }

    /// Verify server keys against a known_hosts file
    #[must_use]
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.target.host_key_policy = policy;
        self
    }

    /// Bound dial plus authentication
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.target.handshake_timeout = timeout;
        self
    }

    /// Build the executor
    ///
    /// # Errors
    /// Returns `ExecError::Credentials` if the target is incomplete
    pub fn build(self) -> Result<SshExecutor, ExecError> {
        SshExecutor::new(self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn creds() -> Credentials {
        Credentials::password("ops", "secret")
    }

    #[test]
    fn test_blank_host_rejected() {
        let result = SshExecutorBuilder::new("  ", creds()).build();
        assert!(matches!(result, Err(ExecError::Credentials(_))));
    }

    #[test]
    fn test_description() {
        let executor = SshExecutorBuilder::new("db1", creds())
            .with_port(2200)
            .build()
            .unwrap();
        assert_eq!(executor.description(), "ops@db1:2200");
        assert_eq!(executor.executor_type(), "ssh");
    }

    fn exit_signal(signal_name: russh::Sig) -> ChannelMsg {
        ChannelMsg::ExitSignal {
            signal_name,
            core_dumped: false,
            error_message: String::new(),
            lang_tag: String::new(),
        }
    }

    #[test]
    fn test_exit_signal_maps_to_signal_return_code() {
        let mut collector = OutputCollector::default();
        assert!(collector.accept(exit_signal(russh::Sig::KILL)));
        assert!(collector.accept(ChannelMsg::Eof));
        assert!(!collector.accept(ChannelMsg::Close));

        let (code, stdout, stderr) = collector.finish("db1").unwrap();
        assert_eq!(code, SIGNAL_RETURN_CODE);
        assert!(stdout.is_empty());
        assert!(stderr.is_empty());
    }

    #[test]
    fn test_exit_status_wins_over_signal() {
        let mut collector = OutputCollector::default();
        collector.accept(exit_signal(russh::Sig::TERM));
        collector.accept(ChannelMsg::ExitStatus { exit_status: 143 });

        let (code, _, _) = collector.finish("db1").unwrap();
        assert_eq!(code, 143);
    }

    #[test]
    fn test_close_without_exit_is_transport_error() {
        let mut collector = OutputCollector::default();
        assert!(!collector.accept(ChannelMsg::Close));

        let err = collector.finish("db1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_refused_connection_is_retryable_transport_error() {
        // bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let executor = SshExecutorBuilder::new("127.0.0.1", creds())
            .with_port(port)
            .build()
            .unwrap();
        let err = executor.check_connection().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_stalled_handshake_is_bounded() {
        // accepts TCP but never speaks SSH
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let executor = SshExecutorBuilder::new("127.0.0.1", creds())
            .with_port(port)
            .with_handshake_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        let start = Instant::now();
        let spec = CommandSpec::new(["true"]).unwrap();
        let err = executor.run(&spec).await.unwrap_err();

        assert!(matches!(err, ExecError::ConnectionFailed { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
        drop(listener);
    }
}

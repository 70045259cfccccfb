//! Result and target types for command execution

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::ExecError;
use crate::keys::Credentials;

/// Default timeout for dial plus authentication
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Return code for a process killed by a signal, on either backend
pub const SIGNAL_RETURN_CODE: i32 = -1;

/// Result of a command execution
///
/// A non-zero `return_code` is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// Exit status code (0 for success)
    pub return_code: i32,
    /// Raw stdout bytes
    pub stdout: Vec<u8>,
    /// Raw stderr bytes
    pub stderr: Vec<u8>,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandOutput {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    /// Stdout decoded as UTF-8, replacing invalid sequences
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded as UTF-8, replacing invalid sequences
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout_lossy()
        } else {
            format!("{}\n{}", self.stdout_lossy(), self.stderr_lossy())
        }
    }

    /// Treat a non-zero exit as an error
    ///
    /// # Errors
    /// Returns `ExecError::CommandFailed` when `return_code != 0`
    pub fn into_checked(self) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::CommandFailed {
                status: self.return_code,
                stderr: self.stderr_lossy().trim_end().to_string(),
            })
        }
    }
}

/// How the SSH client treats the server's host key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any server key (like `StrictHostKeyChecking=no`)
    #[default]
    AcceptAny,
    /// Only accept keys recorded in the given known_hosts file
    KnownHosts(PathBuf),
}

/// Connection information for SSH
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    /// Host address
    pub host: String,
    /// Port (default 22)
    pub port: u16,
    /// Login credentials
    pub credentials: Credentials,
    /// Server key verification
    pub host_key_policy: HostKeyPolicy,
    /// Bound on dial plus authentication
    pub handshake_timeout: Duration,
}

impl RemoteTarget {
    /// Create new target on port 22
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port: 22,
            credentials,
            host_key_policy: HostKeyPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set host key policy
    #[must_use]
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    /// Set handshake timeout
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// `host:port`, bracketing IPv6 literals
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

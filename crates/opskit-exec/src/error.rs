//! Error types for opskit-exec

use std::time::Duration;

use thiserror::Error;

/// Coarse classification of an [`ExecError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid command, credentials or key material; never retried
    Construction,
    /// Remote endpoint rejected the credentials; never retried
    Authentication,
    /// Dial, handshake or channel failure
    Transport,
    /// Local process could not be started or awaited
    Execution,
    /// A bounded operation ran out of time
    Timeout,
    /// Caller opted in to treating a non-zero exit as a failure
    CommandFailed,
}

/// Errors that can occur during command execution
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Command specification is invalid
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Credentials are missing or unusable
    #[error("invalid credentials: {0}")]
    Credentials(String),

    /// SSH key could not be resolved or parsed
    #[error("SSH key error: {0}")]
    SshKey(String),

    /// Remote endpoint rejected the credentials
    #[error("authentication failed for {host}: {reason}")]
    AuthenticationFailed {
        /// Target host
        host: String,
        /// Reason reported by the transport
        reason: String,
    },

    /// Failed to dial or negotiate with the remote host
    #[error("connection to {host} failed: {reason}")]
    ConnectionFailed {
        /// Target host
        host: String,
        /// Underlying failure
        reason: String,
    },

    /// Server key did not match the known-hosts policy
    #[error("host key for {host} rejected by known-hosts policy")]
    HostKeyRejected {
        /// Target host
        host: String,
    },

    /// Session or channel failed after the handshake
    #[error("transport error on {host}: {reason}")]
    Transport {
        /// Target host
        host: String,
        /// Underlying failure
        reason: String,
    },

    /// Local process could not be started
    #[error("failed to spawn {program}: {reason}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// OS error
        reason: String,
    },

    /// I/O error during execution
    #[error("I/O error: {0}")]
    Io(String),

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Command exited non-zero and the caller asked for that to be an error
    #[error("command exited with status {status}: {stderr}")]
    CommandFailed {
        /// Exit status code
        status: i32,
        /// Stderr output
        stderr: String,
    },
}

impl ExecError {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::InvalidCommand(_) | ExecError::Credentials(_) | ExecError::SshKey(_) => {
                ErrorKind::Construction
            }
            ExecError::AuthenticationFailed { .. } => ErrorKind::Authentication,
            ExecError::ConnectionFailed { .. }
            | ExecError::HostKeyRejected { .. }
            | ExecError::Transport { .. } => ErrorKind::Transport,
            ExecError::Spawn { .. } | ExecError::Io(_) => ErrorKind::Execution,
            ExecError::Timeout { .. } => ErrorKind::Timeout,
            ExecError::CommandFailed { .. } => ErrorKind::CommandFailed,
        }
    }

    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_is_not_retryable() {
        let err = ExecError::AuthenticationFailed {
            host: "db1".to_string(),
            reason: "password rejected".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_class_is_retryable() {
        let errors = [
            ExecError::ConnectionFailed {
                host: "db1".to_string(),
                reason: "connection refused".to_string(),
            },
            ExecError::HostKeyRejected {
                host: "db1".to_string(),
            },
            ExecError::Timeout {
                timeout: Duration::from_secs(2),
            },
        ];
        for err in errors {
            assert!(err.is_retryable(), "{err} should be retryable");
        }
    }

    #[test]
    fn test_construction_errors() {
        assert_eq!(
            ExecError::InvalidCommand("empty".into()).kind(),
            ErrorKind::Construction
        );
        assert_eq!(
            ExecError::SshKey("bad key".into()).kind(),
            ErrorKind::Construction
        );
        assert!(!ExecError::Credentials("missing".into()).is_retryable());
    }

    #[test]
    fn test_error_message_carries_host() {
        let err = ExecError::Transport {
            host: "web2".to_string(),
            reason: "channel closed without exit status".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "transport error on web2: channel closed without exit status"
        );
    }
}

//! Core error types for opskit-core

use std::time::Duration;

use opskit_exec::{ErrorKind, ExecError};
use thiserror::Error;

/// Errors from host construction, command dispatch and reachability waits
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Hostname or username is missing or blank
    #[error("invalid host identity: {0}")]
    InvalidIdentity(String),

    /// A remote host was built without credentials
    #[error("missing credentials for {0}")]
    MissingCredentials(String),

    /// Retry budget has a zero timeout or interval
    #[error("invalid retry budget: {0}")]
    InvalidBudget(String),

    /// Execution failed, wrapped with the host and operation
    #[error("{context} on {host} failed: {source}")]
    Exec {
        /// Host description
        host: String,
        /// Operation that was attempted
        context: String,
        /// Underlying failure, unchanged in kind
        #[source]
        source: ExecError,
    },

    /// Reachability budget exhausted
    #[error("timed out after {elapsed:?} waiting for {target} ({attempts} attempts)")]
    Timeout {
        /// Identity under test
        target: String,
        /// Time spent waiting
        elapsed: Duration,
        /// Probe invocations made
        attempts: u32,
    },

    /// Probe reported a condition that retrying cannot fix
    #[error("probe for {target} failed: {reason}")]
    ProbeFailed {
        /// Identity under test
        target: String,
        /// Probe failure
        reason: String,
    },

    /// Local file access failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Configuration is incomplete or inconsistent
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Wrap an execution error with host and operation context
    pub fn exec(host: impl Into<String>, context: impl Into<String>, source: ExecError) -> Self {
        CoreError::Exec {
            host: host.into(),
            context: context.into(),
            source,
        }
    }

    /// Kind of the wrapped execution error, if any
    #[must_use]
    pub fn exec_kind(&self) -> Option<ErrorKind> {
        match self {
            CoreError::Exec { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    /// Whether this error came from invalid input rather than the environment
    #[must_use]
    pub fn is_construction(&self) -> bool {
        match self {
            CoreError::InvalidIdentity(_)
            | CoreError::MissingCredentials(_)
            | CoreError::InvalidBudget(_)
            | CoreError::Config(_) => true,
            CoreError::Exec { source, .. } => source.kind() == ErrorKind::Construction,
            _ => false,
        }
    }
}

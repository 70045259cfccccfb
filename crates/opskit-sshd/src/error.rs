//! Error types for opskit-sshd

use thiserror::Error;

use crate::server::ServerState;

/// Errors from the test server lifecycle
#[derive(Error, Debug)]
pub enum ServerError {
    /// Listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// `start` called while not stopped
    #[error("server already running (state: {0:?})")]
    AlreadyRunning(ServerState),

    /// Host key could not be loaded
    #[error("host key error: {0}")]
    HostKey(String),
}

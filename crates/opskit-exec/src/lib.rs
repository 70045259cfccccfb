//! opskit-exec: Command execution abstraction
//!
//! Runs argv-style commands either on the local machine or on a remote
//! machine over SSH, and captures their output byte-for-byte.

pub mod command;
pub mod error;
pub mod executor;
pub mod keys;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use command::CommandSpec;
pub use error::{ErrorKind, ExecError};
pub use executor::CommandExecutor;
pub use keys::{Credentials, Secret};
pub use local::LocalExecutor;
pub use result::{CommandOutput, HostKeyPolicy, RemoteTarget, SIGNAL_RETURN_CODE};
pub use ssh::{SshExecutor, SshExecutorBuilder};
pub use traits::RemoteExecutor;

//! opskit-core: Hosts and reachability
//!
//! Binds a host identity to an execution backend, and waits for hosts to
//! become reachable within a bounded time budget.

pub mod config;
pub mod error;
pub mod host;
pub mod identity;
pub mod log;
pub mod probes;
pub mod reach;

pub use config::{HostConfig, WaitConfig};
pub use error::CoreError;
pub use host::{Host, HostBuilder, HostDirectory, InstallOptions};
pub use identity::HostIdentity;
pub use log::{LogLevel, LogSink, Logger, MemorySink, TracingSink};
pub use probes::{
    KnownHostRenewal, is_pingable, is_reachable_by_ssh, is_tcp_port_open, renew_known_host,
    wait_for_ping, wait_for_ssh, wait_for_tcp_port,
};
pub use reach::{ProbeError, RetryBudget, WaitReport, wait_until_ready, wait_until_ready_with_repair};

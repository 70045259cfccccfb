//! Readiness probes and the waits composed from them

use std::path::{Path, PathBuf};
use std::time::Duration;

use opskit_exec::{CommandSpec, ExecError, HostKeyPolicy, LocalExecutor, RemoteExecutor, SshExecutor};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::CoreError;
use crate::log::Logger;
use crate::reach::{ProbeError, RetryBudget, WaitReport, wait_until_ready, wait_until_ready_with_repair};

/// Upper bound for a single TCP connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether a TCP connection to `host:port` succeeds within `connect_timeout`
pub async fn is_tcp_port_open(host: &str, port: u16, connect_timeout: Duration) -> bool {
    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(host = %host, port = port, error = %e, "TCP probe failed");
            false
        }
        Err(_) => {
            debug!(host = %host, port = port, "TCP probe timed out");
            false
        }
    }
}

/// Send one ICMP echo request using the system `ping`
///
/// An unanswered ping is `Ok(false)`.
///
/// # Errors
/// Returns `ExecError::Spawn` if `ping` cannot be started
pub async fn is_pingable(host: &str) -> Result<bool, ExecError> {
    let spec = CommandSpec::new(["ping", "-c", "1", "-W", "1", host])?;
    let output = LocalExecutor::new().run(&spec).await?;
    Ok(output.success())
}

/// Complete an SSH handshake and authentication, then disconnect
///
/// # Errors
/// Transport failures are [`ProbeError::Retryable`]; rejected credentials
/// and bad key material are [`ProbeError::Fatal`]
pub async fn is_reachable_by_ssh(executor: &SshExecutor) -> Result<bool, ProbeError> {
    executor
        .check_connection()
        .await
        .map(|()| true)
        .map_err(ProbeError::from)
}

/// Where to refresh a host's cached key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostRenewal {
    /// known_hosts file to rewrite
    pub known_hosts: PathBuf,
}

impl KnownHostRenewal {
    pub fn new(known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            known_hosts: known_hosts.into(),
        }
    }

    /// `~/.ssh/known_hosts`
    ///
    /// # Errors
    /// Returns `CoreError::Config` if the home directory is unknown
    pub fn user_default() -> Result<Self, CoreError> {
        dirs::home_dir()
            .map(|home| Self::new(home.join(".ssh").join("known_hosts")))
            .ok_or_else(|| CoreError::Config("cannot locate home directory".to_string()))
    }

    /// The file a client with `policy` verifies against
    ///
    /// # Errors
    /// Same as [`KnownHostRenewal::user_default`]
    pub fn for_policy(policy: &HostKeyPolicy) -> Result<Self, CoreError> {
        match policy {
            HostKeyPolicy::KnownHosts(path) => Ok(Self::new(path.clone())),
            HostKeyPolicy::AcceptAny => Self::user_default(),
        }
    }
}

fn known_hosts_label(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_string()
    } else {
        format!("[{hostname}]:{port}")
    }
}

/// Drop the cached key for `hostname:port` and record the one it presents now
///
/// Runs `ssh-keygen -R` followed by `ssh-keyscan` on the local machine.
///
/// # Errors
/// Fails if either tool fails or the scan yields no keys
pub async fn renew_known_host(
    hostname: &str,
    port: u16,
    known_hosts: &Path,
    logger: &Logger,
) -> Result<(), ExecError> {
    let local = LocalExecutor::new();
    let label = known_hosts_label(hostname, port);
    let path = known_hosts.to_string_lossy().into_owned();

    if known_hosts.exists() {
        let remove = CommandSpec::new(["ssh-keygen", "-f", path.as_str(), "-R", label.as_str()])?;
        local.run(&remove).await?.into_checked()?;
        logger.debug(format!("removed cached key for {label} from {path}"));
    }

    let port_arg = port.to_string();
    let scan = CommandSpec::new(["ssh-keyscan", "-T", "2", "-p", port_arg.as_str(), hostname])?;
    let scanned = local.run(&scan).await?.into_checked()?;

    let keys: String = scanned
        .stdout_lossy()
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .map(|line| format!("{line}\n"))
        .collect();
    if keys.is_empty() {
        return Err(ExecError::Transport {
            host: hostname.to_string(),
            reason: "ssh-keyscan returned no keys".to_string(),
        });
    }

    if let Some(parent) = known_hosts.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecError::Io(format!("{}: {e}", parent.display())))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(known_hosts)
        .await
        .map_err(|e| ExecError::Io(format!("{path}: {e}")))?;
    file.write_all(keys.as_bytes())
        .await
        .map_err(|e| ExecError::Io(format!("{path}: {e}")))?;

    logger.changed(format!("renewed known-host key for {label} in {path}"));
    Ok(())
}

fn connect_timeout_for(budget: &RetryBudget) -> Duration {
    DEFAULT_CONNECT_TIMEOUT.min(budget.timeout())
}

/// Wait until `host:port` accepts TCP connections
///
/// # Errors
/// `CoreError::Timeout` if the port stays closed for the whole budget
pub async fn wait_for_tcp_port(
    host: &str,
    port: u16,
    budget: &RetryBudget,
    logger: &Logger,
) -> Result<WaitReport, CoreError> {
    let target = format!("{host}:{port}");
    let connect_timeout = connect_timeout_for(budget);

    wait_until_ready(&target, budget, logger, move || async move {
        Ok(is_tcp_port_open(host, port, connect_timeout).await)
    })
    .await
}

/// Wait until `host` answers ICMP echo
///
/// # Errors
/// `CoreError::Timeout` if it never answers; `CoreError::ProbeFailed` if
/// `ping` cannot be run at all
pub async fn wait_for_ping(
    host: &str,
    budget: &RetryBudget,
    logger: &Logger,
) -> Result<WaitReport, CoreError> {
    wait_until_ready(host, budget, logger, move || async move {
        is_pingable(host).await.map_err(ProbeError::from)
    })
    .await
}

/// Wait until an SSH login to the executor's target succeeds
///
/// The handshake is only attempted once the TCP port is open. With
/// `renewal`, the cached host key is refreshed before each attempt.
///
/// # Errors
/// `CoreError::Timeout` if the budget runs out; `CoreError::ProbeFailed` on
/// rejected credentials
pub async fn wait_for_ssh(
    executor: &SshExecutor,
    budget: &RetryBudget,
    logger: &Logger,
    renewal: Option<&KnownHostRenewal>,
) -> Result<WaitReport, CoreError> {
    let remote = executor.target();
    let host = remote.host.as_str();
    let port = remote.port;
    let target = executor.description();
    let connect_timeout = connect_timeout_for(budget);

    let probe = move || async move {
        if !is_tcp_port_open(host, port, connect_timeout).await {
            return Ok(false);
        }
        is_reachable_by_ssh(executor).await
    };

    let repair = move || async move {
        let Some(renewal) = renewal else {
            return Ok(());
        };
        // nothing to scan until sshd is up
        if !is_tcp_port_open(host, port, connect_timeout).await {
            return Ok(());
        }
        renew_known_host(host, port, &renewal.known_hosts, logger).await
    };

    wait_until_ready_with_repair(&target, budget, logger, probe, repair).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use opskit_exec::Credentials;
    use tokio::net::TcpListener;

    fn budget(timeout_ms: u64, interval_ms: u64) -> RetryBudget {
        RetryBudget::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_port_open_then_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_tcp_port_open("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT).await);

        drop(listener);
        assert!(!is_tcp_port_open("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_wait_for_tcp_port_sees_late_listener() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let opener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });

        let report = wait_for_tcp_port("127.0.0.1", port, &budget(3_000, 25), &Logger::default())
            .await
            .unwrap();
        assert!(report.attempts > 1);

        opener.abort();
    }

    #[tokio::test]
    async fn test_wait_for_closed_port_times_out() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let result =
            wait_for_tcp_port("127.0.0.1", port, &budget(150, 20), &Logger::default()).await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_ssh_on_closed_port_times_out() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let executor = opskit_exec::SshExecutorBuilder::new(
            "127.0.0.1",
            Credentials::password("user", "pass"),
        )
        .with_port(port)
        .build()
        .unwrap();

        let result = wait_for_ssh(&executor, &budget(200, 20), &Logger::default(), None).await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
    }

    #[test]
    fn test_known_hosts_label() {
        assert_eq!(known_hosts_label("web1", 22), "web1");
        assert_eq!(known_hosts_label("web1", 2222), "[web1]:2222");
    }

    #[test]
    fn test_renewal_follows_policy() {
        let policy = HostKeyPolicy::KnownHosts(PathBuf::from("/tmp/opskit_known_hosts"));
        let renewal = KnownHostRenewal::for_policy(&policy).unwrap();
        assert_eq!(renewal.known_hosts, PathBuf::from("/tmp/opskit_known_hosts"));
    }
}

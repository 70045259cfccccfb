//! Configuration types for hosts and reachability waits

use std::path::PathBuf;
use std::time::Duration;

use opskit_exec::{Credentials, HostKeyPolicy};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::identity::HostIdentity;
use crate::reach::RetryBudget;

/// Configuration for a single host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Name used in logs and on the command line
    pub name: String,
    /// IP address or hostname; `localhost` runs commands locally
    pub addr: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// SSH user (defaults to root)
    #[serde(default = "default_user")]
    pub user: String,
    /// Path to SSH private key
    pub ssh_key: Option<PathBuf>,
    /// Environment variable holding the SSH password
    pub password_env: Option<String>,
    /// known_hosts file to verify the server key against
    pub known_hosts: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

impl HostConfig {
    /// Identity for `user@addr`
    ///
    /// # Errors
    /// Returns `CoreError::InvalidIdentity` for a blank address or user
    pub fn identity(&self) -> Result<HostIdentity, CoreError> {
        let identity = HostIdentity::new(&self.addr)?;
        if identity.is_localhost() {
            return Ok(identity);
        }
        identity.with_username(&self.user)
    }

    /// Credentials for SSH, if any are configured
    ///
    /// A key file wins over a password.
    ///
    /// # Errors
    /// Returns `CoreError::Config` if `password_env` names an unset variable
    pub fn credentials(&self) -> Result<Option<Credentials>, CoreError> {
        if let Some(key) = &self.ssh_key {
            return Ok(Some(Credentials::key_file(&self.user, key.clone())));
        }
        match &self.password_env {
            Some(var) => {
                let password = std::env::var(var).map_err(|_| {
                    CoreError::Config(format!("{}: environment variable {var} is not set", self.name))
                })?;
                Ok(Some(Credentials::password(&self.user, password)))
            }
            None => Ok(None),
        }
    }

    #[must_use]
    pub fn host_key_policy(&self) -> HostKeyPolicy {
        match &self.known_hosts {
            Some(path) => HostKeyPolicy::KnownHosts(path.clone()),
            None => HostKeyPolicy::AcceptAny,
        }
    }
}

/// Timing for reachability waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Total time to wait
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Pause between probe attempts
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl WaitConfig {
    /// # Errors
    /// Returns `CoreError::InvalidBudget` if either value is zero
    pub fn budget(&self) -> Result<RetryBudget, CoreError> {
        RetryBudget::new(
            Duration::from_secs(self.timeout_secs),
            Duration::from_millis(self.poll_interval_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opskit_exec::Secret;

    fn parse(text: &str) -> HostConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(
            r#"
            name = "web1"
            addr = "10.0.0.5"
            "#,
        );
        assert_eq!(config.port, 22);
        assert_eq!(config.user, "root");
        assert_eq!(config.identity().unwrap().to_string(), "root@10.0.0.5");
        assert!(config.credentials().unwrap().is_none());
        assert_eq!(config.host_key_policy(), HostKeyPolicy::AcceptAny);
    }

    #[test]
    fn test_localhost_identity_has_no_user() {
        let config = parse(
            r#"
            name = "self"
            addr = "localhost"
            "#,
        );
        let identity = config.identity().unwrap();
        assert!(identity.is_localhost());
        assert!(identity.username().is_none());
    }

    #[test]
    fn test_key_file_wins_over_password() {
        let config = parse(
            r#"
            name = "db1"
            addr = "db1.internal"
            user = "deploy"
            port = 2200
            ssh_key = "/home/deploy/.ssh/id_ed25519"
            password_env = "OPSKIT_TEST_UNUSED"
            known_hosts = "/etc/opskit/known_hosts"
            "#,
        );

        let credentials = config.credentials().unwrap().unwrap();
        assert_eq!(credentials.username, "deploy");
        assert!(matches!(credentials.secret, Secret::KeyFile(_)));
        assert_eq!(
            config.host_key_policy(),
            HostKeyPolicy::KnownHosts(PathBuf::from("/etc/opskit/known_hosts"))
        );
    }

    #[test]
    fn test_missing_password_env() {
        let config = parse(
            r#"
            name = "db2"
            addr = "db2.internal"
            password_env = "OPSKIT_TEST_SURELY_UNSET_VARIABLE"
            "#,
        );
        assert!(matches!(config.credentials(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_wait_config_budget() {
        let wait: WaitConfig = toml::from_str("timeout_secs = 5").unwrap();
        assert_eq!(wait.poll_interval_ms, 1000);

        let budget = wait.budget().unwrap();
        assert_eq!(budget.timeout(), Duration::from_secs(5));
        assert_eq!(budget.poll_interval(), Duration::from_secs(1));

        let zero = WaitConfig {
            timeout_secs: 0,
            poll_interval_ms: 10,
        };
        assert!(matches!(zero.budget(), Err(CoreError::InvalidBudget(_))));
    }
}

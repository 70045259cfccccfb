//! Host identity

use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Hostname plus optional login name, validated at construction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostIdentity {
    hostname: String,
    username: Option<String>,
}

impl HostIdentity {
    /// Hostname that selects the local backend
    pub const LOCALHOST: &'static str = "localhost";

    /// Create an identity from a hostname
    ///
    /// # Errors
    /// Returns `CoreError::InvalidIdentity` if the trimmed hostname is empty
    pub fn new(hostname: &str) -> Result<Self, CoreError> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(CoreError::InvalidIdentity("hostname is empty".to_string()));
        }

        Ok(Self {
            hostname: hostname.to_string(),
            username: None,
        })
    }

    /// The local machine
    #[must_use]
    pub fn localhost() -> Self {
        Self {
            hostname: Self::LOCALHOST.to_string(),
            username: None,
        }
    }

    /// Set the remote login name
    ///
    /// # Errors
    /// Returns `CoreError::InvalidIdentity` if the trimmed username is empty
    pub fn with_username(mut self, username: &str) -> Result<Self, CoreError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(CoreError::InvalidIdentity(format!(
                "empty username for {}",
                self.hostname
            )));
        }
        self.username = Some(username.to_string());
        Ok(self)
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Whether this identity names the local machine
    #[must_use]
    pub fn is_localhost(&self) -> bool {
        self.hostname == Self::LOCALHOST
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{user}@{}", self.hostname),
            None => f.write_str(&self.hostname),
        }
    }
}

impl FromStr for HostIdentity {
    type Err = CoreError;

    /// Parse `host` or `user@host`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('@') {
            Some((user, host)) => Self::new(host)?.with_username(user),
            None => Self::new(s),
        }
    }
}

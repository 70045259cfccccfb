//! Credentials and SSH key resolution
//!
//! Key material is decoded in memory for the lifetime of one session and is
//! never written back to disk.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use tracing::debug;

use crate::error::ExecError;

/// Secret half of a set of credentials
#[derive(Clone)]
pub enum Secret {
    /// Plain password
    Password(String),
    /// Path to an OpenSSH private key file (must be mode 600)
    KeyFile(PathBuf),
    /// Name of an environment variable holding a base64-encoded private key
    KeyEnv(String),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => f.write_str("Password(<redacted>)"),
            Secret::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Secret::KeyEnv(var) => f.debug_tuple("KeyEnv").field(var).finish(),
        }
    }
}

/// Username plus secret, supplied by the caller
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Login name
    pub username: String,
    /// Password or key material
    pub secret: Secret,
}

impl Credentials {
    /// Password credentials
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::Password(password.into()),
        }
    }

    /// Key file credentials
    pub fn key_file(username: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::KeyFile(path.into()),
        }
    }

    /// Credentials with a base64 key taken from an environment variable
    pub fn key_env(username: impl Into<String>, var_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::KeyEnv(var_name.into()),
        }
    }

    /// Replace the username, keeping the secret
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Check the credentials are usable without touching the network
    ///
    /// # Errors
    /// Returns `ExecError::Credentials` if the username is blank
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.username.trim().is_empty() {
            return Err(ExecError::Credentials("username is empty".to_string()));
        }
        Ok(())
    }

    /// Resolve the secret into something the SSH client can authenticate with
    ///
    /// # Errors
    /// Returns `KeyError` if key resolution fails (env not set, invalid base64, etc.)
    pub fn resolve(&self) -> Result<ResolvedSecret, KeyError> {
        match &self.secret {
            Secret::Password(password) => Ok(ResolvedSecret::Password(password.clone())),
            Secret::KeyFile(path) => {
                validate_key_permissions(path)?;
                let key = load_secret_key(path, None)
                    .map_err(|e| KeyError::Parse(format!("{}: {e}", path.display())))?;
                debug!(path = %path.display(), "loaded SSH key from file");
                Ok(ResolvedSecret::Key(Arc::new(key)))
            }
            Secret::KeyEnv(var_name) => {
                let encoded =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key = decode_base64_key(&encoded)?;
                debug!(var = %var_name, "decoded SSH key from environment");
                Ok(ResolvedSecret::Key(Arc::new(key)))
            }
        }
    }
}

/// Secret ready for authentication
pub enum ResolvedSecret {
    /// Password authentication
    Password(String),
    /// Public key authentication
    Key(Arc<PrivateKey>),
}

impl fmt::Debug for ResolvedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedSecret::Password(_) => f.write_str("Password(<redacted>)"),
            ResolvedSecret::Key(_) => f.write_str("Key(<redacted>)"),
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key is not valid OpenSSH text")]
    NotText,

    #[error("failed to parse key: {0}")]
    Parse(String),

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<KeyError> for ExecError {
    fn from(e: KeyError) -> Self {
        ExecError::SshKey(e.to_string())
    }
}

fn decode_base64_key(input: &str) -> Result<PrivateKey, KeyError> {
    use base64::Engine;

    let raw = base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .map_err(|_| KeyError::InvalidBase64)?;
    let text = String::from_utf8(raw).map_err(|_| KeyError::NotText)?;
    decode_secret_key(&text, None).map_err(|e| KeyError::Parse(e.to_string()))
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)?;
    let mode = metadata.permissions().mode();

    // group and other must have no access
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::password("deploy", "hunter2");
        let printed = format!("{creds:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("deploy"));
    }

    #[test]
    fn test_validate_rejects_blank_username() {
        let creds = Credentials::password("  ", "pw");
        assert!(matches!(creds.validate(), Err(ExecError::Credentials(_))));
        assert!(Credentials::password("ops", "pw").validate().is_ok());
    }

    #[test]
    fn test_resolve_password() {
        let creds = Credentials::password("ops", "pw");
        assert!(matches!(
            creds.resolve().unwrap(),
            ResolvedSecret::Password(p) if p == "pw"
        ));
    }

    #[test]
    fn test_key_file_with_open_permissions_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not really a key").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let creds = Credentials::key_file("ops", file.path());
        assert!(matches!(creds.resolve(), Err(KeyError::BadPermissions(_))));
    }

    #[test]
    fn test_key_file_with_garbage_content_fails_to_parse() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not really a key").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();

        let creds = Credentials::key_file("ops", file.path());
        assert!(matches!(creds.resolve(), Err(KeyError::Parse(_))));
    }

    #[test]
    fn test_missing_env_var() {
        let creds = Credentials::key_env("ops", "OPSKIT_TEST_KEY_THAT_IS_NEVER_SET");
        assert!(matches!(creds.resolve(), Err(KeyError::EnvNotSet(_))));
    }

    #[test]
    fn test_invalid_base64() {
        assert!(matches!(
            decode_base64_key("!!not base64!!"),
            Err(KeyError::InvalidBase64)
        ));
    }

    #[test]
    fn test_key_error_maps_to_construction() {
        let err: ExecError = KeyError::InvalidBase64.into();
        assert_eq!(err.kind(), crate::error::ErrorKind::Construction);
    }
}

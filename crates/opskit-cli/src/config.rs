//! Configuration loading

use std::path::{Path, PathBuf};

use eyre::WrapErr;
use opskit_core::{HostConfig, WaitConfig};
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "OPSKIT_CONFIG";

/// Top-level configuration for the opskit CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default timing for `opskit wait`
    #[serde(default)]
    pub wait: WaitConfig,
    /// Named hosts
    #[serde(default)]
    pub host: Vec<HostConfig>,
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).wrap_err_with(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Load from an explicit path, then the default locations, then defaults
    ///
    /// # Errors
    /// Returns error if a config file is found but cannot be loaded
    pub fn load_default(explicit: Option<&Path>) -> eyre::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }

        for path in default_paths() {
            if path.exists() {
                tracing::debug!(path = %path.display(), "using config file");
                return Self::load(&path);
            }
        }

        tracing::warn!("no config file found, using defaults");
        Ok(Config::default())
    }

    /// Host entry named `name`
    #[must_use]
    pub fn find_host(&self, name: &str) -> Option<&HostConfig> {
        self.host.iter().find(|h| h.name == name)
    }

    /// Host entry for `target`: a configured name, `user@addr`, or a bare address
    #[must_use]
    pub fn host_for(&self, target: &str) -> HostConfig {
        if let Some(host) = self.find_host(target) {
            return host.clone();
        }

        let (user, addr) = match target.rsplit_once('@') {
            Some((user, addr)) => (user.to_string(), addr),
            None => ("root".to_string(), target),
        };
        HostConfig {
            name: target.to_string(),
            addr: addr.to_string(),
            port: 22,
            user,
            ssh_key: None,
            password_env: None,
            known_hosts: None,
        }
    }
}

fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("opskit.toml"),
        PathBuf::from("/etc/opskit/opskit.toml"),
    ];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("opskit").join("opskit.toml"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[wait]
timeout_secs = 120

[[host]]
name = "web1"
addr = "10.0.0.5"
user = "deploy"
password_env = "WEB1_PASSWORD"

[[host]]
name = "self"
addr = "localhost"
"#;

    fn sample_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_explicit_path() {
        let file = sample_file();
        let config = Config::load_default(Some(file.path())).unwrap();

        assert_eq!(config.wait.timeout_secs, 120);
        assert_eq!(config.wait.poll_interval_ms, 1000);
        assert_eq!(config.host.len(), 2);
        assert_eq!(config.find_host("web1").unwrap().user, "deploy");
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("absent.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[[host]]\nname = 5\n").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parsing"));
    }

    #[test]
    fn test_host_for_prefers_configured_name() {
        let config = Config::load(sample_file().path()).unwrap();

        let web1 = config.host_for("web1");
        assert_eq!(web1.addr, "10.0.0.5");
        assert_eq!(web1.password_env.as_deref(), Some("WEB1_PASSWORD"));

        let adhoc = config.host_for("ops@db1.internal");
        assert_eq!(adhoc.addr, "db1.internal");
        assert_eq!(adhoc.user, "ops");

        let bare = config.host_for("db2");
        assert_eq!(bare.addr, "db2");
        assert_eq!(bare.user, "root");
        assert_eq!(bare.port, 22);
    }
}

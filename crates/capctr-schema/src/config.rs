use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ADDRESS: &str = "/run/containerd/containerd.sock";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_DATA_ROOT: &str = "/var/lib/nerdctl";
pub const DEFAULT_INSPECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read driver config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse driver config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("namespace must not be empty")]
    EmptyNamespace,
    #[error("address must not be empty")]
    EmptyAddress,
    #[error("inspect_timeout_secs must be greater than zero")]
    ZeroInspectTimeout,
}

/// Settings shared by every operation of one driver instance.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Explicit log data store; derived from `data_root` and `address` when unset.
    #[serde(default)]
    pub data_store: Option<PathBuf>,
    #[serde(default = "default_inspect_timeout_secs")]
    pub inspect_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            namespace: default_namespace(),
            data_root: default_data_root(),
            data_store: None,
            inspect_timeout_secs: default_inspect_timeout_secs(),
        }
    }
}

impl DriverConfig {
    #[must_use]
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        namespace.clone_into(&mut self.namespace);
        self
    }

    #[must_use]
    pub fn with_data_store(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_store = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if self.inspect_timeout_secs == 0 {
            return Err(ConfigError::ZeroInspectTimeout);
        }
        Ok(())
    }

    /// Directory holding per-container log files.
    ///
    /// Without an explicit override this is `<data_root>/<hash>`, where `<hash>`
    /// is the first 8 hex characters of the SHA-256 of the engine address. The
    /// engine's own CLI lays out its data store the same way, so the default
    /// address yields `/var/lib/nerdctl/1935db59`.
    pub fn data_store_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_store {
            return dir.clone();
        }
        let digest = Sha256::digest(self.address.as_bytes());
        let short = hex::encode(digest);
        self.data_root.join(&short[..8])
    }

    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.inspect_timeout_secs)
    }
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_owned()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_owned()
}

fn default_data_root() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_ROOT)
}

fn default_inspect_timeout_secs() -> u64 {
    DEFAULT_INSPECT_TIMEOUT_SECS
}

pub fn parse_config_str(input: &str) -> Result<DriverConfig, ConfigError> {
    let config: DriverConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<DriverConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let input = r#"
address = "/run/k3s/containerd/containerd.sock"
namespace = "capi"
data_root = "/srv/nerdctl"
data_store = "/srv/logs"
inspect_timeout_secs = 10
"#;
        let config = parse_config_str(input).expect("should parse");
        assert_eq!(config.address, "/run/k3s/containerd/containerd.sock");
        assert_eq!(config.namespace, "capi");
        assert_eq!(config.data_store_dir(), PathBuf::from("/srv/logs"));
        assert_eq!(config.inspect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn parses_empty_config_with_defaults() {
        let config = parse_config_str("").expect("should parse");
        assert_eq!(config, DriverConfig::default());
        assert_eq!(config.namespace, "default");
        assert_eq!(config.inspect_timeout_secs, 5);
    }

    #[test]
    fn default_data_store_derives_from_address() {
        let config = DriverConfig::default();
        assert_eq!(
            config.data_store_dir(),
            PathBuf::from("/var/lib/nerdctl/1935db59")
        );
    }

    #[test]
    fn data_store_changes_with_address() {
        let a = DriverConfig::default();
        let b = DriverConfig {
            address: "/tmp/other.sock".to_owned(),
            ..DriverConfig::default()
        };
        assert_ne!(a.data_store_dir(), b.data_store_dir());
        assert!(b.data_store_dir().starts_with("/var/lib/nerdctl"));
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(parse_config_str("socket = \"/tmp/x\"\n").is_err());
    }

    #[test]
    fn rejects_empty_namespace() {
        let err = parse_config_str("namespace = \"  \"\n").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyNamespace));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = parse_config_str("inspect_timeout_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ZeroInspectTimeout));
    }

    #[test]
    fn parses_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capctr.toml");
        fs::write(&path, "namespace = \"k8s.io\"\n").unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(config.namespace, "k8s.io");
    }

    #[test]
    fn builder_helpers() {
        let config = DriverConfig::default()
            .with_namespace("test")
            .with_data_store("/tmp/store");
        assert_eq!(config.namespace, "test");
        assert_eq!(config.data_store_dir(), PathBuf::from("/tmp/store"));
    }
}

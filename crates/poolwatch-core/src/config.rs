use crate::error::{PoolwatchError, PoolwatchResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable binaries consult for the configuration path.
pub const CONFIG_ENV: &str = "POOLWATCH_CONFIG";

/// Location used when neither the CLI nor the environment names a file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/poolwatch/poolwatch.toml";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ZfsCfg {
    #[serde(default)]
    pub zfs_path: Option<String>,

    #[serde(default)]
    pub zpool_path: Option<String>,

    #[serde(default = "default_zfs_timeout_secs")]
    pub timeout_secs: u64,

    /// Device directories scanned when looking for importable pools.
    #[serde(default)]
    pub search_paths: Vec<String>,
}

fn default_zfs_timeout_secs() -> u64 {
    30
}

impl Default for ZfsCfg {
    fn default() -> Self {
        Self {
            zfs_path: None,
            zpool_path: None,
            timeout_secs: default_zfs_timeout_secs(),
            search_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HelperCfg {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
}

fn default_socket_path() -> String {
    "/run/poolwatch/helper.sock".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_socket_mode() -> u32 {
    0o666
}

impl Default for HelperCfg {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            request_timeout_secs: default_request_timeout_secs(),
            socket_mode: default_socket_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuthorizationCfg {
    #[serde(default = "default_policy_path")]
    pub policy_path: String,

    #[serde(default = "default_secret_path")]
    pub secret_path: String,

    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Accounts besides root that may satisfy `admin` rules.
    #[serde(default)]
    pub admin_uids: Vec<u32>,
}

fn default_policy_path() -> String {
    "/etc/poolwatch/rights.toml".to_string()
}

fn default_secret_path() -> String {
    "/etc/poolwatch/authority.key".to_string()
}

fn default_token_ttl_secs() -> u64 {
    300
}

impl Default for AuthorizationCfg {
    fn default() -> Self {
        Self {
            policy_path: default_policy_path(),
            secret_path: default_secret_path(),
            token_ttl_secs: default_token_ttl_secs(),
            admin_uids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PoolwatchConfig {
    #[serde(default)]
    pub zfs: ZfsCfg,

    #[serde(default)]
    pub helper: HelperCfg,

    #[serde(default)]
    pub authorization: AuthorizationCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl PoolwatchConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> PoolwatchResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();

        if cfg.helper.socket_path.trim().is_empty() {
            return Err(PoolwatchError::InvalidConfig(
                "helper.socket_path must not be empty".to_string(),
            ));
        }
        if cfg.zfs.timeout_secs == 0 {
            return Err(PoolwatchError::InvalidConfig(
                "zfs.timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// Load from `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> PoolwatchResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self {
                path: path.to_path_buf(),
                ..Self::default()
            })
        }
    }

    pub fn zfs_timeout(&self) -> Duration {
        Duration::from_secs(self.zfs.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.helper.request_timeout_secs.max(1))
    }

    pub fn zfs_binary_path(&self) -> Option<PathBuf> {
        self.zfs.zfs_path.as_ref().map(PathBuf::from)
    }

    pub fn zpool_binary_path(&self) -> Option<PathBuf> {
        self.zfs.zpool_path.as_ref().map(PathBuf::from)
    }

    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(&self.helper.socket_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_toml_applies_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("poolwatch.toml");
        fs::write(&path, "[zfs]\nzpool_path = \"/sbin/zpool\"\n").unwrap();
        let cfg = PoolwatchConfig::load(&path).unwrap();
        assert_eq!(cfg.zpool_binary_path(), Some(PathBuf::from("/sbin/zpool")));
        assert_eq!(cfg.zfs.timeout_secs, 30);
        assert_eq!(cfg.helper.socket_path, "/run/poolwatch/helper.sock");
        assert_eq!(cfg.authorization.token_ttl_secs, 300);
        assert_eq!(cfg.path, path);
    }

    #[test]
    fn load_yaml_reads_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("poolwatch.yaml");
        fs::write(
            &path,
            "helper:\n  socket_path: /tmp/pw.sock\nauthorization:\n  admin_uids: [501]\n",
        )
        .unwrap();
        let cfg = PoolwatchConfig::load(&path).unwrap();
        assert_eq!(cfg.socket_path(), PathBuf::from("/tmp/pw.sock"));
        assert_eq!(cfg.authorization.admin_uids, vec![501]);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("poolwatch.toml");
        fs::write(&path, "[zfs]\ntimeout_secs = 0\n").unwrap();
        let err = PoolwatchConfig::load(&path).unwrap_err();
        assert!(matches!(err, PoolwatchError::InvalidConfig(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = PoolwatchConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.helper.request_timeout_secs, 120);
    }
}

use pool_lib::{parse_unit_size, PoolError, PoolResult};
use pool_p2p::CompanionConfig;
use replica_store::RepositoryConfig;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_POOL_DAEMON_CONFIG_PATH: &str = "/opt/pool/etc/pool_daemon.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolDaemonConfig {
    #[serde(alias = "name")]
    pub pool_name: String,
    /// Holds `meta.db` and the `data/` directory.
    #[serde(alias = "path", alias = "root_path")]
    pub base_dir: PathBuf,
    /// Unit string such as `"5g"` or `"Infinity"`. Unset means the file
    /// system size.
    pub max_disk_space: Option<String>,
    pub gap: Option<String>,
    pub volatile: bool,
    pub sticky_hold_time_secs: u64,
    pub companion: CompanionConfig,
}

impl Default for PoolDaemonConfig {
    fn default() -> Self {
        Self {
            pool_name: "pool".to_string(),
            base_dir: PathBuf::from("/opt/pool/var/pool"),
            max_disk_space: None,
            gap: None,
            volatile: false,
            sticky_hold_time_secs: RepositoryConfig::default().sticky_hold_time_secs,
            companion: CompanionConfig::default(),
        }
    }
}

impl PoolDaemonConfig {
    pub fn load(path: &Path) -> PoolResult<Self> {
        load_json_config(path)
    }

    pub fn meta_db_path(&self) -> PathBuf {
        self.base_dir.join("meta.db")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    pub fn repository_config(&self) -> PoolResult<RepositoryConfig> {
        let max_disk_space = self
            .max_disk_space
            .as_deref()
            .map(parse_unit_size)
            .transpose()?;
        let gap = self.gap.as_deref().map(parse_unit_size).transpose()?;
        Ok(RepositoryConfig {
            pool_name: self.pool_name.clone(),
            volatile: self.volatile,
            max_disk_space,
            gap,
            sticky_hold_time_secs: self.sticky_hold_time_secs,
            ..Default::default()
        })
    }
}

fn load_json_config<T: DeserializeOwned>(path: &Path) -> PoolResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| PoolError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| PoolError::InvalidParam(format!("parse {} failed: {}", path.display(), e)))
}

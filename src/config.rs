// ABOUTME: Configuration loading for the beacon binary from environment variables and an optional groups file.
// ABOUTME: Resolves the data directory, app secret, ingestion URL, install id, and group definitions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_channel::GroupConfig;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BEACON_INSTALL_ID is not a valid UUID: {0}")]
    InvalidInstallId(String),

    #[error("BEACON_LOG_URL must use https unless BEACON_ALLOW_INSECURE is set: {0}")]
    InsecureLogUrl(String),

    #[error("failed to read groups file {path}: {source}")]
    GroupsFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid groups file {path}: {source}")]
    GroupsParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("groups file {0} defines no groups")]
    NoGroups(PathBuf),

    #[error("install id file error: {0}")]
    InstallIdFile(#[from] std::io::Error),
}

/// One entry of the `BEACON_GROUPS` YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_max_parallel_batches")]
    pub max_parallel_batches: usize,
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_interval_ms() -> u64 {
    3000
}

fn default_max_parallel_batches() -> usize {
    3
}

impl Default for GroupSpec {
    fn default() -> Self {
        Self {
            name: "events".to_string(),
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
            max_parallel_batches: default_max_parallel_batches(),
        }
    }
}

impl GroupSpec {
    pub fn to_config(&self) -> GroupConfig {
        GroupConfig::new(
            self.name.clone(),
            self.batch_size,
            Duration::from_millis(self.batch_interval_ms),
            self.max_parallel_batches,
        )
    }
}

#[derive(Debug, Deserialize)]
struct GroupsFile {
    groups: Vec<GroupSpec>,
}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    pub home: PathBuf,
    pub app_secret: Option<String>,
    pub log_url: Option<String>,
    pub install_id: Option<Uuid>,
    pub allow_insecure: bool,
    pub groups: Vec<GroupSpec>,
}

impl BeaconConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - BEACON_HOME: data directory (default: ~/.beacon)
    /// - BEACON_APP_SECRET: application secret sent with every batch (optional)
    /// - BEACON_LOG_URL: ingestion base URL override (optional)
    /// - BEACON_INSTALL_ID: installation UUID (default: generated and persisted)
    /// - BEACON_ALLOW_INSECURE: allow plain http endpoints (default: false)
    /// - BEACON_GROUPS: path to a YAML groups file (default: one "events" group)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let home = var("BEACON_HOME").map(PathBuf::from).unwrap_or_else(|| {
            var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".beacon")
        });

        let allow_insecure = var("BEACON_ALLOW_INSECURE")
            .map(|v| v == "true" || v == "1" || v == "yes")
            .unwrap_or(false);

        let log_url = var("BEACON_LOG_URL");
        if let Some(url) = &log_url
            && !allow_insecure
            && !url.starts_with("https://")
        {
            return Err(ConfigError::InsecureLogUrl(url.clone()));
        }

        let install_id = var("BEACON_INSTALL_ID")
            .map(|raw| Uuid::parse_str(&raw).map_err(|_| ConfigError::InvalidInstallId(raw)))
            .transpose()?;

        let groups = match var("BEACON_GROUPS") {
            Some(path) => load_groups(Path::new(&path))?,
            None => vec![GroupSpec::default()],
        };

        Ok(Self {
            home,
            app_secret: var("BEACON_APP_SECRET"),
            log_url,
            install_id,
            allow_insecure,
            groups,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join("logs.db")
    }

    /// The configured install id, or the one persisted under the data
    /// directory, generating and storing it on first use.
    pub fn resolve_install_id(&self) -> Result<Uuid, ConfigError> {
        if let Some(id) = self.install_id {
            return Ok(id);
        }

        let path = self.home.join("install_id");
        if let Ok(raw) = std::fs::read_to_string(&path)
            && let Ok(id) = Uuid::parse_str(raw.trim())
        {
            return Ok(id);
        }

        let id = Uuid::new_v4();
        std::fs::create_dir_all(&self.home)?;
        std::fs::write(&path, id.to_string())?;
        tracing::info!(path = %path.display(), "generated new install id");
        Ok(id)
    }
}

fn load_groups(path: &Path) -> Result<Vec<GroupSpec>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::GroupsFile {
        path: path.to_path_buf(),
        source,
    })?;
    let file: GroupsFile = serde_yaml::from_str(&raw).map_err(|source| ConfigError::GroupsParse {
        path: path.to_path_buf(),
        source,
    })?;
    if file.groups.is_empty() {
        return Err(ConfigError::NoGroups(path.to_path_buf()));
    }
    Ok(file.groups)
}

//! Daemon configuration.
//!
//! Optional TOML file; a missing file means defaults. Environment variables
//! override the socket and database paths so tests and packagers can relocate
//! everything without writing a file.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use workspace_status_protocol::{
    QUERY_SOCKET_ENV, QUERY_SOCKET_SUFFIX, STATUS_SOCKET_ENV, STATUS_SOCKET_NAME,
};

const CONFIG_ENV: &str = "WORKSPACE_STATUS_CONFIG";
const DB_ENV: &str = "WORKSPACE_STATUS_DB";
const APP_DIR: &str = "workspace-status";

const DEFAULT_TICK_INTERVAL_MS: u64 = 30_000;
const DEFAULT_WORKING_TIMEOUT_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub paths: PathsConfig,
    pub store: StoreConfig,
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub status_socket: Option<PathBuf>,
    pub query_socket: Option<PathBuf>,
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchdogConfig {
    pub tick_interval_ms: u64,
    pub working_timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            working_timeout_ms: DEFAULT_WORKING_TIMEOUT_MS,
        }
    }
}

impl WatchdogConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn working_timeout(&self) -> Duration {
        Duration::from_millis(self.working_timeout_ms)
    }
}

impl DaemonConfig {
    pub fn status_socket_path(&self) -> PathBuf {
        env_path(STATUS_SOCKET_ENV)
            .or_else(|| self.paths.status_socket.clone())
            .unwrap_or_else(|| runtime_dir().join(STATUS_SOCKET_NAME))
    }

    pub fn query_socket_path(&self) -> PathBuf {
        resolve_query_socket(
            env_path(QUERY_SOCKET_ENV),
            self.paths.query_socket.clone(),
            self.status_socket_path(),
        )
    }

    pub fn database_path(&self) -> Result<PathBuf, String> {
        if let Some(path) = env_path(DB_ENV).or_else(|| self.paths.database.clone()) {
            return Ok(path);
        }
        let data_dir = dirs::data_dir().ok_or_else(|| "Data directory not found".to_string())?;
        Ok(data_dir.join(APP_DIR).join("state.db"))
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if self.watchdog.tick_interval_ms == 0 {
            return Err(invalid("watchdog.tick_interval_ms must be greater than zero"));
        }
        if self.watchdog.working_timeout_ms == 0 {
            return Err(invalid("watchdog.working_timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

/// Loads the config file, or defaults when it does not exist. `path` wins
/// over `WORKSPACE_STATUS_CONFIG`, which wins over the user config dir.
pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, ConfigError> {
    let config_path = match path.or_else(|| env_path(CONFIG_ENV)).or_else(default_config_path) {
        Some(path) => path,
        None => return Ok(DaemonConfig::default()),
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let config: DaemonConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: config_path.clone(),
        source,
    })?;
    config.validate(&config_path)?;
    Ok(config)
}

/// Env override, then the configured path, then the status socket path
/// with `.query` appended.
fn resolve_query_socket(
    env_override: Option<PathBuf>,
    configured: Option<PathBuf>,
    status_socket: PathBuf,
) -> PathBuf {
    env_override.or(configured).unwrap_or_else(|| {
        let mut path = status_socket.into_os_string();
        path.push(QUERY_SOCKET_SUFFIX);
        PathBuf::from(path)
    })
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("daemon.toml"))
}

/// `$XDG_RUNTIME_DIR`, then the platform runtime dir, then `/tmp`.
fn runtime_dir() -> PathBuf {
    env_path("XDG_RUNTIME_DIR")
        .or_else(dirs::runtime_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

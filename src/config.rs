use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up next to the executable when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "launcher.toml";

/// Top-level configuration loaded from launcher.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct LauncherConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub environment: EnvironmentConfig,
    pub shutdown: ShutdownConfig,
    pub startup: StartupConfig,
}

/// The external server invocation: `<command> <package> [extra_args..] <db>`.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub command: String,
    pub package: String,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub file_name: String,
}

/// Variables added to the child's inherited environment.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub module_path_var: String,
    pub cache_dir_var: String,
    pub cache_dir_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub notice_delay_ms: u64,
}

/// Errors from reading or parsing the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl LauncherConfig {
    /// Parse a config file. A missing file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load the explicit config if given, otherwise the optional one in
    /// `install_dir`, otherwise defaults.
    pub fn resolve(explicit: Option<&Path>, install_dir: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let implicit = install_dir.join(DEFAULT_CONFIG_FILE);
        if implicit.is_file() {
            tracing::debug!(path = %implicit.display(), "loading launcher config");
            Self::load(&implicit)
        } else {
            Ok(Self::default())
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl StartupConfig {
    pub fn notice_delay(&self) -> Duration {
        Duration::from_millis(self.notice_delay_ms)
    }
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "uvx".to_string(),
            package: "mcp-server-sqlite".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file_name: "database.db".to_string(),
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            module_path_var: "PYTHONPATH".to_string(),
            cache_dir_var: "UV_CACHE_DIR".to_string(),
            cache_dir_name: ".uv-cache".to_string(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            notice_delay_ms: 1000,
        }
    }
}

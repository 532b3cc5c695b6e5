//! Configuration
//!
//! Loaded once from a TOML file and passed by value to whatever needs it.
//!
//! ```toml
//! [connection]
//! user = "postgres"
//! password = "secret"
//! host = "localhost"
//! port = 5432
//! database = "postgres"
//!
//! [system]
//! cache_dir = "out"
//! client = "psql"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "qcache.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Database connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: String::new(),
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
        }
    }
}

/// Local paths and tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Directory holding cache entries
    pub cache_dir: PathBuf,

    /// psql executable
    pub client: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("out"),
            client: "psql".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub system: SystemConfig,
}

impl Config {
    /// Load a config file; missing sections and fields take defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if given, else `qcache.toml` when present, else defaults
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Connection URI handed to psql
    pub fn psql_uri(&self) -> String {
        let c = &self.connection;
        let credentials = if c.password.is_empty() {
            c.user.clone()
        } else {
            format!("{}:{}", c.user, c.password)
        };
        format!(
            "postgresql://{}@{}:{}/{}",
            credentials, c.host, c.port, c.database
        )
    }
}

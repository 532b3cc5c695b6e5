//! Cache artifact paths
//!
//! Every artifact path is a pure function of the cache directory and the key.

use std::path::{Path, PathBuf};

/// Extension of the compressed data artifact
pub const DATA_EXT: &str = "csv.gz";

/// Extension of the schema side-car
pub const SCHEMA_EXT: &str = "json";

/// Reasons a key cannot address a cache entry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("cache key is empty")]
    Empty,

    #[error("cache key {0:?} must not start with '.'")]
    Hidden(String),

    #[error("cache key {0:?} contains a path separator or NUL")]
    InvalidChar(String),
}

/// Check that a key is usable as a file stem inside the cache directory
pub fn validate_key(key: &str) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    if key.starts_with('.') {
        return Err(KeyError::Hidden(key.to_string()));
    }
    if key.contains(['/', '\\', '\0']) {
        return Err(KeyError::InvalidChar(key.to_string()));
    }
    Ok(())
}

/// The pair of artifact paths for one cache key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPaths {
    pub data: PathBuf,
    pub schema: PathBuf,
}

impl EntryPaths {
    /// Derive artifact paths for `key` under `cache_dir`
    pub fn new(cache_dir: &Path, key: &str) -> Result<Self, KeyError> {
        validate_key(key)?;
        Ok(Self {
            data: cache_dir.join(format!("{}.{}", key, DATA_EXT)),
            schema: cache_dir.join(format!("{}.{}", key, SCHEMA_EXT)),
        })
    }

    /// Both artifacts exist
    pub fn is_complete(&self) -> bool {
        self.data.is_file() && self.schema.is_file()
    }

    /// Data exists without its schema side-car
    pub fn is_partial(&self) -> bool {
        self.data.is_file() && !self.schema.is_file()
    }
}

/// Recover the key from an artifact file name, if it is one
pub fn key_from_file_name(name: &str) -> Option<&str> {
    name.strip_suffix(&format!(".{}", DATA_EXT))
        .or_else(|| name.strip_suffix(&format!(".{}", SCHEMA_EXT)))
        .filter(|key| validate_key(key).is_ok())
}

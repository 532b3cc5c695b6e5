//! Schema side-car codec
//!
//! A side-car is a JSON object mapping column names to type tags, keys in
//! column order:
//!
//! ```json
//! {
//!   "customer_id": "text",
//!   "review_rating": "integer"
//! }
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::model::Schema;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema side-car {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt schema side-car {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Write `schema` to `path`, replacing any previous file atomically
pub fn persist(path: &Path, schema: &Schema) -> Result<(), SchemaError> {
    let io_err = |source| SchemaError::Io {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_string_pretty(schema)
        .map_err(|e| io_err(std::io::Error::other(e)))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .suffix(".json")
        .tempfile_in(dir)
        .map_err(io_err)?;
    tmp.write_all(json.as_bytes()).map_err(io_err)?;
    tmp.write_all(b"\n").map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Read a side-car. Absent, empty and malformed files are all errors.
pub fn load(path: &Path) -> Result<Schema, SchemaError> {
    let content = fs::read_to_string(path).map_err(|source| SchemaError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| SchemaError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

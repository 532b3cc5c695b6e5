//! Cache module - Manages the query-result cache directory
//!
//! Provides:
//! - Cache store (hit/miss protocol, population, bulk load)
//! - Schema side-car codec
//! - Per-key population locks

use std::path::PathBuf;

use crate::backends::process::ProcessError;
use crate::cache::schema::SchemaError;
use crate::core::paths::KeyError;
use crate::core::table::DecodeError;
use crate::core::template::TemplateError;

pub mod lock;
pub mod schema;
pub mod store;

/// Error type for cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("external command failed: {0}")]
    Command(#[from] ProcessError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: DecodeError,
    },

    #[error("template {path}: {source}")]
    Template {
        path: PathBuf,
        source: TemplateError,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| CacheError::Io { path, source }
    }
}

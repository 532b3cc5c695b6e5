//! Doctor - Dependency checking

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::core::config::Config;
use crate::core::render::{RenderConfig, Renderer};
use crate::core::util::command_exists;

/// Dependency status
#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    pub name: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Check the psql client and the cache directory
pub fn check_dependencies(config: &Config) -> Vec<DependencyStatus> {
    let client = &config.system.client;
    let client_available = command_exists(client);

    vec![
        DependencyStatus {
            name: "psql".to_string(),
            available: client_available,
            command: client_available.then(|| client.clone()),
            required: true,
            notes: Some(
                "Install the PostgreSQL client, or set [system] client in qcache.toml".to_string(),
            ),
        },
        cache_dir_status(&config.system.cache_dir),
    ]
}

fn cache_dir_status(dir: &Path) -> DependencyStatus {
    let (available, notes) = if dir.is_dir() {
        let readonly = dir
            .metadata()
            .map(|m| m.permissions().readonly())
            .unwrap_or(true);
        (!readonly, readonly.then(|| "directory is read-only".to_string()))
    } else {
        (true, Some("created on first cache miss".to_string()))
    };

    DependencyStatus {
        name: "cache_dir".to_string(),
        available,
        command: Some(dir.display().to_string()),
        required: true,
        notes,
    }
}

/// Run the doctor command
pub fn run_doctor(config: &Config, render_config: RenderConfig) -> Result<()> {
    let deps = check_dependencies(config);

    let renderer = Renderer::with_config(render_config);
    println!("{}", renderer.render_records(&deps));

    if deps.iter().any(|d| d.required && !d.available) {
        eprintln!("\n⚠️  Some required dependencies are missing!");
    }

    Ok(())
}

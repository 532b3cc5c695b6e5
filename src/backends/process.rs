//! External process execution
//!
//! Everything the cache runs goes through a `Runner`: one shell command line
//! in, captured stdout out, an error carrying the combined output on failure.

use std::process::{Command, Stdio};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("command exited with {}: {output}", exit_label(.code))]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// Runs shell command lines
pub trait Runner: Send + Sync {
    /// Run `command_line` to completion and return its trimmed stdout
    fn run(&self, command_line: &str) -> Result<String, ProcessError>;
}

/// `Runner` backed by `sh -c`
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl Runner for ShellRunner {
    fn run(&self, command_line: &str) -> Result<String, ProcessError> {
        debug!(command = command_line, "running");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ProcessError::Spawn {
                command: command_line.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let combined = format!("{}{}", stdout, stderr).trim().to_string();
            return Err(ProcessError::Failed {
                command: command_line.to_string(),
                code: output.status.code(),
                output: combined,
            });
        }

        Ok(stdout.trim().to_string())
    }
}

/// Quote `s` as a single shell word
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

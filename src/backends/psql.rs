//! psql integration
//!
//! Builds psql command lines. Running them is left to a `Runner`.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::backends::process::shell_quote;
use crate::core::config::Config;

/// A statement to hand to psql
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Inline SQL, passed with `-c`
    Sql(String),

    /// SQL file, passed with `-f`
    File(PathBuf),
}

impl Query {
    fn args(&self) -> String {
        match self {
            Query::Sql(sql) => format!("-c {}", shell_quote(sql)),
            Query::File(path) => format!("-f {}", shell_quote(&path.to_string_lossy())),
        }
    }
}

/// Bulk-load destination, `schema.table` or a bare `table`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: String,
}

impl std::str::FromStr for TableRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if !parts.iter().all(|p| is_identifier(p)) {
            return Err(format!("Invalid table name: {:?}", s));
        }
        match parts.as_slice() {
            [table] => Ok(TableRef {
                schema: None,
                table: table.to_string(),
            }),
            [schema, table] => Ok(TableRef {
                schema: Some(schema.to_string()),
                table: table.to_string(),
            }),
            _ => Err(format!("Invalid table name: {:?}", s)),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => f.write_str(&self.table),
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// psql command line builder for one connection
#[derive(Debug, Clone)]
pub struct Psql {
    client: String,
    uri: String,
}

impl Psql {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: config.system.client.clone(),
            uri: config.psql_uri(),
        }
    }

    fn base(&self) -> String {
        format!("{} {}", self.client, shell_quote(&self.uri))
    }

    /// Run a statement and print its output
    pub fn execute_command(&self, query: &Query) -> String {
        format!("{} {}", self.base(), query.args())
    }

    /// Run a statement and write its result set as CSV to `out`
    pub fn export_command(&self, query: &Query, out: &Path) -> String {
        format!(
            "{} {} -A --csv -o {}",
            self.base(),
            query.args(),
            shell_quote(&out.to_string_lossy())
        )
    }

    /// Load a local CSV file into `target` with `\copy`
    pub fn copy_command(&self, csv_file: &Path, target: &TableRef) -> String {
        let file = csv_file.to_string_lossy().replace('\'', "''");
        let meta = format!("\\copy {} from '{}' with csv", target, file);
        format!("{} -c {}", self.base(), shell_quote(&meta))
    }
}

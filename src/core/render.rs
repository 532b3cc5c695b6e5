//! Renderer module
//!
//! Renders tables to jsonl, json, csv or markdown, and plain records to json(l)

use serde::Serialize;

use crate::core::model::{RowView, Table, Value};
use crate::core::table::encode;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Jsonl,
    Json,
    Csv,
    Markdown,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jsonl" => Ok(OutputFormat::Jsonl),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "md" | "markdown" => Ok(OutputFormat::Markdown),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

/// Render configuration combining format and options
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderConfig {
    pub format: OutputFormat,
    pub pretty: bool,
}

impl RenderConfig {
    /// Create a new render config with pretty option
    pub fn with_pretty(format: OutputFormat, pretty: bool) -> Self {
        Self { format, pretty }
    }
}

/// Renderer for tables and records
pub struct Renderer {
    config: RenderConfig,
}

impl Renderer {
    /// Create a new renderer with render config
    pub fn with_config(config: RenderConfig) -> Self {
        Self { config }
    }

    /// Render a table in the configured format
    pub fn render_table(&self, table: &Table) -> Result<String, csv::Error> {
        let out = match self.config.format {
            OutputFormat::Jsonl => self.jsonl(table.rows.iter().map(|values| RowView {
                schema: &table.schema,
                values,
            })),
            OutputFormat::Json => {
                let rows: Vec<_> = table
                    .rows
                    .iter()
                    .map(|values| RowView {
                        schema: &table.schema,
                        values,
                    })
                    .collect();
                self.json(&rows)
            }
            OutputFormat::Csv => {
                let mut buf = Vec::new();
                encode(table, &mut buf)?;
                String::from_utf8_lossy(&buf).trim_end().to_string()
            }
            OutputFormat::Markdown => render_markdown(table),
        };
        Ok(out)
    }

    /// Render serializable records. Only json is distinct; every other
    /// format emits one JSON object per line.
    pub fn render_records<T: Serialize>(&self, items: &[T]) -> String {
        match self.config.format {
            OutputFormat::Json => self.json(items),
            _ => self.jsonl(items.iter()),
        }
    }

    fn jsonl<T: Serialize>(&self, items: impl Iterator<Item = T>) -> String {
        items
            .filter_map(|item| {
                if self.config.pretty {
                    serde_json::to_string_pretty(&item).ok()
                } else {
                    serde_json::to_string(&item).ok()
                }
            })
            .collect::<Vec<_>>()
            .join(if self.config.pretty { "\n\n" } else { "\n" })
    }

    fn json<T: Serialize + ?Sized>(&self, items: &T) -> String {
        if self.config.pretty {
            serde_json::to_string_pretty(items).unwrap_or_else(|_| "[]".to_string())
        } else {
            serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
        }
    }
}

fn render_markdown(table: &Table) -> String {
    let mut output = String::new();
    let header: Vec<String> = table.columns().map(escape_cell).collect();

    output.push_str(&format!("| {} |\n", header.join(" | ")));
    output.push_str(&format!(
        "|{}|\n",
        header.iter().map(|_| " --- ").collect::<Vec<_>>().join("|")
    ));
    for row in &table.rows {
        let cells: Vec<String> = row.iter().map(|v| escape_cell(&markdown_value(v))).collect();
        output.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    output.push_str(&format!("\n_{} rows_", table.rows.len()));
    output
}

fn markdown_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        other => other.to_field(),
    }
}

fn escape_cell(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ")
}

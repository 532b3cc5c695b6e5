//! CSV decoding and encoding for `Table`
//!
//! Decoding applies a schema where one is known and infers a type for every
//! other column from the values it holds.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use std::io::{Read, Write};

use crate::core::model::{ColumnType, Schema, Table, Value, DATE_FORMAT};

/// Parsing hints for CSV decoding.
///
/// Compression and column types are not options: the cache store always
/// decodes gzip and supplies the schema itself.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// First record holds column names
    pub header: bool,

    /// Column names for headerless input
    pub names: Vec<String>,

    /// Field delimiter
    pub delimiter: u8,

    /// Columns to read as timestamps when their type is inferred
    pub parse_dates: Vec<String>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            header: true,
            names: Vec::new(),
            delimiter: b',',
            parse_dates: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("row {row}, column {column:?}: cannot read {value:?} as {column_type}")]
    Type {
        row: usize,
        column: String,
        value: String,
        column_type: ColumnType,
    },

    #[error("{found} column names given for {expected} columns")]
    Names { expected: usize, found: usize },

    #[error("schema has {expected} columns but headerless data has {found}")]
    Width { expected: usize, found: usize },
}

/// Decode CSV into a table.
///
/// Columns present in `schema` are read with that type. The rest are inferred.
pub fn decode<R: Read>(
    reader: R,
    schema: Option<&Schema>,
    options: &DecodeOptions,
) -> Result<Table, DecodeError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(options.header)
        .delimiter(options.delimiter)
        .from_reader(reader);

    let header: Option<Vec<String>> = if options.header {
        Some(rdr.headers()?.iter().map(String::from).collect())
    } else {
        None
    };

    let mut records = Vec::new();
    for record in rdr.records() {
        records.push(record?);
    }

    let width = header
        .as_ref()
        .map(|h| h.len())
        .or_else(|| records.first().map(|r| r.len()));

    let names = match header {
        Some(names) => names,
        None => column_names(width, schema, options)?,
    };
    let names = dedupe_names(names);

    let mut resolved = Schema::new();
    for (idx, name) in names.iter().enumerate() {
        let column_type = match schema.and_then(|s| s.get(name)) {
            Some(column_type) => column_type,
            None => infer(
                records.iter().map(|r| r.get(idx).unwrap_or("")),
                options.parse_dates.iter().any(|d| d == name),
            ),
        };
        resolved.insert(name.clone(), column_type);
    }

    let types: Vec<ColumnType> = resolved.iter().map(|(_, t)| t).collect();
    let mut rows = Vec::with_capacity(records.len());
    for (row_idx, record) in records.iter().enumerate() {
        if record.len() != types.len() {
            return Err(DecodeError::Width {
                expected: types.len(),
                found: record.len(),
            });
        }
        let mut row = Vec::with_capacity(types.len());
        for ((raw, &column_type), name) in record.iter().zip(&types).zip(&names) {
            let value = parse_cell(raw, column_type).ok_or_else(|| DecodeError::Type {
                row: row_idx + 1,
                column: name.clone(),
                value: raw.to_string(),
                column_type,
            })?;
            row.push(value);
        }
        rows.push(row);
    }

    Ok(Table {
        schema: resolved,
        rows,
    })
}

/// Write a table as headered CSV
pub fn encode<W: Write>(table: &Table, writer: W) -> Result<(), csv::Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(table.columns())?;
    for row in &table.rows {
        wtr.write_record(row.iter().map(Value::to_field))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Names for headerless input: explicit names first, then the schema by
/// position. Without either, columns are numbered.
fn column_names(
    width: Option<usize>,
    schema: Option<&Schema>,
    options: &DecodeOptions,
) -> Result<Vec<String>, DecodeError> {
    if !options.names.is_empty() {
        let found = options.names.len();
        return match width {
            Some(expected) if expected != found => Err(DecodeError::Names { expected, found }),
            _ => Ok(options.names.clone()),
        };
    }

    match (schema, width) {
        (Some(schema), Some(found)) if schema.len() != found => Err(DecodeError::Width {
            expected: schema.len(),
            found,
        }),
        (Some(schema), _) => Ok(schema.names().map(String::from).collect()),
        (None, width) => Ok((0..width.unwrap_or(0))
            .map(|i| format!("column_{}", i))
            .collect()),
    }
}

/// Suffix repeated names with `.1`, `.2`, ... so every column is addressable.
/// `SELECT 1, 2` yields `?column?,?column?` from psql.
fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = names.iter().cloned().collect();
    if seen.len() == names.len() {
        return names;
    }

    let mut taken = HashSet::new();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if taken.insert(name.clone()) {
            out.push(name);
            continue;
        }
        let renamed = (1..)
            .map(|n| format!("{}.{}", name, n))
            .find(|candidate| !seen.contains(candidate) && !taken.contains(candidate))
            .unwrap_or_default();
        seen.insert(renamed.clone());
        taken.insert(renamed.clone());
        out.push(renamed);
    }
    out
}

/// Pick the narrowest type that reads every non-empty value
fn infer<'a>(cells: impl Iterator<Item = &'a str>, parse_dates: bool) -> ColumnType {
    let values: Vec<&str> = cells.filter(|c| !c.is_empty()).collect();
    if values.is_empty() {
        return ColumnType::Text;
    }

    // nan/inf parse as f64 but are names far more often than numbers
    let reads_as = |column_type: ColumnType| {
        values.iter().all(|v| match parse_cell(v, column_type) {
            Some(Value::Float(f)) => f.is_finite(),
            other => other.is_some(),
        })
    };

    if parse_dates {
        return if reads_as(ColumnType::Timestamp) {
            ColumnType::Timestamp
        } else {
            ColumnType::Text
        };
    }

    [ColumnType::Integer, ColumnType::Float, ColumnType::Boolean]
        .into_iter()
        .find(|t| reads_as(*t))
        .unwrap_or(ColumnType::Text)
}

/// Read one field as `column_type`; `None` when it does not fit
pub fn parse_cell(raw: &str, column_type: ColumnType) -> Option<Value> {
    if raw.is_empty() {
        return Some(Value::Null);
    }

    let trimmed = raw.trim();
    match column_type {
        ColumnType::Text => Some(Value::Text(raw.to_string())),
        ColumnType::Integer => trimmed.parse().ok().map(Value::Integer),
        ColumnType::Float => trimmed.parse().ok().map(Value::Float),
        ColumnType::Boolean => match trimmed.to_lowercase().as_str() {
            "true" | "t" => Some(Value::Boolean(true)),
            "false" | "f" => Some(Value::Boolean(false)),
            _ => None,
        },
        ColumnType::Date => NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
            .ok()
            .map(Value::Date),
        ColumnType::Timestamp => parse_timestamp(trimmed).map(Value::Timestamp),
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    const NAIVE: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
    const ZONED: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

    NAIVE
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            ZONED
                .iter()
                .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

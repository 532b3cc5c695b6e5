//! Tabular data model
//!
//! A `Table` is an ordered list of typed columns plus rows of `Value`s. The
//! column order comes from the data and is preserved everywhere, including in
//! the serialized `Schema`.

use chrono::{NaiveDate, NaiveDateTime};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Canonical text layout for timestamps
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Canonical text layout for dates
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Type tag of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[serde(alias = "int64", alias = "bigint")]
    Integer,
    #[serde(alias = "float64", alias = "double")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "object", alias = "string")]
    Text,
    Date,
    #[serde(alias = "datetime64[ns]")]
    Timestamp,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single decoded cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Canonical CSV text; `Null` is the empty field
    pub fn to_field(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Boolean(v) => v.to_string(),
            Value::Text(v) => v.clone(),
            Value::Date(v) => v.format(DATE_FORMAT).to_string(),
            Value::Timestamp(v) => v.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Integer(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Boolean(v) => serializer.serialize_bool(*v),
            Value::Text(v) => serializer.serialize_str(v),
            Value::Date(_) | Value::Timestamp(_) => serializer.serialize_str(&self.to_field()),
        }
    }
}

/// Ordered mapping of column name to type tag.
///
/// Serializes as a JSON object whose key order is the column order. Names are
/// unique; `insert` on an existing name replaces the type in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<(String, ColumnType)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, column_type: ColumnType) {
        let name = name.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = column_type,
            None => self.columns.push((name, column_type)),
        }
    }

    pub fn get(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| *t)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.columns.iter().map(|(n, t)| (n.as_str(), *t))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }
}

impl<S: Into<String>> FromIterator<(S, ColumnType)> for Schema {
    fn from_iter<I: IntoIterator<Item = (S, ColumnType)>>(iter: I) -> Self {
        let mut schema = Schema::new();
        for (name, column_type) in iter {
            schema.insert(name, column_type);
        }
        schema
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, column_type) in &self.columns {
            map.serialize_entry(name, column_type)?;
        }
        map.end()
    }
}

struct SchemaVisitor;

impl<'de> Visitor<'de> for SchemaVisitor {
    type Value = Schema;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object mapping column names to type tags")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Schema, A::Error> {
        let mut schema = Schema::new();
        while let Some((name, column_type)) = access.next_entry::<String, ColumnType>()? {
            if schema.contains(&name) {
                return Err(serde::de::Error::custom(format!(
                    "duplicate column {:?}",
                    name
                )));
            }
            schema.columns.push((name, column_type));
        }
        Ok(schema)
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(SchemaVisitor)
    }
}

/// Decoded query result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    /// Resolved type of every column, in column order
    pub schema: Schema,

    /// One value per column in each row
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.schema.names()
    }
}

/// Borrowed view of one row that serializes as an ordered JSON object
pub struct RowView<'a> {
    pub schema: &'a Schema,
    pub values: &'a [Value],
}

impl Serialize for RowView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.schema.names().zip(self.values) {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

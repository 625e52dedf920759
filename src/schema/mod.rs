//! Typed table schemas for the time-series store.
//!
//! A [`TableSchema`] owns an ordered list of [`ColumnDefinition`]s and knows
//! how to render its DDL and multi-row inserts. Each column coerces one raw
//! value (as produced by a feed) into a [`SqlValue`], substituting defaults
//! and rejecting nulls where the column forbids them.

pub mod standard;
pub mod value;

use crate::utils::error::{Error, Result, StoreError, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

pub use value::{parse_timestamp, SqlValue};

/// A record as fetched from an upstream source, before coercion.
pub type RawRecord = serde_json::Map<String, Value>;

/// A record after every column has been coerced.
pub type TypedRecord = BTreeMap<String, SqlValue>;

/// Store column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Timestamp,
    Date,
    /// Categorical string, interned by the store
    Symbol,
    String,
    Double,
    Float,
    Long,
    Int,
    Boolean,
}

impl ColumnType {
    pub fn sql_name(&self) -> &'static str {
        match self {
            | ColumnType::Timestamp => "TIMESTAMP",
            | ColumnType::Date => "DATE",
            | ColumnType::Symbol => "SYMBOL",
            | ColumnType::String => "STRING",
            | ColumnType::Double => "DOUBLE",
            | ColumnType::Float => "FLOAT",
            | ColumnType::Long => "LONG",
            | ColumnType::Int => "INT",
            | ColumnType::Boolean => "BOOLEAN",
        }
    }

    /// Map a catalog type name back to a column type. Unknown names become `String`.
    pub fn from_catalog(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            | "timestamp" | "timestamp without time zone" | "timestamptz" => ColumnType::Timestamp,
            | "date" => ColumnType::Date,
            | "symbol" => ColumnType::Symbol,
            | "double" | "double precision" | "float8" => ColumnType::Double,
            | "float" | "real" | "float4" => ColumnType::Float,
            | "long" | "bigint" | "int8" => ColumnType::Long,
            | "int" | "integer" | "int4" | "short" | "smallint" | "int2" | "byte" => ColumnType::Int,
            | "boolean" | "bool" => ColumnType::Boolean,
            | _ => ColumnType::String,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

fn default_true() -> bool {
    true
}

/// Definition of a single table column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Substituted when the raw record lacks the field or holds null
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_capacity: Option<u32>,
    #[serde(default)]
    pub symbol_cache: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default_value: None,
            symbol_capacity: None,
            symbol_cache: false,
            description: String::new(),
        }
    }

    /// Cached symbol column with the given capacity.
    pub fn symbol(name: impl Into<String>, capacity: u32) -> Self {
        let mut col = Self::new(name, ColumnType::Symbol);
        col.symbol_capacity = Some(capacity);
        col.symbol_cache = true;
        col
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Column fragment of a `CREATE TABLE` statement.
    pub fn to_sql(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.column_type.sql_name());
        if self.column_type == ColumnType::Symbol {
            if let Some(capacity) = self.symbol_capacity {
                sql.push_str(&format!(" CAPACITY {capacity}"));
            }
            if self.symbol_cache {
                sql.push_str(" CACHE");
            }
        }
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        sql
    }

    /// Coerce one raw value. `None` and JSON null fall back to the default,
    /// then to SQL NULL when the column allows it.
    pub fn validate_value(&self, value: Option<&Value>) -> std::result::Result<SqlValue, ValidationError> {
        let present = value.filter(|v| !v.is_null());
        let value = match present.or_else(|| self.default_value.as_ref().filter(|v| !v.is_null())) {
            | Some(v) => v,
            | None if self.nullable => return Ok(SqlValue::Null),
            | None => {
                return Err(ValidationError::NullNotAllowed { column: self.name.clone() });
            }
        };

        let coerced = match self.column_type {
            | ColumnType::Timestamp => value.as_str().and_then(parse_timestamp).map(SqlValue::Timestamp),
            | ColumnType::Date => value.as_str().and_then(parse_date).map(SqlValue::Date),
            | ColumnType::Double => to_f64(value).map(SqlValue::Double),
            | ColumnType::Float => to_f64(value)
                .map(|v| v as f32)
                .filter(|v| v.is_finite())
                .map(SqlValue::Float),
            | ColumnType::Long => to_i64(value).map(SqlValue::Long),
            | ColumnType::Int => to_i64(value)
                .and_then(|v| i32::try_from(v).ok())
                .map(SqlValue::Int),
            | ColumnType::Boolean => to_bool(value).map(SqlValue::Bool),
            | ColumnType::String => Some(SqlValue::Text(to_text(value))),
            | ColumnType::Symbol => Some(SqlValue::Symbol(to_text(value))),
        };

        coerced.ok_or_else(|| ValidationError::Incompatible {
            column: self.name.clone(),
            expected: self.column_type.to_string(),
            value: value::describe(value),
        })
    }
}

fn parse_date(s: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(s).map(|ts| ts.date_naive()))
}

fn to_f64(value: &Value) -> Option<f64> {
    let v = match value {
        | Value::Number(n) => n.as_f64(),
        | Value::String(s) => s.trim().parse::<f64>().ok(),
        | Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        | _ => None,
    };
    v.filter(|f| f.is_finite())
}

/// Integers parse directly; anything float-like is truncated toward zero.
fn to_i64(value: &Value) -> Option<i64> {
    match value {
        | Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate)),
        | Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(truncate))
        }
        | Value::Bool(b) => Some(i64::from(*b)),
        | _ => None,
    }
}

fn truncate(f: f64) -> Option<i64> {
    (f.is_finite() && f.abs() < 9.2e18).then(|| f.trunc() as i64)
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        | Value::Bool(b) => Some(*b),
        | Value::String(s) => Some(matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        )),
        | Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        | _ => None,
    }
}

fn to_text(value: &Value) -> String {
    match value {
        | Value::String(s) => s.clone(),
        | other => other.to_string(),
    }
}

/// Physical partitioning of a table by its timestamp column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionBy {
    Hour,
    #[default]
    Day,
    Month,
    Year,
}

impl PartitionBy {
    fn sql_name(&self) -> &'static str {
        match self {
            | PartitionBy::Hour => "HOUR",
            | PartitionBy::Day => "DAY",
            | PartitionBy::Month => "MONTH",
            | PartitionBy::Year => "YEAR",
        }
    }
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Complete table schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    #[serde(default)]
    pub partition_by: PartitionBy,
    #[serde(default = "default_true")]
    pub wal_enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
}

impl TableSchema {
    /// Build and validate a schema partitioned by `timestamp_column`.
    pub fn new(
        table_name: impl Into<String>,
        timestamp_column: impl Into<String>,
        columns: Vec<ColumnDefinition>,
    ) -> Result<Self> {
        let schema = Self {
            table_name: table_name.into(),
            columns,
            timestamp_column: timestamp_column.into(),
            partition_by: PartitionBy::Day,
            wal_enabled: true,
            description: String::new(),
            version: default_version(),
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_partition(mut self, partition_by: PartitionBy) -> Self {
        self.partition_by = partition_by;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_name.trim().is_empty() {
            return Err(Error::SchemaError("Table name is required".to_string()));
        }
        if !is_identifier(&self.table_name) {
            return Err(Error::SchemaError(format!(
                "Table name '{}' is not a plain identifier",
                self.table_name
            )));
        }
        if self.columns.is_empty() {
            return Err(Error::SchemaError("At least one column is required".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            if !is_identifier(&col.name) {
                return Err(Error::SchemaError(format!(
                    "Column name '{}' is not a plain identifier",
                    col.name
                )));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(Error::SchemaError(format!("Duplicate column name '{}'", col.name)));
            }
        }

        match self.column(&self.timestamp_column) {
            | None => Err(Error::SchemaError(format!(
                "Timestamp column '{}' not found in columns",
                self.timestamp_column
            ))),
            | Some(col) if col.column_type != ColumnType::Timestamp => Err(Error::SchemaError(format!(
                "Timestamp column '{}' must be of type TIMESTAMP",
                self.timestamp_column
            ))),
            | Some(_) => Ok(()),
        }
    }

    pub fn add_column(&mut self, column: ColumnDefinition) -> Result<()> {
        if self.column(&column.name).is_some() {
            return Err(Error::SchemaError(format!("Column '{}' already exists", column.name)));
        }
        if !is_identifier(&column.name) {
            return Err(Error::SchemaError(format!(
                "Column name '{}' is not a plain identifier",
                column.name
            )));
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// `CREATE TABLE IF NOT EXISTS` statement, partitioned and optionally WAL-backed.
    pub fn to_create_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| c.to_sql())
            .collect::<Vec<_>>()
            .join(",\n    ");
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n) TIMESTAMP({}) PARTITION BY {}",
            self.table_name,
            columns,
            self.timestamp_column,
            self.partition_by.sql_name()
        );
        if self.wal_enabled {
            sql.push_str(" WAL");
        }
        sql.push(';');
        sql
    }

    /// Multi-row insert for already-validated records.
    pub fn to_insert_sql(&self, rows: &[TypedRecord]) -> String {
        let tuples = rows
            .iter()
            .map(|row| {
                let literals = self
                    .record_values(row)
                    .iter()
                    .map(SqlValue::to_literal)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({literals})")
            })
            .collect::<Vec<_>>()
            .join(",\n");
        format!(
            "INSERT INTO {} ({}) VALUES\n{};",
            self.table_name,
            self.column_names().join(", "),
            tuples
        )
    }

    /// Coerce every column of `raw`. Fields outside the schema are dropped.
    pub fn validate_record(&self, raw: &RawRecord) -> std::result::Result<TypedRecord, ValidationError> {
        self.columns
            .iter()
            .map(|col| col.validate_value(raw.get(&col.name)).map(|v| (col.name.clone(), v)))
            .collect()
    }

    /// Values in column order; missing columns become NULL.
    pub fn record_values(&self, record: &TypedRecord) -> Vec<SqlValue> {
        self.columns
            .iter()
            .map(|c| record.get(&c.name).cloned().unwrap_or(SqlValue::Null))
            .collect()
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let schema: TableSchema = serde_json::from_value(value)?;
        schema.validate()?;
        Ok(schema)
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Registry of table schemas known to the store layer.
#[derive(Debug, Default)]
pub struct SchemaManager {
    schemas: HashMap<String, TableSchema>,
}

impl SchemaManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_schema(&mut self, schema: TableSchema) {
        if self.schemas.contains_key(&schema.table_name) {
            debug!(table = %schema.table_name, "Replacing registered schema");
        } else {
            info!(table = %schema.table_name, columns = schema.columns.len(), "Registered schema");
        }
        self.schemas.insert(schema.table_name.clone(), schema);
    }

    pub fn get_schema(&self, table: &str) -> Option<&TableSchema> {
        self.schemas.get(table)
    }

    pub fn list_schemas(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn validate_record_for_table(&self, table: &str, raw: &RawRecord) -> Result<TypedRecord> {
        let schema = self
            .get_schema(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(schema.validate_record(raw)?)
    }

    /// Register schemas discovered in the store catalog. Tables already
    /// registered in-process keep their richer definitions.
    pub fn load_catalog(&mut self, rows: &[Vec<SqlValue>]) -> usize {
        let mut loaded = 0;
        for schema in Self::schemas_from_catalog(rows) {
            if !self.schemas.contains_key(&schema.table_name) {
                self.register_schema(schema);
                loaded += 1;
            }
        }
        loaded
    }

    /// Build schemas from `(table_name, column_name, data_type, is_nullable)`
    /// catalog rows. The first timestamp column becomes the partition column;
    /// tables without one are skipped.
    pub fn schemas_from_catalog(rows: &[Vec<SqlValue>]) -> Vec<TableSchema> {
        let mut order: Vec<String> = Vec::new();
        let mut tables: HashMap<String, Vec<ColumnDefinition>> = HashMap::new();

        for row in rows {
            let (Some(table), Some(column), Some(data_type)) = (
                row.first().and_then(SqlValue::as_str),
                row.get(1).and_then(SqlValue::as_str),
                row.get(2).and_then(SqlValue::as_str),
            ) else {
                warn!(?row, "Skipping malformed catalog row");
                continue;
            };
            let nullable = row
                .get(3)
                .and_then(SqlValue::as_str)
                .map(|s| s.eq_ignore_ascii_case("YES"))
                .unwrap_or(true);

            let mut col = ColumnDefinition::new(column, ColumnType::from_catalog(data_type));
            col.nullable = nullable;
            if !tables.contains_key(table) {
                order.push(table.to_string());
            }
            tables.entry(table.to_string()).or_default().push(col);
        }

        order
            .into_iter()
            .filter_map(|table| {
                let columns = tables.remove(&table)?;
                let ts = columns
                    .iter()
                    .find(|c| c.column_type == ColumnType::Timestamp)?
                    .name
                    .clone();
                match TableSchema::new(&table, ts, columns) {
                    | Ok(schema) => Some(schema.with_description(format!("Auto-discovered schema for {table}"))),
                    | Err(e) => {
                        debug!(%table, error = %e, "Catalog table not representable");
                        None
                    }
                }
            })
            .collect()
    }
}

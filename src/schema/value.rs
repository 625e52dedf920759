//! Typed scalar values as they travel between schemas and the store.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A coerced column value, ready to be bound or rendered into SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Symbol(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            | SqlValue::Int(v) => Some(*v as f64),
            | SqlValue::Long(v) => Some(*v as f64),
            | SqlValue::Float(v) => Some(*v as f64),
            | SqlValue::Double(v) => Some(*v),
            | _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            | SqlValue::Int(v) => Some(*v as i64),
            | SqlValue::Long(v) => Some(*v),
            | _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            | SqlValue::Text(s) | SqlValue::Symbol(s) => Some(s.as_str()),
            | _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            | SqlValue::Timestamp(ts) => Some(*ts),
            | _ => None,
        }
    }

    /// Render as an inline SQL literal. Strings are single-quoted with
    /// embedded quotes doubled.
    pub fn to_literal(&self) -> String {
        match self {
            | SqlValue::Null => "NULL".to_string(),
            | SqlValue::Bool(b) => b.to_string(),
            | SqlValue::Int(v) => v.to_string(),
            | SqlValue::Long(v) => v.to_string(),
            | SqlValue::Float(v) => v.to_string(),
            | SqlValue::Double(v) => v.to_string(),
            | SqlValue::Text(s) | SqlValue::Symbol(s) => quote(s),
            | SqlValue::Timestamp(ts) => quote(&ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()),
            | SqlValue::Date(d) => quote(&d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Convert back to the loosely-typed form feeds produce. Feeding the
    /// result through the same column again yields an equal value.
    pub fn to_json(&self) -> Value {
        match self {
            | SqlValue::Null => Value::Null,
            | SqlValue::Bool(b) => Value::Bool(*b),
            | SqlValue::Int(v) => Value::from(*v),
            | SqlValue::Long(v) => Value::from(*v),
            | SqlValue::Float(v) => serde_json::Number::from_f64(*v as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            | SqlValue::Double(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            | SqlValue::Text(s) | SqlValue::Symbol(s) => Value::String(s.clone()),
            | SqlValue::Timestamp(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            | SqlValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            | SqlValue::Text(s) | SqlValue::Symbol(s) => write!(f, "{s}"),
            | other => write!(f, "{}", other.to_literal()),
        }
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Parse an ISO-8601 timestamp. A trailing `Z` or offset is honoured,
/// naive values are read as UTC and a bare date means midnight UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Short description of a raw value for error messages.
pub(crate) fn describe(value: &Value) -> String {
    match value {
        | Value::String(s) => format!("'{s}'"),
        | other => other.to_string(),
    }
}

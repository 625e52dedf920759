//! Platform-owned tables: per-execution telemetry, feed health snapshots and alerts.

use super::{ColumnDefinition, ColumnType, TableSchema};
use crate::utils::error::Result;

pub const TELEMETRY_TABLE: &str = "telemetry_metrics";
pub const HEALTH_TABLE: &str = "health_status";
pub const ALERTS_TABLE: &str = "telemetry_alerts";

pub fn telemetry_schema() -> Result<TableSchema> {
    Ok(TableSchema::new(
        TELEMETRY_TABLE,
        "timestamp",
        vec![
            ColumnDefinition::new("timestamp", ColumnType::Timestamp).not_null(),
            ColumnDefinition::symbol("feed_name", 100),
            ColumnDefinition::new("execution_time_ms", ColumnType::Double),
            ColumnDefinition::new("records_processed", ColumnType::Int),
            ColumnDefinition::new("records_failed", ColumnType::Int),
            ColumnDefinition::new("success_rate", ColumnType::Double),
            ColumnDefinition::new("data_quality_score", ColumnType::Double),
            ColumnDefinition::new("error_count", ColumnType::Int),
            ColumnDefinition::new("last_error", ColumnType::String),
            ColumnDefinition::symbol("host_name", 50),
            ColumnDefinition::new("process_id", ColumnType::Int),
        ],
    )?
    .with_description("Per-execution feed telemetry"))
}

pub fn health_schema() -> Result<TableSchema> {
    Ok(TableSchema::new(
        HEALTH_TABLE,
        "timestamp",
        vec![
            ColumnDefinition::new("timestamp", ColumnType::Timestamp).not_null(),
            ColumnDefinition::symbol("feed_name", 100),
            ColumnDefinition::symbol("status", 20),
            ColumnDefinition::new("health_score", ColumnType::Double),
            ColumnDefinition::new("consecutive_failures", ColumnType::Int),
            ColumnDefinition::new("uptime_percent", ColumnType::Double),
            ColumnDefinition::new("last_successful_run", ColumnType::Timestamp),
            ColumnDefinition::new("alerts_triggered", ColumnType::Int),
            ColumnDefinition::symbol("host_name", 50),
        ],
    )?
    .with_description("Feed health snapshots"))
}

pub fn alerts_schema() -> Result<TableSchema> {
    Ok(TableSchema::new(
        ALERTS_TABLE,
        "timestamp",
        vec![
            ColumnDefinition::new("timestamp", ColumnType::Timestamp).not_null(),
            ColumnDefinition::symbol("feed_name", 100),
            ColumnDefinition::symbol("alert_type", 50),
            ColumnDefinition::symbol("severity", 20),
            ColumnDefinition::new("message", ColumnType::String),
            ColumnDefinition::new("value", ColumnType::Double),
            ColumnDefinition::new("threshold", ColumnType::Double),
            ColumnDefinition::new("resolved", ColumnType::Boolean).with_default(false),
            ColumnDefinition::new("resolved_at", ColumnType::Timestamp),
            ColumnDefinition::symbol("host_name", 50),
        ],
    )?
    .with_description("Alerts raised by feeds and the store monitor"))
}

/// All platform tables, in creation order.
pub fn all() -> Result<Vec<TableSchema>> {
    Ok(vec![telemetry_schema()?, health_schema()?, alerts_schema()?])
}

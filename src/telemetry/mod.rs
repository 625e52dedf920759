//! Per-feed execution telemetry and the process-wide metrics exporter.

pub mod prometheus;

use crate::schema::standard::{telemetry_schema, TELEMETRY_TABLE};
use crate::schema::RawRecord;
use crate::store::StoreManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Running totals for one feed.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TelemetryCounters {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub last_error: Option<String>,
}

impl TelemetryCounters {
    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            100.0
        } else {
            self.successes as f64 / self.executions as f64 * 100.0
        }
    }
}

/// One execution as seen by telemetry.
#[derive(Debug, Clone)]
pub struct ExecutionSample {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub execution_time_ms: f64,
    pub records_processed: usize,
    pub records_failed: usize,
    pub data_quality_score: f64,
    pub error: Option<String>,
}

/// Counts executions and, when persistence is on, writes one
/// `telemetry_metrics` row per execution.
pub struct FeedTelemetry {
    feed: String,
    store: Option<Arc<StoreManager>>,
    counters: TelemetryCounters,
}

impl FeedTelemetry {
    pub fn new(feed: impl Into<String>, store: Option<Arc<StoreManager>>) -> Self {
        Self { feed: feed.into(), store, counters: TelemetryCounters::default() }
    }

    pub fn counters(&self) -> &TelemetryCounters {
        &self.counters
    }

    pub fn persists(&self) -> bool {
        self.store.is_some()
    }

    /// Make sure the telemetry table exists. No-op without a store.
    pub async fn prepare(&self) -> bool {
        let Some(store) = &self.store else { return true };
        if store.schema(TELEMETRY_TABLE).await.is_some() {
            return true;
        }
        match telemetry_schema() {
            | Ok(schema) => store.create_table_from_schema(schema).await,
            | Err(e) => {
                warn!(error = %e, "Invalid telemetry schema");
                false
            }
        }
    }

    pub fn record(&mut self, sample: &ExecutionSample) {
        let c = &mut self.counters;
        c.executions += 1;
        if sample.success {
            c.successes += 1;
        } else {
            c.failures += 1;
        }
        c.records_processed += sample.records_processed as u64;
        c.records_failed += sample.records_failed as u64;
        if let Some(e) = &sample.error {
            c.last_error = Some(e.clone());
        }

        let feed = self.feed.clone();
        metrics::counter!("feedhub_feed_executions_total", 1, "feed" => feed.clone(), "success" => sample.success.to_string());
        metrics::counter!("feedhub_feed_records_total", sample.records_processed as u64, "feed" => feed.clone());
        metrics::histogram!("feedhub_feed_execution_ms", sample.execution_time_ms, "feed" => feed);
    }

    fn row(&self, sample: &ExecutionSample) -> RawRecord {
        let row = json!({
            "timestamp": sample.timestamp.to_rfc3339(),
            "feed_name": self.feed,
            "execution_time_ms": sample.execution_time_ms,
            "records_processed": sample.records_processed,
            "records_failed": sample.records_failed,
            "success_rate": self.counters.success_rate(),
            "data_quality_score": sample.data_quality_score,
            "error_count": self.counters.failures,
            "last_error": sample.error,
            "host_name": crate::utils::host_name(),
            "process_id": std::process::id(),
        });
        match row {
            | serde_json::Value::Object(map) => map,
            | _ => RawRecord::new(),
        }
    }

    /// Write the sample's row. Failures are logged and otherwise ignored.
    pub async fn persist(&self, sample: &ExecutionSample) {
        let Some(store) = &self.store else { return };
        let result = store.execute_batch_insert(TELEMETRY_TABLE, &[self.row(sample)], 1).await;
        match result.error {
            | None => debug!(feed = %self.feed, "Stored telemetry row"),
            | Some(e) => warn!(feed = %self.feed, error = %e, "Failed to store telemetry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(success: bool) -> ExecutionSample {
        ExecutionSample {
            timestamp: Utc::now(),
            success,
            execution_time_ms: 12.0,
            records_processed: 3,
            records_failed: 1,
            data_quality_score: 75.0,
            error: (!success).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn counters_accumulate() {
        let mut t = FeedTelemetry::new("quotes", None);
        t.record(&sample(true));
        t.record(&sample(false));
        let c = t.counters();
        assert_eq!(c.executions, 2);
        assert_eq!(c.failures, 1);
        assert_eq!(c.records_processed, 6);
        assert_eq!(c.success_rate(), 50.0);
        assert_eq!(c.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn row_matches_telemetry_schema() {
        let t = FeedTelemetry::new("quotes", None);
        let schema = telemetry_schema().unwrap();
        assert!(schema.validate_record(&t.row(&sample(false))).is_ok());
    }
}

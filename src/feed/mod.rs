//! Feed contract and the per-execution pipeline built around it:
//! fetch, transform, validate, store, score, record telemetry, alert.

mod runner;

pub use runner::FeedRunner;

use crate::alerts::{AlertContext, AlertDispatch, AlertManager, Severity};
use crate::config::FeedConfig;
use crate::registry::{FeedDescriptor, Priority};
use crate::schedule::{collection_interval, current_session};
use crate::schema::{RawRecord, SqlValue, TableSchema, TypedRecord};
use crate::store::StoreManager;
use crate::telemetry::{ExecutionSample, FeedTelemetry, TelemetryCounters};
use crate::utils::error::{Error, Result};
use crate::validation::{DataValidator, RecordRule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// A source of records. Implementors describe their table and fetch raw
/// rows; everything else is handled by [`FeedPipeline`].
#[async_trait]
pub trait Feed: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> &str;

    fn market_type(&self) -> Option<&str> {
        None
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn define_schema(&self) -> Result<TableSchema>;

    async fn fetch_raw(&self) -> Result<Vec<RawRecord>>;

    /// Stamps `timestamp` and `collected_at` on records that lack them.
    fn transform(&self, records: Vec<RawRecord>, now: DateTime<Utc>) -> Result<Vec<RawRecord>> {
        let stamp = Value::String(now.to_rfc3339());
        Ok(records
            .into_iter()
            .map(|mut r| {
                r.entry("timestamp").or_insert_with(|| stamp.clone());
                r.entry("collected_at").or_insert_with(|| stamp.clone());
                r
            })
            .collect())
    }

    /// Extra acceptance rules on top of the configured ones.
    fn rules(&self) -> Vec<Arc<dyn RecordRule>> {
        Vec::new()
    }
}

/// Shape of the records a single execution stored
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DataSummary {
    pub record_count: usize,
    pub first_record_time: Option<DateTime<Utc>>,
    pub last_record_time: Option<DateTime<Utc>>,
    pub unique_symbols: Vec<String>,
    pub unique_symbol_count: usize,
}

impl DataSummary {
    pub fn from_records(records: &[TypedRecord], timestamp_column: &str) -> Self {
        let times: Vec<_> = records
            .iter()
            .filter_map(|r| r.get(timestamp_column).and_then(SqlValue::as_timestamp))
            .collect();
        let symbols: BTreeSet<String> = records
            .iter()
            .filter_map(|r| r.get("symbol").and_then(SqlValue::as_str).map(str::to_string))
            .collect();
        Self {
            record_count: records.len(),
            first_record_time: times.iter().min().copied(),
            last_record_time: times.iter().max().copied(),
            unique_symbol_count: symbols.len(),
            unique_symbols: symbols.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FeedExecutionResult {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub records_fetched: usize,
    pub records_valid: usize,
    pub records_inserted: usize,
    /// Fetched records that were not stored.
    pub records_failed: usize,
    pub data_quality_score: f64,
    pub execution_time_ms: f64,
    pub data_summary: DataSummary,
    pub alerts_raised: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

/// Share of fetched records that survived validation, as a percentage.
pub fn data_quality_score(fetched: usize, valid: usize) -> f64 {
    if fetched == 0 {
        return 100.0;
    }
    (valid as f64 / fetched as f64 * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedHealth {
    pub status: FeedHealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<String, CheckResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub descriptor: FeedDescriptor,
    pub table: String,
    pub initialized: bool,
    pub execution_count: u64,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub last_result: Option<FeedExecutionResult>,
    pub telemetry: TelemetryCounters,
}

#[derive(Default)]
struct PipelineState {
    initialized: bool,
    last_execution_time: Option<DateTime<Utc>>,
    last_result: Option<FeedExecutionResult>,
}

pub struct FeedPipeline {
    feed: Arc<dyn Feed>,
    descriptor: FeedDescriptor,
    config: FeedConfig,
    schema: TableSchema,
    validator: DataValidator,
    store: Arc<StoreManager>,
    alerts: Arc<AlertManager>,
    telemetry: Mutex<FeedTelemetry>,
    state: Mutex<PipelineState>,
}

impl FeedPipeline {
    pub fn new(feed: Arc<dyn Feed>, config: FeedConfig, store: Arc<StoreManager>, alerts: Arc<AlertManager>) -> Result<Self> {
        let schema = feed.define_schema()?;
        let descriptor = FeedDescriptor {
            name: feed.name().to_string(),
            category: config.category.clone().unwrap_or_else(|| feed.category().to_string()),
            market_type: config
                .market_type
                .clone()
                .or_else(|| feed.market_type().map(str::to_string))
                .unwrap_or_else(|| "stock_market".to_string()),
            priority: config.priority.unwrap_or_else(|| feed.priority()),
        };
        let validator = feed
            .rules()
            .into_iter()
            .fold(DataValidator::new(feed.name(), &config.validation), DataValidator::with_rule);
        let telemetry_store = config.telemetry_enabled.then(|| Arc::clone(&store));
        Ok(Self {
            telemetry: Mutex::new(FeedTelemetry::new(feed.name(), telemetry_store)),
            feed,
            descriptor,
            config,
            schema,
            validator,
            store,
            alerts,
            state: Mutex::new(PipelineState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &FeedDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Create the feed's table (and the telemetry table when persisting).
    #[instrument(skip(self), fields(feed = %self.descriptor.name))]
    pub async fn initialize(&self) -> Result<()> {
        if self.state.lock().await.initialized {
            return Ok(());
        }
        if !self.store.create_table_from_schema(self.schema.clone()).await {
            return Err(Error::SchemaError(format!("could not create table '{}'", self.schema.table_name)));
        }
        if !self.telemetry.lock().await.prepare().await {
            warn!("Telemetry table unavailable; rows will be dropped");
        }
        self.state.lock().await.initialized = true;
        info!(table = %self.schema.table_name, "Feed initialized");
        Ok(())
    }

    /// Poll interval for the current market session.
    pub fn next_interval(&self) -> Duration {
        collection_interval(current_session(), &self.config.intervals)
    }

    /// Run one execution. Errors are alerted, counted, and returned as
    /// [`Error::FeedExecution`] carrying the elapsed time.
    pub async fn collect(&self) -> Result<FeedExecutionResult> {
        let started = Instant::now();
        let outcome = match self.initialize().await {
            | Ok(()) => self.execute(started).await,
            | Err(e) => Err(e),
        };

        match outcome {
            | Ok(result) => {
                let mut state = self.state.lock().await;
                state.last_execution_time = Some(result.timestamp);
                state.last_result = Some(result.clone());
                Ok(result)
            }
            | Err(e) => Err(self.fail(started, e).await),
        }
    }

    async fn execute(&self, started: Instant) -> Result<FeedExecutionResult> {
        let name = self.name().to_string();
        let raw = self.feed.fetch_raw().await?;
        let fetched = raw.len();
        debug!(feed = %name, fetched, "Fetched raw records");

        let transformed = self.feed.transform(raw, Utc::now())?;

        let mut warnings = Vec::new();
        let mut accepted_raw = Vec::with_capacity(transformed.len());
        let mut accepted = Vec::with_capacity(transformed.len());
        for record in transformed {
            let checked = self
                .schema
                .validate_record(&record)
                .and_then(|typed| self.validator.validate(&typed).map(|_| typed));
            match checked {
                | Ok(typed) => {
                    accepted.push(typed);
                    accepted_raw.push(record);
                }
                | Err(e) => {
                    warn!(feed = %name, error = %e, "Record rejected");
                    warnings.push(e.to_string());
                }
            }
        }
        let valid = accepted.len();

        let mut success = true;
        let mut inserted = 0;
        let mut error = None;
        if !accepted_raw.is_empty() {
            let stored = self
                .store
                .execute_batch_insert(&self.schema.table_name, &accepted_raw, self.config.batch_size)
                .await;
            inserted = stored.records_inserted;
            success = stored.success;
            if let Some(e) = stored.error {
                error!(feed = %name, error = %e, "Storing records failed");
                error = Some(e.to_string());
            }
        }

        let quality = data_quality_score(fetched, valid);
        let mut result = FeedExecutionResult {
            success,
            timestamp: Utc::now(),
            records_fetched: fetched,
            records_valid: valid,
            records_inserted: inserted,
            records_failed: fetched.saturating_sub(inserted),
            data_quality_score: quality,
            execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            data_summary: DataSummary::from_records(&accepted, &self.schema.timestamp_column),
            alerts_raised: Vec::new(),
            warnings,
            error,
        };

        self.record_telemetry(&ExecutionSample {
            timestamp: result.timestamp,
            success: result.success,
            execution_time_ms: result.execution_time_ms,
            records_processed: valid,
            records_failed: result.records_failed,
            data_quality_score: quality,
            error: result.error.clone(),
        })
        .await;

        result.alerts_raised = self.check_thresholds(&result).await;

        info!(
            feed = %name,
            records = valid,
            inserted,
            elapsed_ms = result.execution_time_ms,
            quality,
            success,
            "Collection finished"
        );
        Ok(result)
    }

    async fn record_telemetry(&self, sample: &ExecutionSample) {
        let mut telemetry = self.telemetry.lock().await;
        telemetry.record(sample);
        telemetry.persist(sample).await;
    }

    async fn check_thresholds(&self, result: &FeedExecutionResult) -> Vec<String> {
        let limits = &self.config.alerts;
        if !limits.enabled {
            return Vec::new();
        }

        let mut breaches = Vec::new();
        if result.execution_time_ms > limits.max_execution_time_ms {
            breaches.push((
                "execution_time_ms",
                format!("Slow execution: {:.1}ms", result.execution_time_ms),
                json!(result.execution_time_ms),
                json!(limits.max_execution_time_ms),
            ));
        }
        if result.data_quality_score < limits.min_data_quality_score {
            breaches.push((
                "data_quality_score",
                format!("Low data quality: {:.1}%", result.data_quality_score),
                json!(result.data_quality_score),
                json!(limits.min_data_quality_score),
            ));
        }
        if result.records_valid < limits.min_records_per_execution {
            breaches.push((
                "records_processed",
                format!("Low record count: {} (min: {})", result.records_valid, limits.min_records_per_execution),
                json!(result.records_valid),
                json!(limits.min_records_per_execution),
            ));
        }

        let mut raised = Vec::new();
        for (metric, message, value, threshold) in breaches {
            let mut context = AlertContext::new();
            context.insert("alert_type".into(), json!(metric));
            context.insert("value".into(), value);
            context.insert("threshold".into(), threshold);
            match self.alerts.send_alert(self.name(), Severity::Warning, &message, context).await {
                | AlertDispatch::Delivered | AlertDispatch::Failed(_) => raised.push(message),
                | AlertDispatch::Suppressed | AlertDispatch::Disabled => {}
            }
        }
        raised
    }

    async fn fail(&self, started: Instant, err: Error) -> Error {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let message = err.to_string();
        error!(feed = %self.name(), elapsed_ms, error = %message, "Collection failed");

        let now = Utc::now();
        self.record_telemetry(&ExecutionSample {
            timestamp: now,
            success: false,
            execution_time_ms: elapsed_ms,
            records_processed: 0,
            records_failed: 0,
            data_quality_score: 0.0,
            error: Some(message.clone()),
        })
        .await;

        let mut context = AlertContext::new();
        context.insert("alert_type".into(), json!("execution_failure"));
        context.insert("execution_time_ms".into(), json!(elapsed_ms));
        self.alerts
            .send_alert(self.name(), Severity::Error, &format!("Feed execution failed: {message}"), context)
            .await;

        let failed = FeedExecutionResult {
            success: false,
            timestamp: now,
            records_fetched: 0,
            records_valid: 0,
            records_inserted: 0,
            records_failed: 0,
            data_quality_score: 0.0,
            execution_time_ms: elapsed_ms,
            data_summary: DataSummary::default(),
            alerts_raised: Vec::new(),
            warnings: Vec::new(),
            error: Some(message.clone()),
        };
        let mut state = self.state.lock().await;
        state.last_execution_time = Some(now);
        state.last_result = Some(failed);

        Error::FeedExecution { feed: self.name().to_string(), elapsed_ms, message }
    }

    pub async fn telemetry(&self) -> TelemetryCounters {
        self.telemetry.lock().await.counters().clone()
    }

    pub async fn status(&self) -> PipelineStatus {
        let state = self.state.lock().await;
        let telemetry = self.telemetry().await;
        PipelineStatus {
            descriptor: self.descriptor.clone(),
            table: self.schema.table_name.clone(),
            initialized: state.initialized,
            execution_count: telemetry.executions,
            last_execution_time: state.last_execution_time,
            last_result: state.last_result.clone(),
            telemetry,
        }
    }

    pub async fn health_check(&self) -> FeedHealth {
        self.health_check_at(Utc::now()).await
    }

    pub async fn health_check_at(&self, now: DateTime<Utc>) -> FeedHealth {
        let mut checks = BTreeMap::new();
        let (initialized, last_time, last_result) = {
            let state = self.state.lock().await;
            (state.initialized, state.last_execution_time, state.last_result.clone())
        };

        checks.insert(
            "initialized".to_string(),
            if initialized {
                CheckResult { status: CheckStatus::Pass, message: "Feed initialized".into() }
            } else {
                CheckResult { status: CheckStatus::Fail, message: "Feed not initialized".into() }
            },
        );

        let store = self.store.health_check().await;
        checks.insert(
            "store".to_string(),
            CheckResult {
                status: if store.healthy { CheckStatus::Pass } else { CheckStatus::Fail },
                message: format!("Store {}", store.status),
            },
        );

        if let (Some(at), Some(result)) = (last_time, last_result) {
            let age = (now - at).num_seconds();
            let check = if age > self.config.max_execution_age_secs as i64 {
                CheckResult { status: CheckStatus::Warn, message: format!("Last execution was {age}s ago") }
            } else if !result.success {
                CheckResult {
                    status: CheckStatus::Fail,
                    message: format!("Last execution failed: {}", result.error.unwrap_or_default()),
                }
            } else {
                CheckResult { status: CheckStatus::Pass, message: "Recent execution successful".into() }
            };
            checks.insert("recent_execution".to_string(), check);
        }

        let status = if checks.values().any(|c| c.status == CheckStatus::Fail) {
            FeedHealthStatus::Unhealthy
        } else if checks.values().any(|c| c.status == CheckStatus::Warn) {
            FeedHealthStatus::Degraded
        } else {
            FeedHealthStatus::Healthy
        };
        FeedHealth { status, timestamp: now, checks }
    }
}

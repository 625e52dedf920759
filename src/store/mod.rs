//! Store layer: pooled connections, schema registry, batched inserts with
//! retry, and health monitoring of the time-series store.

pub mod connection;
pub mod health;
pub mod memory;
pub mod pool;
pub mod postgres;

pub use connection::{Connector, QueryResult, StoreConnection};
pub use health::{HealthAlert, HealthMetric, HealthSnapshot, HealthSummary, StoreHealthMonitor, StoreHealthStatus};
pub use memory::MemoryBackend;
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use postgres::PgConnector;

use crate::config::{StoreBackend, StoreConfig};
use crate::schema::{is_identifier, standard, RawRecord, SchemaManager, SqlValue, TableSchema, TypedRecord};
use crate::utils::error::{Error, Result, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, instrument, warn};

const CATALOG_SQL: &str = "SELECT table_name, column_name, data_type, is_nullable \
                           FROM information_schema.columns ORDER BY table_name, ordinal_position";

/// Outcome of one [`StoreManager::execute_batch_insert`] call.
///
/// `records_inserted + records_failed` always equals the number of records
/// submitted. Chunks committed before a failure stay committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchInsertResult {
    pub success: bool,
    pub records_inserted: usize,
    pub records_failed: usize,
    /// Subset of `records_failed` rejected by schema validation.
    pub records_invalid: usize,
    pub chunks_committed: usize,
    pub execution_time_ms: f64,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<StoreError>,
}

fn serialize_error<S: serde::Serializer>(e: &Option<StoreError>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match e {
        | Some(e) => s.serialize_some(&e.to_string()),
        | None => s.serialize_none(),
    }
}

impl BatchInsertResult {
    fn empty() -> Self {
        Self {
            success: true,
            records_inserted: 0,
            records_failed: 0,
            records_invalid: 0,
            chunks_committed: 0,
            execution_time_ms: 0.0,
            error: None,
        }
    }

    fn failed(total: usize, invalid: usize, error: StoreError, started: Instant) -> Self {
        Self {
            success: false,
            records_inserted: 0,
            records_failed: total,
            records_invalid: invalid,
            chunks_committed: 0,
            execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            error: Some(error),
        }
    }
}

/// What a query produced.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(QueryResult),
    Affected(u64),
}

impl QueryOutcome {
    pub fn rows(&self) -> Option<&QueryResult> {
        match self {
            | QueryOutcome::Rows(r) => Some(r),
            | QueryOutcome::Affected(_) => None,
        }
    }

    pub fn affected(&self) -> u64 {
        match self {
            | QueryOutcome::Rows(r) => r.rows.len() as u64,
            | QueryOutcome::Affected(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
struct Counters {
    total_queries: u64,
    successful_queries: u64,
    failed_queries: u64,
    total_inserts: u64,
    total_records_inserted: u64,
    avg_query_time_ms: f64,
    last_error: Option<String>,
}

impl Counters {
    fn record(&mut self, outcome: std::result::Result<f64, &StoreError>) {
        self.total_queries += 1;
        match outcome {
            | Ok(ms) => {
                self.successful_queries += 1;
                let n = self.successful_queries as f64;
                self.avg_query_time_ms += (ms - self.avg_query_time_ms) / n;
                metrics::histogram!("feedhub_store_query_seconds", ms / 1000.0);
            }
            | Err(e) => {
                self.failed_queries += 1;
                self.last_error = Some(e.to_string());
                metrics::counter!("feedhub_store_query_errors_total", 1);
            }
        }
    }
}

/// Snapshot of store-level counters
#[derive(Debug, Clone, Serialize)]
pub struct StoreMetrics {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub total_inserts: u64,
    pub total_records_inserted: u64,
    pub avg_query_time_ms: f64,
    pub last_error: Option<String>,
    pub uptime_seconds: f64,
    pub schemas_registered: usize,
    pub pool: PoolStats,
}

/// Result of a store health check
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealthReport {
    pub healthy: bool,
    pub status: StoreHealthStatus,
    pub checked_at: DateTime<Utc>,
    pub response_time_ms: f64,
    pub total_tables: usize,
    pub error: Option<String>,
    pub pool: PoolStats,
    pub new_alerts: Vec<HealthAlert>,
}

pub struct StoreManager {
    config: StoreConfig,
    pool: ConnectionPool,
    schemas: RwLock<SchemaManager>,
    monitor: Mutex<StoreHealthMonitor>,
    counters: Mutex<Counters>,
    last_health: Mutex<Option<(Instant, StoreHealthReport)>>,
    initialized: AtomicBool,
    started: Instant,
}

impl StoreManager {
    pub fn new(config: StoreConfig, connector: Arc<dyn Connector>) -> Self {
        let pool = ConnectionPool::new(
            connector,
            PoolConfig {
                size: config.pool_size,
                connect_timeout: config.connect_timeout(),
                health_check_interval: config.health_check_interval(),
            },
        );
        Self {
            config,
            pool,
            schemas: RwLock::new(SchemaManager::new()),
            monitor: Mutex::new(StoreHealthMonitor::new()),
            counters: Mutex::new(Counters::default()),
            last_health: Mutex::new(None),
            initialized: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Build a manager for the backend named in `config`.
    pub fn from_config(config: StoreConfig) -> Self {
        let connector = connector_for(&config);
        Self::new(config, connector)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Open the pool, verify the store answers, and pick up the schemas of
    /// tables that already exist.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        info!("Initializing store manager");
        self.pool.initialize().await?;

        let report = self.check_health_now().await;
        if !report.healthy {
            let reason = report.error.unwrap_or_else(|| "store unreachable".to_string());
            error!(error = %reason, "Initial store health check failed");
            return Err(StoreError::Connection(reason).into());
        }

        match self.execute_query(CATALOG_SQL, &[], true).await {
            | Ok(QueryOutcome::Rows(rows)) => {
                let loaded = self.schemas.write().await.load_catalog(&rows.rows);
                info!(loaded, "Loaded existing table schemas");
            }
            | Ok(QueryOutcome::Affected(_)) => {}
            | Err(e) => warn!(error = %e, "Could not read store catalog"),
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!("Store manager initialized");
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down store manager");
        self.pool.close_all().await;
        self.initialized.store(false, Ordering::SeqCst);
    }

    pub async fn register_schema(&self, schema: TableSchema) {
        self.schemas.write().await.register_schema(schema);
    }

    pub async fn schema(&self, table: &str) -> Option<TableSchema> {
        self.schemas.read().await.get_schema(table).cloned()
    }

    pub async fn list_schemas(&self) -> Vec<String> {
        self.schemas.read().await.list_schemas()
    }

    pub async fn validate_record(&self, table: &str, raw: &RawRecord) -> Result<TypedRecord> {
        self.schemas.read().await.validate_record_for_table(table, raw)
    }

    /// Create `schema`'s table if absent and register the schema. Returns
    /// `false` when the statement could not be executed.
    #[instrument(skip(self, schema), fields(table = %schema.table_name))]
    pub async fn create_table_from_schema(&self, schema: TableSchema) -> bool {
        let sql = schema.to_create_sql();
        match self.execute_query(&sql, &[], false).await {
            | Ok(_) => {
                self.register_schema(schema).await;
                info!("Table ready");
                true
            }
            | Err(e) => {
                error!(error = %e, "Failed to create table");
                false
            }
        }
    }

    /// Create the platform's own telemetry, health and alert tables.
    pub async fn ensure_standard_tables(&self) -> Result<usize> {
        let mut created = 0;
        for schema in standard::all()? {
            if self.create_table_from_schema(schema).await {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Validate `records` against the table's schema and insert the
    /// survivors in chunks of `batch_size`, each chunk in its own
    /// transaction with a fixed retry budget.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn execute_batch_insert(&self, table: &str, records: &[RawRecord], batch_size: usize) -> BatchInsertResult {
        let started = Instant::now();
        let total = records.len();
        if total == 0 {
            return BatchInsertResult::empty();
        }

        let Some(schema) = self.schema(table).await else {
            let err = StoreError::UnknownTable(table.to_string());
            error!(error = %err, "Batch insert rejected");
            return BatchInsertResult::failed(total, 0, err, started);
        };

        let mut survivors = Vec::with_capacity(total);
        for raw in records {
            match schema.validate_record(raw) {
                | Ok(record) => survivors.push(record),
                | Err(e) => warn!(error = %e, "Invalid record"),
            }
        }
        let invalid = total - survivors.len();
        if survivors.is_empty() {
            let err = StoreError::NoValidRecords;
            self.counters.lock().await.last_error = Some(err.to_string());
            return BatchInsertResult::failed(total, invalid, err, started);
        }

        let mut conn = match self.pool.acquire().await {
            | Ok(conn) => conn,
            | Err(e) => {
                self.counters.lock().await.record(Err(&e));
                error!(error = %e, "No connection for batch insert");
                return BatchInsertResult::failed(total, invalid, e, started);
            }
        };

        let attempts = self.config.retry_attempts.max(1);
        let mut committed = 0;
        let mut chunks_committed = 0;
        let mut failure = None;

        'chunks: for chunk in survivors.chunks(batch_size.max(1)) {
            let sql = schema.to_insert_sql(chunk);
            for attempt in 1..=attempts {
                let attempt_started = Instant::now();
                match insert_chunk(&mut conn, &sql).await {
                    | Ok(()) => {
                        self.counters.lock().await.record(Ok(attempt_started.elapsed().as_secs_f64() * 1000.0));
                        committed += chunk.len();
                        chunks_committed += 1;
                        break;
                    }
                    | Err(e) => {
                        self.counters.lock().await.record(Err(&e));
                        if let Err(rb) = conn.rollback().await {
                            warn!(error = %rb, "Rollback failed");
                        }
                        if attempt == attempts {
                            failure = Some(StoreError::RetriesExhausted { attempts, last: e.to_string() });
                            break 'chunks;
                        }
                        warn!(attempt, error = %e, "Insert attempt failed, retrying");
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        let broken = conn.is_closed();
        self.pool.release(conn, broken).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        {
            let mut counters = self.counters.lock().await;
            counters.total_records_inserted += committed as u64;
            if failure.is_none() {
                counters.total_inserts += 1;
            }
        }
        metrics::counter!("feedhub_store_records_inserted_total", committed as u64, "table" => table.to_string());

        match &failure {
            | None => info!(table, inserted = committed, invalid, elapsed_ms, "Batch insert complete"),
            | Some(e) => error!(table, inserted = committed, error = %e, "Batch insert aborted"),
        }

        BatchInsertResult {
            success: failure.is_none(),
            records_inserted: committed,
            records_failed: total - committed,
            records_invalid: invalid,
            chunks_committed,
            execution_time_ms: elapsed_ms,
            error: failure,
        }
    }

    /// Run one statement with the fixed retry budget. `fetch` selects
    /// between returning rows and returning the affected-row count.
    pub async fn execute_query(&self, sql: &str, params: &[SqlValue], fetch: bool) -> std::result::Result<QueryOutcome, StoreError> {
        let mut conn = match self.pool.acquire().await {
            | Ok(conn) => conn,
            | Err(e) => {
                self.counters.lock().await.record(Err(&e));
                return Err(e);
            }
        };

        let attempts = self.config.retry_attempts.max(1);
        let mut outcome = Err(StoreError::Query("not attempted".to_string()));
        for attempt in 1..=attempts {
            let started = Instant::now();
            let result = if fetch {
                conn.query(sql, params).await.map(QueryOutcome::Rows)
            } else {
                conn.execute(sql, params).await.map(QueryOutcome::Affected)
            };
            match result {
                | Ok(out) => {
                    self.counters.lock().await.record(Ok(started.elapsed().as_secs_f64() * 1000.0));
                    outcome = Ok(out);
                    break;
                }
                | Err(e) => {
                    self.counters.lock().await.record(Err(&e));
                    if !conn.is_closed() {
                        if let Err(rb) = conn.rollback().await {
                            warn!(error = %rb, "Rollback failed");
                        }
                    }
                    if attempt == attempts || conn.is_closed() {
                        error!(error = %e, attempt, "Query failed");
                        outcome = Err(StoreError::RetriesExhausted { attempts: attempt, last: e.to_string() });
                        break;
                    }
                    warn!(attempt, error = %e, "Query attempt failed, retrying");
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
            }
        }

        let broken = conn.is_closed();
        self.pool.release(conn, broken).await;
        outcome
    }

    /// `VACUUM TABLE`; returns whether the store accepted it.
    pub async fn optimize_table(&self, table: &str) -> bool {
        if !is_identifier(table) {
            warn!(table, "Refusing to optimize invalid table name");
            return false;
        }
        match self.execute_query(&format!("VACUUM TABLE {table}"), &[], false).await {
            | Ok(_) => {
                info!(table, "Table optimized");
                true
            }
            | Err(e) => {
                warn!(table, error = %e, "Table optimization failed");
                false
            }
        }
    }

    pub async fn table_row_count(&self, table: &str) -> Result<i64> {
        if !is_identifier(table) {
            return Err(Error::SchemaError(format!("invalid table name '{table}'")));
        }
        let outcome = self.execute_query(&format!("SELECT count(*) FROM {table}"), &[], true).await?;
        Ok(outcome.rows().and_then(QueryResult::scalar).and_then(SqlValue::as_i64).unwrap_or(0))
    }

    /// Rate-limited health check; calls inside the configured interval
    /// return the previous report.
    pub async fn health_check(&self) -> StoreHealthReport {
        {
            let cached = self.last_health.lock().await;
            if let Some((at, report)) = cached.as_ref() {
                if at.elapsed() < self.config.health_check_interval() {
                    return report.clone();
                }
            }
        }
        self.check_health_now().await
    }

    async fn check_health_now(&self) -> StoreHealthReport {
        let started = Instant::now();
        let probe = self.execute_query("SELECT 1", &[], true).await;
        let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        let pool = self.pool.stats().await;
        let total_tables = self.schemas.read().await.list_schemas().len();
        let counters = self.counters.lock().await.clone();

        let snapshot = HealthSnapshot {
            reachable: probe.is_ok(),
            response_time_ms,
            pool_usage_percent: pool.usage_percent(),
            active_connections: pool.active,
            total_queries: counters.total_queries,
            failed_queries: counters.failed_queries,
            avg_query_time_ms: counters.avg_query_time_ms,
            total_tables,
            disk_usage_percent: None,
            memory_usage_percent: None,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            last_error: probe.as_ref().err().map(|e| e.to_string()).or(counters.last_error),
        };
        let error = snapshot.last_error.clone().filter(|_| probe.is_err());

        let (status, new_alerts) = {
            let mut monitor = self.monitor.lock().await;
            let alerts = monitor.update_status(snapshot);
            (monitor.current_status().status, alerts)
        };
        metrics::gauge!("feedhub_store_pool_usage_percent", pool.usage_percent());

        let report = StoreHealthReport {
            healthy: probe.is_ok(),
            status,
            checked_at: Utc::now(),
            response_time_ms,
            total_tables,
            error,
            pool,
            new_alerts,
        };
        *self.last_health.lock().await = Some((Instant::now(), report.clone()));
        report
    }

    pub async fn health_summary(&self) -> HealthSummary {
        self.monitor.lock().await.health_summary()
    }

    pub async fn active_health_alerts(&self) -> Vec<HealthAlert> {
        self.monitor.lock().await.active_alerts()
    }

    pub async fn metrics(&self) -> StoreMetrics {
        let c = self.counters.lock().await.clone();
        StoreMetrics {
            total_queries: c.total_queries,
            successful_queries: c.successful_queries,
            failed_queries: c.failed_queries,
            total_inserts: c.total_inserts,
            total_records_inserted: c.total_records_inserted,
            avg_query_time_ms: c.avg_query_time_ms,
            last_error: c.last_error,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            schemas_registered: self.schemas.read().await.list_schemas().len(),
            pool: self.pool.stats().await,
        }
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }
}

/// Connector for the configured backend.
pub fn connector_for(config: &StoreConfig) -> Arc<dyn Connector> {
    match config.backend {
        | StoreBackend::Postgres => Arc::new(PgConnector::new(config)),
        | StoreBackend::Memory => Arc::new(MemoryBackend::new()),
    }
}

async fn insert_chunk(conn: &mut PooledConnection, sql: &str) -> std::result::Result<(), StoreError> {
    conn.begin().await?;
    conn.execute(sql, &[]).await?;
    conn.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDefinition, ColumnType};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn config() -> StoreConfig {
        StoreConfig {
            backend: StoreBackend::Memory,
            pool_size: 2,
            retry_attempts: 3,
            retry_delay_secs: 0.0,
            health_check_interval_secs: 0,
            ..StoreConfig::default()
        }
    }

    fn quotes_schema() -> TableSchema {
        TableSchema::new(
            "quotes",
            "timestamp",
            vec![
                ColumnDefinition::new("timestamp", ColumnType::Timestamp).not_null(),
                ColumnDefinition::symbol("symbol", 256),
                ColumnDefinition::new("price", ColumnType::Double).not_null(),
            ],
        )
        .unwrap()
    }

    fn record(price: serde_json::Value) -> RawRecord {
        json!({"timestamp": "2024-03-04T15:00:00Z", "symbol": "SPY", "price": price})
            .as_object()
            .cloned()
            .unwrap()
    }

    async fn manager() -> (StoreManager, MemoryBackend) {
        let backend = MemoryBackend::new();
        let manager = StoreManager::new(config(), Arc::new(backend.clone()));
        manager.initialize().await.unwrap();
        assert!(manager.create_table_from_schema(quotes_schema()).await);
        (manager, backend)
    }

    #[tokio::test]
    async fn create_table_is_idempotent() {
        let (manager, backend) = manager().await;
        assert!(manager.create_table_from_schema(quotes_schema()).await);
        assert_eq!(backend.table_names().await, vec!["quotes".to_string()]);
        assert_eq!(manager.list_schemas().await, vec!["quotes".to_string()]);
    }

    #[tokio::test]
    async fn invalid_records_are_isolated() {
        let (manager, backend) = manager().await;
        let records = vec![record(json!("12.5")), record(json!("abc")), record(json!(13.0))];
        let result = manager.execute_batch_insert("quotes", &records, 1000).await;

        assert!(result.success);
        assert_eq!(result.records_inserted, 2);
        assert_eq!(result.records_failed, 1);
        assert_eq!(result.records_invalid, 1);
        assert_eq!(backend.row_count("quotes").await, 2);
        assert_eq!(backend.rows("quotes").await[0][2], SqlValue::Double(12.5));
    }

    #[tokio::test]
    async fn all_invalid_reports_no_valid_records() {
        let (manager, backend) = manager().await;
        let result = manager.execute_batch_insert("quotes", &[record(json!("abc"))], 10).await;
        assert!(!result.success);
        assert_eq!(result.records_inserted, 0);
        assert_eq!(result.records_failed, 1);
        assert_eq!(result.error, Some(StoreError::NoValidRecords));
        assert_eq!(backend.row_count("quotes").await, 0);
    }

    #[tokio::test]
    async fn unknown_table_fails_fast() {
        let (manager, _) = manager().await;
        let result = manager.execute_batch_insert("nope", &[record(json!(1.0))], 10).await;
        assert_matches!(result.error, Some(StoreError::UnknownTable(t)) if t == "nope");
        assert_eq!(result.records_failed, 1);
    }

    #[tokio::test]
    async fn empty_batch_succeeds_trivially() {
        let (manager, _) = manager().await;
        let result = manager.execute_batch_insert("quotes", &[], 10).await;
        assert!(result.success);
        assert_eq!(result.records_inserted + result.records_failed, 0);
    }

    #[tokio::test]
    async fn transient_insert_failure_is_retried() {
        let (manager, backend) = manager().await;
        backend.fail_inserts(2).await;
        let records: Vec<_> = (0..5).map(|i| record(json!(i as f64))).collect();
        let result = manager.execute_batch_insert("quotes", &records, 10).await;

        assert!(result.success);
        assert_eq!(result.records_inserted, 5);
        assert_eq!(backend.rollbacks().await, 2);
        let m = manager.metrics().await;
        assert!(m.failed_queries >= 2);
        assert_eq!(m.total_records_inserted, 5);
    }

    #[tokio::test]
    async fn exhausted_chunk_keeps_earlier_chunks() {
        let (manager, backend) = manager().await;
        let records: Vec<_> = (0..5).map(|i| record(json!(i as f64))).collect();

        // first chunk of two commits, then every attempt on the second fails
        let first = manager.execute_batch_insert("quotes", &records[..2], 2).await;
        assert!(first.success);
        backend.fail_inserts(3).await;
        let result = manager.execute_batch_insert("quotes", &records[2..], 2).await;

        assert!(!result.success);
        assert_eq!(result.records_inserted, 0);
        assert_eq!(result.records_failed, 3);
        assert_matches!(result.error, Some(StoreError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(backend.row_count("quotes").await, 2);
    }

    #[tokio::test]
    async fn failure_mid_call_keeps_committed_chunks() {
        let (manager, backend) = manager().await;
        let records: Vec<_> = (0..5).map(|i| record(json!(i as f64))).collect();
        backend.fail_inserts_after(1, 3).await;

        let result = manager.execute_batch_insert("quotes", &records, 2).await;
        assert!(!result.success);
        assert_eq!(result.chunks_committed, 1);
        assert_eq!(result.records_inserted, 2);
        assert_eq!(result.records_failed, 3);
        assert_eq!(result.records_inserted + result.records_failed, records.len());
        assert_eq!(backend.row_count("quotes").await, 2);
    }

    #[tokio::test]
    async fn query_retries_then_gives_up() {
        let (manager, backend) = manager().await;
        backend.fail_queries(3).await;
        let err = manager.execute_query("SELECT count(*) FROM quotes", &[], true).await.unwrap_err();
        assert_matches!(err, StoreError::RetriesExhausted { attempts: 3, .. });

        backend.fail_queries(1).await;
        assert_eq!(manager.table_row_count("quotes").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_rollback_does_not_abort_query_retry() {
        let (manager, backend) = manager().await;
        backend.fail_queries(1).await;
        backend.fail_rollbacks(1).await;
        assert_eq!(manager.table_row_count("quotes").await.unwrap(), 0);
        assert_eq!(backend.rollbacks().await, 0);
    }

    #[tokio::test]
    async fn initialize_loads_existing_tables() {
        let backend = MemoryBackend::new();
        let first = StoreManager::new(config(), Arc::new(backend.clone()));
        first.initialize().await.unwrap();
        assert!(first.create_table_from_schema(quotes_schema()).await);

        let second = StoreManager::new(config(), Arc::new(backend.clone()));
        second.initialize().await.unwrap();
        let schema = second.schema("quotes").await.unwrap();
        assert_eq!(schema.timestamp_column, "timestamp");
        assert_eq!(schema.columns.len(), 3);
    }

    #[tokio::test]
    async fn initialize_fails_when_store_unreachable() {
        let backend = MemoryBackend::new();
        backend.fail_connects(10).await;
        let manager = StoreManager::new(config(), Arc::new(backend));
        assert!(manager.initialize().await.is_err());
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn health_check_is_rate_limited() {
        let backend = MemoryBackend::new();
        let cfg = StoreConfig { health_check_interval_secs: 3600, ..config() };
        let manager = StoreManager::new(cfg, Arc::new(backend.clone()));
        manager.initialize().await.unwrap();

        let before = backend.statements().await.len();
        let report = manager.health_check().await;
        assert!(report.healthy);
        assert_eq!(report.status, StoreHealthStatus::Healthy);
        assert_eq!(backend.statements().await.len(), before);
    }

    #[tokio::test]
    async fn optimize_and_count() {
        let (manager, _) = manager().await;
        manager.execute_batch_insert("quotes", &[record(json!(1.0))], 10).await;
        assert!(manager.optimize_table("quotes").await);
        assert!(!manager.optimize_table("quotes; DROP TABLE x").await);
        assert_eq!(manager.table_row_count("quotes").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_pool() {
        let (manager, _) = manager().await;
        manager.shutdown().await;
        assert!(!manager.is_initialized());
        assert_matches!(manager.execute_query("SELECT 1", &[], true).await, Err(StoreError::PoolClosed));
    }
}

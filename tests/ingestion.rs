use assert_matches::assert_matches;
use feedhub::config::{StoreBackend, StoreConfig};
use feedhub::schema::{ColumnDefinition, ColumnType, RawRecord, SqlValue, TableSchema};
use feedhub::store::{MemoryBackend, StoreManager};
use feedhub::utils::StoreError;
use rstest::rstest;
use serde_json::json;
use std::sync::Arc;

fn trades_schema() -> TableSchema {
    TableSchema::new(
        "trades",
        "timestamp",
        vec![
            ColumnDefinition::new("timestamp", ColumnType::Timestamp).not_null(),
            ColumnDefinition::symbol("symbol", 256),
            ColumnDefinition::new("price", ColumnType::Double).not_null(),
            ColumnDefinition::new("size", ColumnType::Long).with_default(0),
        ],
    )
    .unwrap()
}

fn trade(price: serde_json::Value) -> RawRecord {
    let value = json!({"timestamp": "2024-06-03T14:30:00Z", "symbol": "AAPL", "price": price});
    value.as_object().cloned().unwrap()
}

async fn store() -> (StoreManager, MemoryBackend) {
    let backend = MemoryBackend::new();
    let config = StoreConfig { backend: StoreBackend::Memory, retry_delay_secs: 0.0, ..StoreConfig::default() };
    let manager = StoreManager::new(config, Arc::new(backend.clone()));
    manager.initialize().await.unwrap();
    assert!(manager.create_table_from_schema(trades_schema()).await);
    (manager, backend)
}

#[tokio::test]
async fn unparsable_price_is_isolated_and_string_price_coerces() {
    let (manager, backend) = store().await;
    let result = manager.execute_batch_insert("trades", &[trade(json!("abc")), trade(json!("12.5"))], 100).await;

    assert!(result.success);
    assert_eq!(result.records_inserted, 1);
    assert_eq!(result.records_failed, 1);
    assert_eq!(result.records_invalid, 1);

    let rows = backend.rows("trades").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][2], SqlValue::Double(12.5));
    // default filled in for the missing size
    assert_eq!(rows[0][3], SqlValue::Long(0));
}

#[rstest]
#[case(7, 0, 3)]
#[case(7, 2, 3)]
#[case(10, 10, 4)]
#[case(1, 0, 1)]
#[tokio::test]
async fn inserted_plus_failed_covers_every_record(#[case] total: usize, #[case] invalid: usize, #[case] batch: usize) {
    let (manager, _) = store().await;
    let records: Vec<_> = (0..total)
        .map(|i| if i < invalid { trade(json!(null)) } else { trade(json!(i as f64)) })
        .collect();

    let result = manager.execute_batch_insert("trades", &records, batch).await;
    assert_eq!(result.records_inserted + result.records_failed, total);
    if result.records_inserted == 0 {
        assert_eq!(invalid, total);
        assert_matches!(result.error, Some(StoreError::NoValidRecords));
    } else {
        assert_eq!(result.records_inserted, total - invalid);
    }
}

#[tokio::test]
async fn retries_exhausted_mid_batch_is_at_least_once() {
    let (manager, backend) = store().await;
    let records: Vec<_> = (0..6).map(|i| trade(json!(100.0 + i as f64))).collect();
    backend.fail_inserts_after(2, 3).await;

    let result = manager.execute_batch_insert("trades", &records, 2).await;
    assert!(!result.success);
    assert_eq!(result.chunks_committed, 2);
    assert_eq!(result.records_inserted, 4);
    assert_eq!(result.records_failed, 2);
    assert_eq!(backend.row_count("trades").await, 4);
    assert_matches!(result.error, Some(StoreError::RetriesExhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn health_report_tracks_store_and_pool() {
    let (manager, _) = store().await;
    let report = manager.health_check().await;
    assert!(report.healthy);
    assert!(report.total_tables >= 1);

    let stats = manager.pool_stats().await;
    assert_eq!(stats.active, 0);
    assert!(stats.total_gets >= stats.total_puts);
}

#[tokio::test]
async fn column_named_like_values_keyword_inserts() {
    let (manager, backend) = store().await;
    let schema = TableSchema::new(
        "breadth",
        "timestamp",
        vec![
            ColumnDefinition::new("timestamp", ColumnType::Timestamp).not_null(),
            ColumnDefinition::new("total_values", ColumnType::Long),
        ],
    )
    .unwrap();
    assert!(manager.create_table_from_schema(schema).await);

    let record = json!({"timestamp": "2024-06-03T14:30:00Z", "total_values": 42});
    let result = manager.execute_batch_insert("breadth", &[record.as_object().cloned().unwrap()], 10).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.records_inserted, 1);
    assert_eq!(backend.rows("breadth").await[0][1], SqlValue::Long(42));
}

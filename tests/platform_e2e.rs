use async_trait::async_trait;
use feedhub::alerts::Severity;
use feedhub::config::{Config, ConfigManager, FeedConfig, StoreBackend, StoreConfig};
use feedhub::registry::{FeedCatalog, FeedConstructor, FeedStatus, Priority};
use feedhub::schema::standard::TELEMETRY_TABLE;
use feedhub::schema::{ColumnDefinition, ColumnType, RawRecord, TableSchema};
use feedhub::store::MemoryBackend;
use feedhub::{Error, Feed, Platform, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct SpotPrices;

#[async_trait]
impl Feed for SpotPrices {
    fn name(&self) -> &str {
        "spot"
    }

    fn category(&self) -> &str {
        "market_data"
    }

    fn priority(&self) -> Priority {
        Priority::Critical
    }

    fn define_schema(&self) -> Result<TableSchema> {
        TableSchema::new(
            "spot_prices",
            "timestamp",
            vec![
                ColumnDefinition::new("timestamp", ColumnType::Timestamp).not_null(),
                ColumnDefinition::symbol("symbol", 128),
                ColumnDefinition::new("last", ColumnType::Double).not_null(),
            ],
        )
    }

    async fn fetch_raw(&self) -> Result<Vec<RawRecord>> {
        let rows = json!([
            {"symbol": "SPY", "last": 512.3},
            {"symbol": "QQQ", "last": "441.10"},
            {"symbol": "IWM", "last": 201.0},
        ]);
        Ok(rows.as_array().into_iter().flatten().filter_map(|r| r.as_object().cloned()).collect())
    }
}

struct Unreachable;

#[async_trait]
impl Feed for Unreachable {
    fn name(&self) -> &str {
        "unreachable"
    }

    fn category(&self) -> &str {
        "news"
    }

    fn define_schema(&self) -> Result<TableSchema> {
        TableSchema::new(
            "headlines",
            "timestamp",
            vec![ColumnDefinition::new("timestamp", ColumnType::Timestamp), ColumnDefinition::new("title", ColumnType::String)],
        )
    }

    async fn fetch_raw(&self) -> Result<Vec<RawRecord>> {
        Err(Error::Other("connection refused".into()))
    }
}

fn spot(_: &FeedConfig) -> Result<Arc<dyn Feed>> {
    Ok(Arc::new(SpotPrices))
}

fn unreachable_feed(_: &FeedConfig) -> Result<Arc<dyn Feed>> {
    Ok(Arc::new(Unreachable))
}

fn config() -> Config {
    let mut config = Config {
        store: StoreConfig { backend: StoreBackend::Memory, retry_delay_secs: 0.0, ..StoreConfig::default() },
        ..Config::default()
    };
    config.registry.stagger_delay_ms = 0;
    config
}

fn config_manager() -> ConfigManager {
    let mut feeds = HashMap::new();
    let spot: toml::Table = toml::from_str("batch_size = 2\n\n[alerts]\nmin_records_per_execution = 10\n").unwrap();
    feeds.insert("spot".to_string(), spot);
    ConfigManager::from_tables(toml::Table::new(), toml::Table::new(), feeds)
}

async fn wait_for_runs(platform: &Platform, feed: &str, runs: u64) {
    for _ in 0..100 {
        if platform.registry().get(feed).await.map_or(false, |r| r.total_runs >= runs) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{feed} never completed {runs} run(s)");
}

#[tokio::test]
async fn discovered_feeds_collect_and_report_to_registry() {
    feedhub::utils::init_test_logging();
    let backend = MemoryBackend::new();
    let catalog = FeedCatalog::new()
        .with("spot", spot as FeedConstructor)
        .with("unreachable", unreachable_feed as FeedConstructor);
    let platform = tokio_test::assert_ok!(
        Platform::bootstrap_with(config(), config_manager(), &catalog, Arc::new(backend.clone())).await
    );
    assert_eq!(platform.discovery().registered, vec!["spot", "unreachable"]);

    let started = platform.start_all().await;
    assert_eq!(started.get("spot"), Some(&true));
    assert_eq!(started.get("unreachable"), Some(&true));

    wait_for_runs(&platform, "spot", 1).await;
    wait_for_runs(&platform, "unreachable", 1).await;

    let spot = platform.registry().get("spot").await.unwrap();
    assert_eq!(spot.status, FeedStatus::Healthy);
    assert_eq!(spot.descriptor.priority, Priority::Critical);
    assert_eq!(spot.metrics.as_ref().map(|m| m.records_processed), Some(3));
    assert_eq!(backend.row_count("spot_prices").await, 3);
    assert!(backend.row_count(TELEMETRY_TABLE).await >= 2);

    let broken = platform.registry().get("unreachable").await.unwrap();
    assert_eq!(broken.consecutive_failures, 1);
    assert!(broken.last_error.unwrap().contains("connection refused"));

    let alerts = platform.alerts().active_alerts().await;
    assert!(alerts
        .iter()
        .any(|a| a.feed_name == "spot" && a.message == "Low record count: 3 (min: 10)"));
    assert!(alerts
        .iter()
        .any(|a| a.feed_name == "unreachable" && a.severity == Severity::Error));

    platform.shutdown().await;
    assert_eq!(platform.registry().get("spot").await.unwrap().status, FeedStatus::Stopped);
    assert_eq!(platform.registry().get("unreachable").await.unwrap().status, FeedStatus::Stopped);
}

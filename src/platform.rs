//! Composition root: builds the store, alerting and registry once and
//! wires discovered feeds into them.

use crate::alerts::{AlertManager, StoreChannel};
use crate::config::{Config, ConfigManager};
use crate::registry::{DiscoveryContext, DiscoveryReport, FeedCatalog, FeedRegistry, SystemHealth};
use crate::store::{connector_for, Connector, StoreManager};
use crate::telemetry::prometheus;
use crate::utils::error::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Platform {
    config: Config,
    config_manager: ConfigManager,
    store: Arc<StoreManager>,
    alerts: Arc<AlertManager>,
    registry: Arc<FeedRegistry>,
    discovery: DiscoveryReport,
}

impl Platform {
    /// Connect to the configured store and register every enabled feed in
    /// `catalog`. Feeds are registered but not started.
    pub async fn bootstrap(config: Config, config_manager: ConfigManager, catalog: &FeedCatalog) -> Result<Self> {
        let connector = connector_for(&config.store);
        Self::bootstrap_with(config, config_manager, catalog, connector).await
    }

    pub async fn bootstrap_with(
        config: Config,
        config_manager: ConfigManager,
        catalog: &FeedCatalog,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        if config.telemetry.prometheus_enabled {
            prometheus::init()?;
        }

        let store = Arc::new(StoreManager::new(config.store.clone(), connector));
        store.initialize().await?;
        let created = store.ensure_standard_tables().await?;
        info!(created, "Standard tables ready");

        let alerts = Arc::new(
            AlertManager::new(config.alerts.clone()).with_channel(Arc::new(StoreChannel::new(Arc::clone(&store)))),
        );

        let registry = Arc::new(FeedRegistry::new(config.registry.clone()));
        registry.initialize().await;

        let discovery = catalog
            .discover(&DiscoveryContext {
                config: &config_manager,
                store: Arc::clone(&store),
                alerts: Arc::clone(&alerts),
                registry: &registry,
            })
            .await;
        for (feed, error) in &discovery.errors {
            warn!(%feed, %error, "Feed not registered");
        }

        info!(feeds = discovery.registered.len(), "Platform ready");
        Ok(Self { config, config_manager, store, alerts, registry, discovery })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_manager(&self) -> &ConfigManager {
        &self.config_manager
    }

    pub fn store(&self) -> &Arc<StoreManager> {
        &self.store
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn registry(&self) -> &Arc<FeedRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &DiscoveryReport {
        &self.discovery
    }

    /// Start every registered feed using the configured stagger.
    pub async fn start_all(&self) -> BTreeMap<String, bool> {
        self.registry.start_all(self.config.registry.stagger_delay()).await
    }

    pub async fn system_health(&self) -> SystemHealth {
        self.registry.system_health().await
    }

    /// Stop feeds and background loops, then close the store.
    pub async fn shutdown(&self) {
        let stopped = self.registry.shutdown().await;
        let failed = stopped.values().filter(|ok| !**ok).count();
        if failed > 0 {
            warn!(failed, "Some feeds did not stop cleanly");
        }
        self.store.shutdown().await;
        info!("Platform shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreBackend, StoreConfig};
    use crate::schema::standard::{ALERTS_TABLE, TELEMETRY_TABLE};
    use crate::store::MemoryBackend;

    fn memory_config() -> Config {
        Config {
            store: StoreConfig { backend: StoreBackend::Memory, retry_delay_secs: 0.0, ..StoreConfig::default() },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_creates_standard_tables() {
        let backend = MemoryBackend::new();
        let platform = Platform::bootstrap_with(
            memory_config(),
            ConfigManager::default(),
            &FeedCatalog::new(),
            Arc::new(backend.clone()),
        )
        .await
        .unwrap();

        let tables = backend.table_names().await;
        assert!(tables.contains(&TELEMETRY_TABLE.to_string()));
        assert!(tables.contains(&ALERTS_TABLE.to_string()));
        assert!(platform.registry().is_empty().await);
        assert!(platform.alerts().channel_names().contains(&"database".to_string()));

        platform.shutdown().await;
        assert_eq!(platform.system_health().await.total_feeds, 0);
    }

    #[tokio::test]
    async fn bootstrap_fails_when_store_is_down() {
        let backend = MemoryBackend::new();
        backend.fail_connects(10).await;
        let result =
            Platform::bootstrap_with(memory_config(), ConfigManager::default(), &FeedCatalog::new(), Arc::new(backend)).await;
        assert!(result.is_err());
    }
}

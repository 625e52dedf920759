use super::FeedPipeline;
use crate::registry::{FeedDescriptor, FeedHandle, FeedMetrics, FeedRegistry, FeedStatus};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives a [`FeedPipeline`] on its session-dependent interval and reports
/// every execution back to the registry.
pub struct FeedRunner {
    pipeline: Arc<FeedPipeline>,
    registry: Weak<FeedRegistry>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl FeedRunner {
    pub fn new(pipeline: Arc<FeedPipeline>, registry: Weak<FeedRegistry>) -> Self {
        Self { pipeline, registry, task: Mutex::new(None) }
    }

    pub fn pipeline(&self) -> &Arc<FeedPipeline> {
        &self.pipeline
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.as_ref().map_or(false, |(_, h)| !h.is_finished())
    }

    /// One execution plus its report to the registry.
    pub async fn run_once(pipeline: &FeedPipeline, registry: &Weak<FeedRegistry>) {
        let outcome = pipeline.collect().await;
        let Some(registry) = registry.upgrade() else {
            return;
        };
        let name = pipeline.name();
        match outcome {
            | Ok(result) => {
                let telemetry = pipeline.telemetry().await;
                let metrics = FeedMetrics {
                    success: result.success,
                    success_rate: telemetry.success_rate(),
                    execution_time_ms: result.execution_time_ms,
                    error_count: telemetry.failures,
                    records_processed: result.records_valid as u64,
                };
                if result.success {
                    registry.update_status(name, FeedStatus::Healthy, Some(metrics)).await;
                } else {
                    let message = result.error.unwrap_or_else(|| "store rejected records".to_string());
                    registry.record_error(name, &message).await;
                }
            }
            | Err(e) => registry.record_error(name, &e.to_string()).await,
        }
        registry.heartbeat(name).await;
    }
}

#[async_trait]
impl FeedHandle for FeedRunner {
    fn descriptor(&self) -> FeedDescriptor {
        self.pipeline.descriptor().clone()
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().map_or(false, |(_, h)| !h.is_finished()) {
            debug!(feed = %self.pipeline.name(), "Runner already started");
            return Ok(());
        }

        self.pipeline.initialize().await?;

        let token = CancellationToken::new();
        let child = token.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let registry = self.registry.clone();
        let ready = match self.registry.upgrade() {
            | Some(registry) => registry.start_signal(self.pipeline.name()).await,
            | None => None,
        };
        let handle = tokio::spawn(async move {
            if let Some(ready) = ready {
                tokio::select! {
                    _ = child.cancelled() => return,
                    _ = ready.notified() => {}
                }
            }
            info!(feed = %pipeline.name(), "Collection loop started");
            loop {
                FeedRunner::run_once(&pipeline, &registry).await;
                let wait = pipeline.next_interval();
                debug!(feed = %pipeline.name(), secs = wait.as_secs(), "Sleeping until next collection");
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            info!(feed = %pipeline.name(), "Collection loop stopped");
        });
        *task = Some((token, handle));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some((token, handle)) = self.task.lock().await.take() else {
            return Ok(());
        };
        token.cancel();
        if let Err(e) = handle.await {
            warn!(feed = %self.pipeline.name(), error = %e, "Collection loop ended abnormally");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertManager;
    use crate::config::{AlertsConfig, FeedConfig, RegistryConfig, StoreBackend, StoreConfig};
    use crate::feed::Feed;
    use crate::schema::{ColumnDefinition, ColumnType, RawRecord, TableSchema};
    use crate::store::{MemoryBackend, StoreManager};
    use serde_json::json;
    use std::time::Duration;

    struct Ticks;

    #[async_trait]
    impl Feed for Ticks {
        fn name(&self) -> &str {
            "ticks"
        }

        fn category(&self) -> &str {
            "market_data"
        }

        fn define_schema(&self) -> Result<TableSchema> {
            TableSchema::new(
                "ticks",
                "timestamp",
                vec![
                    ColumnDefinition::new("timestamp", ColumnType::Timestamp).not_null(),
                    ColumnDefinition::new("last", ColumnType::Double),
                ],
            )
        }

        async fn fetch_raw(&self) -> Result<Vec<RawRecord>> {
            Ok(json!({"last": 1.0}).as_object().cloned().into_iter().collect())
        }
    }

    /// Returns from `start` only after the collection loop has had time to run.
    struct SlowStart(Arc<FeedRunner>);

    #[async_trait]
    impl FeedHandle for SlowStart {
        fn descriptor(&self) -> FeedDescriptor {
            self.0.descriptor()
        }

        async fn start(&self) -> Result<()> {
            self.0.start().await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.0.stop().await
        }
    }

    async fn runner(registry: &Arc<FeedRegistry>) -> Arc<FeedRunner> {
        let store_cfg = StoreConfig { backend: StoreBackend::Memory, retry_delay_secs: 0.0, ..StoreConfig::default() };
        let store = Arc::new(StoreManager::new(store_cfg, Arc::new(MemoryBackend::new())));
        store.initialize().await.unwrap();
        let alerts = Arc::new(AlertManager::new(AlertsConfig::default()));
        let pipeline = FeedPipeline::new(Arc::new(Ticks), FeedConfig::default(), store, alerts).unwrap();
        Arc::new(FeedRunner::new(Arc::new(pipeline), Arc::downgrade(registry)))
    }

    #[tokio::test]
    async fn first_report_waits_for_registry_start() {
        let registry = Arc::new(FeedRegistry::new(RegistryConfig::default()));
        let runner = runner(&registry).await;
        registry.register(Arc::new(SlowStart(Arc::clone(&runner)))).await;

        assert!(registry.start("ticks").await);
        for _ in 0..100 {
            if registry.get("ticks").await.map_or(false, |r| r.total_runs >= 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let record = registry.get("ticks").await.unwrap();
        assert_eq!(record.total_runs, 1);
        assert_eq!(record.status, FeedStatus::Healthy);

        assert!(registry.stop("ticks").await);
        assert!(!runner.is_running().await);
    }

    #[tokio::test]
    async fn stop_before_start_signal_ends_loop() {
        let registry = Arc::new(FeedRegistry::new(RegistryConfig::default()));
        let runner = runner(&registry).await;
        registry.register(Arc::clone(&runner) as Arc<dyn FeedHandle>).await;

        // started directly, so the registry never signals
        runner.start().await.unwrap();
        runner.stop().await.unwrap();
        assert!(!runner.is_running().await);
        assert_eq!(registry.get("ticks").await.unwrap().total_runs, 0);
    }
}

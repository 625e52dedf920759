use super::{Alert, AlertChannel, Severity};
use crate::schema::standard::ALERTS_TABLE;
use crate::schema::RawRecord;
use crate::store::StoreManager;
use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Writes alerts to the process log at the alert's level.
pub struct ConsoleChannel;

#[async_trait]
impl AlertChannel for ConsoleChannel {
    fn name(&self) -> String {
        "console".to_string()
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        match alert.severity {
            | Severity::Info => info!(feed = %alert.feed_name, id = %alert.id, "[{}] {}", alert.feed_name, alert.message),
            | Severity::Warning => warn!(feed = %alert.feed_name, id = %alert.id, "[{}] {}", alert.feed_name, alert.message),
            | Severity::Error | Severity::Critical => {
                error!(feed = %alert.feed_name, id = %alert.id, severity = %alert.severity, "[{}] {}", alert.feed_name, alert.message)
            }
        }
        Ok(())
    }
}

/// POSTs each alert as JSON to a fixed URL.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build webhook client")?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> String {
        "webhook".to_string()
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let start = Instant::now();
        let resp = self.client.post(&self.url).json(alert).send().await;
        metrics::histogram!("feedhub_alert_webhook_ms", start.elapsed().as_millis() as f64);

        match resp {
            | Ok(r) if r.status().is_success() => Ok(()),
            | Ok(r) => {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                anyhow::bail!("webhook http {}: {}", status, body);
            }
            | Err(e) => Err(e).context("webhook request failed"),
        }
    }
}

/// Persists alerts as rows of the `telemetry_alerts` table.
pub struct StoreChannel {
    store: Arc<StoreManager>,
}

impl StoreChannel {
    pub fn new(store: Arc<StoreManager>) -> Self {
        Self { store }
    }

    fn row(alert: &Alert) -> RawRecord {
        let alert_type = alert
            .context
            .get("alert_type")
            .and_then(Value::as_str)
            .unwrap_or("feed")
            .to_string();
        let row = json!({
            "timestamp": alert.timestamp.to_rfc3339(),
            "feed_name": alert.feed_name,
            "alert_type": alert_type,
            "severity": alert.severity.as_str(),
            "message": alert.message,
            "value": alert.context.get("value").cloned().unwrap_or(Value::Null),
            "threshold": alert.context.get("threshold").cloned().unwrap_or(Value::Null),
            "resolved": alert.resolved,
            "host_name": crate::utils::host_name(),
        });
        match row {
            | Value::Object(map) => map,
            | _ => RawRecord::new(),
        }
    }
}

#[async_trait]
impl AlertChannel for StoreChannel {
    fn name(&self) -> String {
        "database".to_string()
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let result = self.store.execute_batch_insert(ALERTS_TABLE, &[Self::row(alert)], 1).await;
        match result.error {
            | None => Ok(()),
            | Some(e) => Err(e).context("store alert row"),
        }
    }
}

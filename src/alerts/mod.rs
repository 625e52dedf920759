//! Alert routing with per-severity cooldown.
//!
//! An alert is keyed by `feed:severity:alert_type`, falling back to the message
//! when the context carries no `alert_type`; repeating the same key inside its
//! severity's cooldown window is suppressed. Delivered alerts fan out to
//! the channels configured for their severity.

mod channels;

pub use channels::{ConsoleChannel, StoreChannel, WebhookChannel};

use crate::config::AlertsConfig;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            | Severity::Info => "info",
            | Severity::Warning => "warning",
            | Severity::Error => "error",
            | Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type AlertContext = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: String,
    pub feed_name: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub context: AlertContext,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A destination alerts can be delivered to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Name used in severity routing tables.
    fn name(&self) -> String;

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// What happened to one `send_alert` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertDispatch {
    /// Every routed channel accepted the alert.
    Delivered,
    /// Same key already fired inside its cooldown window.
    Suppressed,
    /// Alerting is switched off.
    Disabled,
    /// The alert was recorded but these channels rejected it.
    Failed(Vec<String>),
}

impl AlertDispatch {
    pub fn is_delivered(&self) -> bool {
        matches!(self, AlertDispatch::Delivered)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertStatistics {
    pub total: usize,
    pub active: usize,
    pub suppressed: u64,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_feed: BTreeMap<String, usize>,
}

#[derive(Default)]
struct AlertState {
    active: HashMap<String, Alert>,
    history: VecDeque<Alert>,
    cooldowns: HashMap<String, (Severity, DateTime<Utc>)>,
    suppressed: u64,
    sequence: u64,
}

pub struct AlertManager {
    config: AlertsConfig,
    channels: HashMap<String, Arc<dyn AlertChannel>>,
    state: Mutex<AlertState>,
}

impl AlertManager {
    /// Manager with the console channel, plus the webhook channel when a URL
    /// is configured.
    pub fn new(config: AlertsConfig) -> Self {
        let mut manager = Self { config, channels: HashMap::new(), state: Mutex::new(AlertState::default()) };
        manager.add_channel(Arc::new(ConsoleChannel));
        if let Some(url) = manager.config.webhook_url.clone() {
            match WebhookChannel::new(url, Duration::from_secs(manager.config.webhook_timeout_secs)) {
                | Ok(webhook) => manager.add_channel(Arc::new(webhook)),
                | Err(e) => error!(error = %e, "Webhook channel disabled"),
            }
        }
        manager
    }

    pub fn with_channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.add_channel(channel);
        self
    }

    pub fn add_channel(&mut self, channel: Arc<dyn AlertChannel>) {
        self.channels.insert(channel.name(), channel);
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn cooldown(&self, severity: Severity) -> ChronoDuration {
        let c = &self.config.cooldown_minutes;
        let minutes = match severity {
            | Severity::Info => c.info,
            | Severity::Warning => c.warning,
            | Severity::Error => c.error,
            | Severity::Critical => c.critical,
        };
        ChronoDuration::minutes(minutes as i64)
    }

    fn routes(&self, severity: Severity) -> &[String] {
        let r = &self.config.severity_routing;
        match severity {
            | Severity::Info => &r.info,
            | Severity::Warning => &r.warning,
            | Severity::Error => &r.error,
            | Severity::Critical => &r.critical,
        }
    }

    pub async fn send_alert(&self, feed: &str, severity: Severity, message: &str, context: AlertContext) -> AlertDispatch {
        self.send_alert_at(feed, severity, message, context, Utc::now()).await
    }

    pub async fn send_alert_at(
        &self,
        feed: &str,
        severity: Severity,
        message: &str,
        context: AlertContext,
        now: DateTime<Utc>,
    ) -> AlertDispatch {
        if !self.config.enabled {
            return AlertDispatch::Disabled;
        }

        let condition = context.get("alert_type").and_then(|v| v.as_str()).unwrap_or(message);
        let key = format!("{feed}:{severity}:{condition}");
        let cooldown = self.cooldown(severity);
        let alert = {
            let mut state = self.state.lock().await;
            state.cooldowns.retain(|_, (sev, last)| now < *last + self.cooldown(*sev));
            if let Some((_, last)) = state.cooldowns.get(&key) {
                if cooldown > ChronoDuration::zero() && now < *last + cooldown {
                    state.suppressed += 1;
                    debug!(%key, "Alert suppressed by cooldown");
                    return AlertDispatch::Suppressed;
                }
            }

            state.sequence += 1;
            let alert = Alert {
                id: format!("{feed}_{}_{}", now.timestamp(), state.sequence),
                feed_name: feed.to_string(),
                severity,
                message: message.to_string(),
                timestamp: now,
                context,
                resolved: false,
                resolved_at: None,
            };
            state.active.insert(alert.id.clone(), alert.clone());
            state.history.push_back(alert.clone());
            while state.history.len() > self.config.max_history.max(1) {
                if let Some(dropped) = state.history.pop_front() {
                    state.active.remove(&dropped.id);
                }
            }
            state.cooldowns.insert(key, (severity, now));
            alert
        };
        metrics::counter!("feedhub_alerts_total", 1, "severity" => severity.as_str());

        let routed: Vec<_> = self
            .routes(severity)
            .iter()
            .filter_map(|name| {
                let channel = self.channels.get(name);
                if channel.is_none() {
                    warn!(channel = %name, "Alert routed to unknown channel");
                }
                channel.map(|c| (name, c))
            })
            .collect();
        let deliveries = routed.iter().map(|(name, channel)| {
            let alert = &alert;
            async move { (*name, channel.deliver(alert).await) }
        });

        let mut failures = Vec::new();
        for (name, outcome) in futures::future::join_all(deliveries).await {
            if let Err(e) = outcome {
                error!(channel = %name, error = %e, "Alert delivery failed");
                failures.push(format!("{name}: {e}"));
            }
        }

        if failures.is_empty() {
            AlertDispatch::Delivered
        } else {
            AlertDispatch::Failed(failures)
        }
    }

    /// Mark an active alert resolved. Returns `false` for unknown ids.
    pub async fn resolve(&self, alert_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(mut alert) = state.active.remove(alert_id) else {
            return false;
        };
        let now = Utc::now();
        alert.resolved = true;
        alert.resolved_at = Some(now);
        if let Some(past) = state.history.iter_mut().find(|a| a.id == alert_id) {
            past.resolved = true;
            past.resolved_at = Some(now);
        }
        true
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<_> = self.state.lock().await.active.values().cloned().collect();
        alerts.sort_by_key(|a| a.timestamp);
        alerts
    }

    pub async fn history(&self) -> Vec<Alert> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    pub async fn statistics(&self) -> AlertStatistics {
        let state = self.state.lock().await;
        let mut by_severity = BTreeMap::new();
        let mut by_feed = BTreeMap::new();
        for alert in &state.history {
            *by_severity.entry(alert.severity).or_insert(0) += 1;
            *by_feed.entry(alert.feed_name.clone()).or_insert(0) += 1;
        }
        AlertStatistics {
            total: state.history.len(),
            active: state.active.len(),
            suppressed: state.suppressed,
            by_severity,
            by_feed,
        }
    }
}

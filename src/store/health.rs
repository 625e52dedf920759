//! Threshold classifier over store health snapshots.

use crate::alerts::Severity;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tracing::{info, warn};

const MAX_HISTORY: usize = 1000;
const ALERT_COOLDOWN_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthMetric {
    ResponseTimeMs,
    PoolUsage,
    SuccessRate,
    ConsecutiveFailures,
    DiskUsage,
    MemoryUsage,
}

impl HealthMetric {
    pub const ALL: [HealthMetric; 6] = [
        HealthMetric::ResponseTimeMs,
        HealthMetric::PoolUsage,
        HealthMetric::SuccessRate,
        HealthMetric::ConsecutiveFailures,
        HealthMetric::DiskUsage,
        HealthMetric::MemoryUsage,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            | HealthMetric::ResponseTimeMs => "response_time_ms",
            | HealthMetric::PoolUsage => "connection_pool_usage",
            | HealthMetric::SuccessRate => "success_rate",
            | HealthMetric::ConsecutiveFailures => "consecutive_failures",
            | HealthMetric::DiskUsage => "disk_usage_percent",
            | HealthMetric::MemoryUsage => "memory_usage_percent",
        }
    }

    /// Lower values are worse.
    pub fn reversed(&self) -> bool {
        matches!(self, HealthMetric::SuccessRate)
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.key() == key)
    }
}

impl fmt::Display for HealthMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
    pub description: &'static str,
}

impl Threshold {
    fn new(warning: f64, critical: f64, description: &'static str) -> Self {
        Self { warning, critical, description }
    }
}

pub fn default_thresholds() -> BTreeMap<HealthMetric, Threshold> {
    BTreeMap::from([
        (HealthMetric::ResponseTimeMs, Threshold::new(1000.0, 5000.0, "Store response time in milliseconds")),
        (HealthMetric::PoolUsage, Threshold::new(70.0, 90.0, "Connection pool usage percentage")),
        (HealthMetric::SuccessRate, Threshold::new(95.0, 90.0, "Query success rate percentage")),
        (HealthMetric::ConsecutiveFailures, Threshold::new(3.0, 5.0, "Consecutive failed health checks")),
        (HealthMetric::DiskUsage, Threshold::new(80.0, 90.0, "Disk usage percentage")),
        (HealthMetric::MemoryUsage, Threshold::new(80.0, 90.0, "Memory usage percentage")),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
    #[default]
    Unknown,
}

impl fmt::Display for StoreHealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            | StoreHealthStatus::Healthy => "healthy",
            | StoreHealthStatus::Degraded => "degraded",
            | StoreHealthStatus::Unhealthy => "unhealthy",
            | StoreHealthStatus::Critical => "critical",
            | StoreHealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Raw observations handed to the monitor by the store manager.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub reachable: bool,
    pub response_time_ms: f64,
    pub pool_usage_percent: f64,
    pub active_connections: usize,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub avg_query_time_ms: f64,
    pub total_tables: usize,
    pub disk_usage_percent: Option<f64>,
    pub memory_usage_percent: Option<f64>,
    pub uptime_seconds: f64,
    pub last_error: Option<String>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            reachable: true,
            response_time_ms: 0.0,
            pool_usage_percent: 0.0,
            active_connections: 0,
            total_queries: 0,
            failed_queries: 0,
            avg_query_time_ms: 0.0,
            total_tables: 0,
            disk_usage_percent: None,
            memory_usage_percent: None,
            uptime_seconds: 0.0,
            last_error: None,
        }
    }
}

impl HealthSnapshot {
    /// Percentage of successful queries, 100 when nothing has run yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_queries == 0 {
            100.0
        } else {
            (self.total_queries.saturating_sub(self.failed_queries)) as f64 / self.total_queries as f64 * 100.0
        }
    }
}

/// Point-in-time classification of a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub timestamp: DateTime<Utc>,
    pub status: StoreHealthStatus,
    pub response_time_ms: f64,
    pub pool_usage_percent: f64,
    pub active_connections: usize,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub success_rate: f64,
    pub avg_query_time_ms: f64,
    pub total_tables: usize,
    pub consecutive_failures: u32,
    pub disk_usage_percent: Option<f64>,
    pub memory_usage_percent: Option<f64>,
    pub uptime_seconds: f64,
    pub last_error: Option<String>,
    pub alerts: Vec<HealthAlert>,
}

impl HealthMetrics {
    fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            status: StoreHealthStatus::Unknown,
            response_time_ms: 0.0,
            pool_usage_percent: 0.0,
            active_connections: 0,
            total_queries: 0,
            failed_queries: 0,
            success_rate: 100.0,
            avg_query_time_ms: 0.0,
            total_tables: 0,
            consecutive_failures: 0,
            disk_usage_percent: None,
            memory_usage_percent: None,
            uptime_seconds: 0.0,
            last_error: None,
            alerts: Vec::new(),
        }
    }

    pub fn value(&self, metric: HealthMetric) -> Option<f64> {
        match metric {
            | HealthMetric::ResponseTimeMs => Some(self.response_time_ms),
            | HealthMetric::PoolUsage => Some(self.pool_usage_percent),
            | HealthMetric::SuccessRate => Some(self.success_rate),
            | HealthMetric::ConsecutiveFailures => Some(self.consecutive_failures as f64),
            | HealthMetric::DiskUsage => self.disk_usage_percent,
            | HealthMetric::MemoryUsage => self.memory_usage_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAlert {
    pub metric: HealthMetric,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertCounts {
    pub active: usize,
    pub warning: usize,
    pub critical: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: StoreHealthStatus,
    pub timestamp: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub last_successful_check: Option<DateTime<Utc>>,
    pub avg_response_time_1h: f64,
    pub avg_success_rate_1h: f64,
    pub alerts: AlertCounts,
    pub active_alerts: Vec<HealthAlert>,
}

pub struct StoreHealthMonitor {
    thresholds: BTreeMap<HealthMetric, Threshold>,
    current: HealthMetrics,
    history: VecDeque<HealthMetrics>,
    active: HashMap<HealthMetric, HealthAlert>,
    resolved: VecDeque<HealthAlert>,
    consecutive_failures: u32,
    last_successful_check: Option<DateTime<Utc>>,
    cooldown: ChronoDuration,
}

impl Default for StoreHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreHealthMonitor {
    pub fn new() -> Self {
        Self {
            thresholds: default_thresholds(),
            current: HealthMetrics::empty(Utc::now()),
            history: VecDeque::new(),
            active: HashMap::new(),
            resolved: VecDeque::new(),
            consecutive_failures: 0,
            last_successful_check: None,
            cooldown: ChronoDuration::minutes(ALERT_COOLDOWN_MINUTES),
        }
    }

    pub fn thresholds(&self) -> &BTreeMap<HealthMetric, Threshold> {
        &self.thresholds
    }

    pub fn update_thresholds(&mut self, metric: HealthMetric, warning: f64, critical: f64) {
        if let Some(t) = self.thresholds.get_mut(&metric) {
            t.warning = warning;
            t.critical = critical;
        }
    }

    pub fn update_status(&mut self, snapshot: HealthSnapshot) -> Vec<HealthAlert> {
        self.update_status_at(snapshot, Utc::now())
    }

    /// Classify `snapshot`, fire and resolve alerts, and append to history.
    /// Returns the alerts newly raised by this update.
    pub fn update_status_at(&mut self, snapshot: HealthSnapshot, now: DateTime<Utc>) -> Vec<HealthAlert> {
        if snapshot.reachable {
            self.consecutive_failures = 0;
            self.last_successful_check = Some(now);
        } else {
            self.consecutive_failures += 1;
        }

        let mut metrics = HealthMetrics {
            timestamp: now,
            status: StoreHealthStatus::Unknown,
            response_time_ms: snapshot.response_time_ms,
            pool_usage_percent: snapshot.pool_usage_percent,
            active_connections: snapshot.active_connections,
            total_queries: snapshot.total_queries,
            failed_queries: snapshot.failed_queries,
            success_rate: snapshot.success_rate(),
            avg_query_time_ms: snapshot.avg_query_time_ms,
            total_tables: snapshot.total_tables,
            consecutive_failures: self.consecutive_failures,
            disk_usage_percent: snapshot.disk_usage_percent,
            memory_usage_percent: snapshot.memory_usage_percent,
            uptime_seconds: snapshot.uptime_seconds,
            last_error: snapshot.last_error,
            alerts: Vec::new(),
        };
        metrics.status = self.classify(&metrics, snapshot.reachable);

        let fired = self.fire_alerts(&metrics, now);
        self.resolve_alerts(&metrics, now);
        metrics.alerts = fired.clone();

        if metrics.status != self.current.status {
            info!(from = %self.current.status, to = %metrics.status, "Store health status changed");
        }
        self.current = metrics.clone();
        self.history.push_back(metrics);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
        fired
    }

    fn breach(&self, metric: HealthMetric, value: f64) -> Option<(Severity, f64)> {
        let t = self.thresholds.get(&metric)?;
        let (crit, warn) = if metric.reversed() {
            (value <= t.critical, value <= t.warning)
        } else {
            (value >= t.critical, value >= t.warning)
        };
        if crit {
            Some((Severity::Critical, t.critical))
        } else if warn {
            Some((Severity::Warning, t.warning))
        } else {
            None
        }
    }

    fn classify(&self, metrics: &HealthMetrics, reachable: bool) -> StoreHealthStatus {
        if !reachable {
            return StoreHealthStatus::Critical;
        }
        let levels: Vec<Severity> = HealthMetric::ALL
            .into_iter()
            .filter_map(|m| metrics.value(m).and_then(|v| self.breach(m, v)).map(|(s, _)| s))
            .collect();
        let critical = levels.iter().filter(|s| **s == Severity::Critical).count();
        match critical {
            | 0 if levels.is_empty() => StoreHealthStatus::Healthy,
            | 0 => StoreHealthStatus::Degraded,
            | 1 => StoreHealthStatus::Unhealthy,
            | _ => StoreHealthStatus::Critical,
        }
    }

    fn fire_alerts(&mut self, metrics: &HealthMetrics, now: DateTime<Utc>) -> Vec<HealthAlert> {
        let mut fired = Vec::new();
        for metric in HealthMetric::ALL {
            let Some(value) = metrics.value(metric) else { continue };
            if let Some(existing) = self.active.get(&metric) {
                if now - existing.created_at < self.cooldown {
                    continue;
                }
            }
            let Some((severity, threshold)) = self.breach(metric, value) else { continue };
            let description = self.thresholds.get(&metric).map(|t| t.description).unwrap_or_default();
            let alert = HealthAlert {
                metric,
                severity,
                message: format!("{description}: {value:.2}"),
                value,
                threshold,
                created_at: now,
                resolved_at: None,
            };
            warn!(metric = %metric, severity = %severity, value, threshold, "Store health alert");
            self.active.insert(metric, alert.clone());
            fired.push(alert);
        }
        fired
    }

    fn resolve_alerts(&mut self, metrics: &HealthMetrics, now: DateTime<Utc>) {
        let mut cleared = Vec::new();
        for metric in self.active.keys() {
            let (Some(value), Some(t)) = (metrics.value(*metric), self.thresholds.get(metric)) else { continue };
            let recovered = if metric.reversed() { value > t.warning } else { value < t.warning };
            if recovered {
                cleared.push(*metric);
            }
        }
        for metric in cleared {
            if let Some(mut alert) = self.active.remove(&metric) {
                info!(metric = %metric, value = metrics.value(metric), "Store health alert resolved");
                alert.resolved_at = Some(now);
                self.resolved.push_back(alert);
                while self.resolved.len() > MAX_HISTORY {
                    self.resolved.pop_front();
                }
            }
        }
    }

    pub fn current_status(&self) -> &HealthMetrics {
        &self.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn active_alerts(&self) -> Vec<HealthAlert> {
        let mut alerts: Vec<_> = self.active.values().cloned().collect();
        alerts.sort_by_key(|a| a.metric);
        alerts
    }

    pub fn resolved_alerts(&self) -> impl Iterator<Item = &HealthAlert> {
        self.resolved.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn status_history(&self, hours: i64) -> Vec<&HealthMetrics> {
        self.status_history_since(Utc::now() - ChronoDuration::hours(hours))
    }

    pub fn status_history_since(&self, cutoff: DateTime<Utc>) -> Vec<&HealthMetrics> {
        self.history.iter().filter(|m| m.timestamp >= cutoff).collect()
    }

    pub fn health_summary(&self) -> HealthSummary {
        self.health_summary_at(Utc::now())
    }

    pub fn health_summary_at(&self, now: DateTime<Utc>) -> HealthSummary {
        let recent = self.status_history_since(now - ChronoDuration::hours(1));
        let (avg_rt, avg_sr) = if recent.is_empty() {
            (0.0, 100.0)
        } else {
            let n = recent.len() as f64;
            (
                recent.iter().map(|m| m.response_time_ms).sum::<f64>() / n,
                recent.iter().map(|m| m.success_rate).sum::<f64>() / n,
            )
        };
        let active_alerts = self.active_alerts();
        HealthSummary {
            status: self.current.status,
            timestamp: self.current.timestamp,
            consecutive_failures: self.consecutive_failures,
            last_successful_check: self.last_successful_check,
            avg_response_time_1h: avg_rt,
            avg_success_rate_1h: avg_sr,
            alerts: AlertCounts {
                active: active_alerts.len(),
                warning: active_alerts.iter().filter(|a| a.severity == Severity::Warning).count(),
                critical: active_alerts.iter().filter(|a| a.severity == Severity::Critical).count(),
            },
            active_alerts,
        }
    }
}

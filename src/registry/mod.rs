//! Central directory of feeds: lifecycle, priority-ordered start/stop,
//! heartbeat supervision and the system-wide health aggregate.

pub mod catalog;
pub mod state;

pub use catalog::{DiscoveryContext, DiscoveryReport, FeedCatalog, FeedConstructor};
pub use state::{transition, FeedEvent, FeedStatus, Priority, TransitionError};

use crate::config::RegistryConfig;
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Failures in a row that force a feed to `Degraded`.
pub const DEGRADED_FAILURES: u32 = 3;
/// Failures in a row that force a feed to `Unhealthy`.
pub const UNHEALTHY_FAILURES: u32 = 5;

const MAX_RECENT_ERRORS: usize = 100;

/// Identity of a feed as the registry sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedDescriptor {
    pub name: String,
    pub category: String,
    pub market_type: String,
    pub priority: Priority,
}

/// The registry's control surface over one feed instance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedHandle: Send + Sync {
    fn descriptor(&self) -> FeedDescriptor;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// What a feed reports after a successful execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedMetrics {
    pub success: bool,
    pub success_rate: f64,
    pub execution_time_ms: f64,
    pub error_count: u64,
    pub records_processed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedRecord {
    #[serde(flatten)]
    pub descriptor: FeedDescriptor,
    pub status: FeedStatus,
    pub registered_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub recent_errors: Vec<ErrorEntry>,
    pub consecutive_failures: u32,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub health_score: f64,
    pub metrics: Option<FeedMetrics>,
}

impl FeedRecord {
    fn new(descriptor: FeedDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            descriptor,
            status: FeedStatus::Registered,
            registered_at: now,
            start_time: None,
            last_heartbeat: None,
            error_count: 0,
            last_error: None,
            recent_errors: Vec::new(),
            consecutive_failures: 0,
            total_runs: 0,
            successful_runs: 0,
            health_score: 100.0,
            metrics: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            100.0
        } else {
            self.successful_runs as f64 / self.total_runs as f64 * 100.0
        }
    }

    /// Apply `event` through the status machine. Illegal events are logged
    /// and leave the status unchanged.
    fn apply(&mut self, event: FeedEvent) -> bool {
        match transition(self.status, event) {
            | Ok(next) => {
                if next != self.status {
                    debug!(feed = %self.descriptor.name, from = %self.status, to = %next, "Status change");
                }
                self.status = next;
                true
            }
            | Err(e) => {
                warn!(feed = %self.descriptor.name, error = %e, "Rejected status change");
                false
            }
        }
    }

    fn push_error(&mut self, message: &str, now: DateTime<Utc>) {
        self.error_count += 1;
        self.last_error = Some(message.to_string());
        self.recent_errors.push(ErrorEntry { at: now, message: message.to_string() });
        if self.recent_errors.len() > MAX_RECENT_ERRORS {
            let excess = self.recent_errors.len() - MAX_RECENT_ERRORS;
            self.recent_errors.drain(..excess);
        }
    }

    fn refresh_score(&mut self) {
        let exec_secs = self.metrics.as_ref().map_or(0.0, |m| m.execution_time_ms / 1000.0);
        self.health_score = health_score(self.success_rate(), exec_secs, self.error_count);
    }
}

/// 100, less half the failure percentage, less a latency penalty (10 over
/// 5s, 20 over 10s), less 5 per error capped at 30. Clamped to [0, 100].
pub fn health_score(success_rate_pct: f64, last_execution_secs: f64, error_count: u64) -> f64 {
    let mut score = 100.0;
    score -= 0.5 * (100.0 - success_rate_pct);
    if last_execution_secs > 10.0 {
        score -= 20.0;
    } else if last_execution_secs > 5.0 {
        score -= 10.0;
    }
    score -= (5.0 * error_count as f64).min(30.0);
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

/// Optional narrowing for [`FeedRegistry::list_feeds`].
#[derive(Debug, Clone, Default)]
pub struct FeedFilter {
    pub category: Option<String>,
    pub status: Option<FeedStatus>,
    pub priority: Option<Priority>,
}

impl FeedFilter {
    fn matches(&self, record: &FeedRecord) -> bool {
        self.category.as_deref().map_or(true, |c| record.descriptor.category == c)
            && self.status.map_or(true, |s| record.status == s)
            && self.priority.map_or(true, |p| record.descriptor.priority == p)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub timestamp: DateTime<Utc>,
    pub total_feeds: usize,
    pub running_feeds: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub average_health_score: f64,
    pub uptime_secs: i64,
}

struct Entry {
    seq: u64,
    record: FeedRecord,
    handle: Arc<dyn FeedHandle>,
    /// Signalled once the registry has applied `Started`.
    started: Arc<Notify>,
}

pub struct FeedRegistry {
    config: RegistryConfig,
    feeds: RwLock<HashMap<String, Entry>>,
    next_seq: std::sync::atomic::AtomicU64,
    started_at: DateTime<Utc>,
    background: Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
}

impl FeedRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            feeds: RwLock::new(HashMap::new()),
            next_seq: std::sync::atomic::AtomicU64::new(0),
            started_at: Utc::now(),
            background: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Add a feed. Re-registering a name replaces the previous entry.
    pub async fn register(&self, handle: Arc<dyn FeedHandle>) -> bool {
        let descriptor = handle.descriptor();
        let name = descriptor.name.clone();
        let seq = self.next_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let entry = Entry {
            seq,
            record: FeedRecord::new(descriptor, Utc::now()),
            handle,
            started: Arc::new(Notify::new()),
        };

        let replaced = self.feeds.write().await.insert(name.clone(), entry);
        if replaced.is_some() {
            warn!(feed = %name, "Feed already registered, overwriting");
        } else {
            info!(feed = %name, "Registered feed");
        }
        metrics::gauge!("feedhub_registered_feeds", self.feeds.read().await.len() as f64);
        true
    }

    /// Remove a feed, stopping it first when it is active.
    pub async fn unregister(&self, name: &str) -> bool {
        let active = match self.feeds.read().await.get(name) {
            | Some(entry) => entry.record.status.is_active(),
            | None => {
                warn!(feed = %name, "Cannot unregister unknown feed");
                return false;
            }
        };
        if active {
            self.stop(name).await;
        }
        let removed = self.feeds.write().await.remove(name).is_some();
        if removed {
            info!(feed = %name, "Unregistered feed");
        }
        removed
    }

    /// Notified each time `name` finishes starting. Handles that report
    /// back wait on it so their first report lands after `Started`.
    pub async fn start_signal(&self, name: &str) -> Option<Arc<Notify>> {
        self.feeds.read().await.get(name).map(|e| Arc::clone(&e.started))
    }

    pub async fn start(&self, name: &str) -> bool {
        let handle = {
            let mut feeds = self.feeds.write().await;
            let Some(entry) = feeds.get_mut(name) else {
                error!(feed = %name, "Cannot start unknown feed");
                return false;
            };
            let status = entry.record.status;
            if status.is_running() || status == FeedStatus::Starting {
                debug!(feed = %name, %status, "Feed already running");
                return true;
            }
            if !entry.record.apply(FeedEvent::StartRequested) {
                return false;
            }
            Arc::clone(&entry.handle)
        };

        info!(feed = %name, "Starting feed");
        let outcome = handle.start().await;

        let now = Utc::now();
        let mut feeds = self.feeds.write().await;
        let Some(entry) = feeds.get_mut(name) else {
            warn!(feed = %name, "Feed unregistered while starting");
            return false;
        };
        let record = &mut entry.record;
        match outcome {
            | Ok(()) => {
                record.apply(FeedEvent::Started);
                record.start_time = Some(now);
                record.last_heartbeat = Some(now);
                entry.started.notify_one();
                info!(feed = %name, "Feed started");
                true
            }
            | Err(e) => {
                record.apply(FeedEvent::StartFailed);
                record.push_error(&format!("Start failed: {e}"), now);
                record.refresh_score();
                error!(feed = %name, error = %e, "Feed failed to start");
                false
            }
        }
    }

    pub async fn stop(&self, name: &str) -> bool {
        let handle = {
            let mut feeds = self.feeds.write().await;
            let Some(entry) = feeds.get_mut(name) else {
                error!(feed = %name, "Cannot stop unknown feed");
                return false;
            };
            match entry.record.status {
                | FeedStatus::Registered | FeedStatus::Stopped => {
                    debug!(feed = %name, "Feed not running");
                    return true;
                }
                | FeedStatus::Stopping => return true,
                | _ => {}
            }
            if !entry.record.apply(FeedEvent::StopRequested) {
                return false;
            }
            Arc::clone(&entry.handle)
        };

        info!(feed = %name, "Stopping feed");
        let outcome = handle.stop().await;

        let mut feeds = self.feeds.write().await;
        let Some(entry) = feeds.get_mut(name) else {
            return true;
        };
        let record = &mut entry.record;
        match outcome {
            | Ok(()) => {
                record.apply(FeedEvent::Stopped);
                info!(feed = %name, "Feed stopped");
                true
            }
            | Err(e) => {
                record.apply(FeedEvent::StopFailed);
                record.push_error(&format!("Stop failed: {e}"), Utc::now());
                record.refresh_score();
                error!(feed = %name, error = %e, "Feed failed to stop");
                false
            }
        }
    }

    pub async fn restart(&self, name: &str) -> bool {
        info!(feed = %name, "Restarting feed");
        if !self.stop(name).await {
            return false;
        }
        let delay = self.config.restart_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.start(name).await
    }

    /// Names in start order: priority class, then registration order.
    async fn ordered_names(&self, filter: &FeedFilter) -> Vec<String> {
        let feeds = self.feeds.read().await;
        let mut entries: Vec<_> = feeds.values().filter(|e| filter.matches(&e.record)).collect();
        entries.sort_by_key(|e| (e.record.descriptor.priority, e.seq));
        entries.into_iter().map(|e| e.record.descriptor.name.clone()).collect()
    }

    async fn start_in_order(&self, names: Vec<String>, stagger: Duration) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for (i, name) in names.into_iter().enumerate() {
            if i > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            let ok = self.start(&name).await;
            results.insert(name, ok);
        }
        let started = results.values().filter(|ok| **ok).count();
        info!(started, total = results.len(), "Started feeds");
        results
    }

    /// Start every feed, critical first, pausing `stagger` between starts.
    pub async fn start_all(&self, stagger: Duration) -> BTreeMap<String, bool> {
        let names = self.ordered_names(&FeedFilter::default()).await;
        self.start_in_order(names, stagger).await
    }

    pub async fn start_feeds_by_category(&self, category: &str, stagger: Duration) -> BTreeMap<String, bool> {
        let filter = FeedFilter { category: Some(category.to_string()), ..FeedFilter::default() };
        let names = self.ordered_names(&filter).await;
        self.start_in_order(names, stagger).await
    }

    /// Stop every feed in reverse start order.
    pub async fn stop_all(&self) -> BTreeMap<String, bool> {
        let mut names = self.ordered_names(&FeedFilter::default()).await;
        names.reverse();
        let mut results = BTreeMap::new();
        for name in names {
            let ok = self.stop(&name).await;
            results.insert(name, ok);
        }
        results
    }

    /// Record a report from a feed. Metrics count as one run; a successful
    /// run clears the consecutive-failure counter.
    pub async fn update_status(&self, name: &str, status: FeedStatus, metrics: Option<FeedMetrics>) {
        let mut feeds = self.feeds.write().await;
        let Some(entry) = feeds.get_mut(name) else {
            warn!(feed = %name, "Status update for unknown feed");
            return;
        };
        let record = &mut entry.record;
        let now = Utc::now();

        if let Some(m) = metrics {
            record.total_runs += 1;
            if m.success {
                record.successful_runs += 1;
                record.consecutive_failures = 0;
            } else {
                record.consecutive_failures += 1;
            }
            record.metrics = Some(m);
        }
        record.last_heartbeat = Some(now);

        if record.status != status {
            record.apply(FeedEvent::Report(status));
        }
        apply_failure_threshold(record);
        record.refresh_score();
        metrics::gauge!("feedhub_feed_health_score", record.health_score, "feed" => name.to_string());
    }

    /// Record a failed execution.
    pub async fn record_error(&self, name: &str, message: &str) {
        let mut feeds = self.feeds.write().await;
        let Some(entry) = feeds.get_mut(name) else {
            warn!(feed = %name, "Error reported for unknown feed");
            return;
        };
        let record = &mut entry.record;
        record.push_error(message, Utc::now());
        record.total_runs += 1;
        record.consecutive_failures += 1;
        apply_failure_threshold(record);
        record.refresh_score();
        warn!(
            feed = %name,
            consecutive = record.consecutive_failures,
            error = %message,
            "Feed reported error"
        );
        metrics::counter!("feedhub_feed_errors_total", 1, "feed" => name.to_string());
    }

    pub async fn heartbeat(&self, name: &str) {
        if let Some(entry) = self.feeds.write().await.get_mut(name) {
            entry.record.last_heartbeat = Some(Utc::now());
        }
    }

    /// Mark silent running feeds unhealthy. Returns the names affected.
    pub async fn check_heartbeats_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = ChronoDuration::from_std(self.config.heartbeat_timeout()).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let mut timed_out = Vec::new();
        let mut feeds = self.feeds.write().await;
        for entry in feeds.values_mut() {
            let record = &mut entry.record;
            if !matches!(record.status, FeedStatus::Running | FeedStatus::Healthy | FeedStatus::Degraded) {
                continue;
            }
            let Some(last) = record.last_heartbeat else { continue };
            if now - last > timeout && record.apply(FeedEvent::HeartbeatTimeout) {
                warn!(feed = %record.descriptor.name, last_heartbeat = %last, "Heartbeat timeout");
                timed_out.push(record.descriptor.name.clone());
            }
        }
        timed_out
    }

    /// Drop recent-error entries older than the retention window.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let retention = ChronoDuration::from_std(self.config.error_retention()).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let cutoff = now - retention;
        let mut pruned = 0;
        for entry in self.feeds.write().await.values_mut() {
            let before = entry.record.recent_errors.len();
            entry.record.recent_errors.retain(|e| e.at >= cutoff);
            pruned += before - entry.record.recent_errors.len();
        }
        if pruned > 0 {
            debug!(pruned, "Pruned old feed errors");
        }
        pruned
    }

    pub async fn get(&self, name: &str) -> Option<FeedRecord> {
        self.feeds.read().await.get(name).map(|e| e.record.clone())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.feeds.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.feeds.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.feeds.read().await.is_empty()
    }

    /// Matching feeds in start order.
    pub async fn list_feeds(&self, filter: &FeedFilter) -> Vec<FeedRecord> {
        let feeds = self.feeds.read().await;
        let mut entries: Vec<_> = feeds.values().filter(|e| filter.matches(&e.record)).collect();
        entries.sort_by_key(|e| (e.record.descriptor.priority, e.seq));
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    pub async fn feeds_by_category(&self, category: &str) -> Vec<FeedRecord> {
        self.list_feeds(&FeedFilter { category: Some(category.to_string()), ..FeedFilter::default() })
            .await
    }

    pub async fn feeds_by_priority(&self, priority: Priority) -> Vec<FeedRecord> {
        self.list_feeds(&FeedFilter { priority: Some(priority), ..FeedFilter::default() }).await
    }

    pub async fn system_health(&self) -> SystemHealth {
        let now = Utc::now();
        let feeds = self.feeds.read().await;
        let mut status_counts: BTreeMap<String, usize> =
            FeedStatus::ALL.iter().map(|s| (s.as_str().to_string(), 0)).collect();
        let mut score_total = 0.0;
        let mut running = 0;
        for entry in feeds.values() {
            *status_counts.entry(entry.record.status.as_str().to_string()).or_default() += 1;
            score_total += entry.record.health_score;
            if entry.record.status.is_running() {
                running += 1;
            }
        }
        SystemHealth {
            timestamp: now,
            total_feeds: feeds.len(),
            running_feeds: running,
            status_counts,
            average_health_score: if feeds.is_empty() { 100.0 } else { score_total / feeds.len() as f64 },
            uptime_secs: (now - self.started_at).num_seconds(),
        }
    }

    /// Spawn the heartbeat and cleanup loops. Calling twice is a no-op.
    pub async fn initialize(self: &Arc<Self>) {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let heartbeat = spawn_periodic(
            Arc::downgrade(self),
            token.clone(),
            self.config.health_check_interval(),
            |registry| async move {
                registry.check_heartbeats_at(Utc::now()).await;
            },
        );
        let cleanup = spawn_periodic(
            Arc::downgrade(self),
            token.clone(),
            self.config.cleanup_interval(),
            |registry| async move {
                registry.cleanup_at(Utc::now()).await;
            },
        );
        *background = Some((token, vec![heartbeat, cleanup]));
        info!("Feed registry initialized");
    }

    /// Cancel background loops and stop every feed.
    pub async fn shutdown(&self) -> BTreeMap<String, bool> {
        if let Some((token, handles)) = self.background.lock().await.take() {
            token.cancel();
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Registry background task ended abnormally");
                }
            }
        }
        let results = self.stop_all().await;
        info!(feeds = results.len(), "Feed registry shut down");
        results
    }
}

fn apply_failure_threshold(record: &mut FeedRecord) {
    let target = if record.consecutive_failures >= UNHEALTHY_FAILURES {
        FeedStatus::Unhealthy
    } else if record.consecutive_failures >= DEGRADED_FAILURES {
        FeedStatus::Degraded
    } else {
        return;
    };
    if record.status != target && record.status != FeedStatus::Unhealthy {
        record.apply(FeedEvent::FailureThreshold(target));
    }
}

fn spawn_periodic<F, Fut>(registry: Weak<FeedRegistry>, token: CancellationToken, every: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<FeedRegistry>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let every = every.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let Some(registry) = registry.upgrade() else { break };
                    tick(registry).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::Error;
    use rstest::rstest;

    fn descriptor(name: &str, priority: Priority) -> FeedDescriptor {
        FeedDescriptor {
            name: name.to_string(),
            category: "market_data".to_string(),
            market_type: "stock_market".to_string(),
            priority,
        }
    }

    fn handle(name: &str, priority: Priority) -> MockFeedHandle {
        let d = descriptor(name, priority);
        let mut mock = MockFeedHandle::new();
        mock.expect_descriptor().returning(move || d.clone());
        mock.expect_start().returning(|| Ok(()));
        mock.expect_stop().returning(|| Ok(()));
        mock
    }

    fn registry() -> FeedRegistry {
        FeedRegistry::new(RegistryConfig { restart_delay_ms: 0, ..RegistryConfig::default() })
    }

    fn ok_metrics() -> FeedMetrics {
        FeedMetrics { success: true, success_rate: 100.0, execution_time_ms: 50.0, error_count: 0, records_processed: 10 }
    }

    #[tokio::test]
    async fn start_and_stop_walk_the_lifecycle() {
        let r = registry();
        r.register(Arc::new(handle("vix", Priority::High))).await;
        assert_eq!(r.get("vix").await.unwrap().status, FeedStatus::Registered);

        assert!(r.start("vix").await);
        let rec = r.get("vix").await.unwrap();
        assert_eq!(rec.status, FeedStatus::Running);
        assert!(rec.start_time.is_some());

        // idempotent in both directions
        assert!(r.start("vix").await);
        assert!(r.stop("vix").await);
        assert!(r.stop("vix").await);
        assert_eq!(r.get("vix").await.unwrap().status, FeedStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_of_never_started_feed_is_ok() {
        let r = registry();
        let mut mock = MockFeedHandle::new();
        let d = descriptor("idle", Priority::Low);
        mock.expect_descriptor().returning(move || d.clone());
        mock.expect_stop().never();
        r.register(Arc::new(mock)).await;
        assert!(r.stop("idle").await);
    }

    #[tokio::test]
    async fn start_failure_is_recorded_not_raised() {
        let r = registry();
        let d = descriptor("broken", Priority::Medium);
        let mut mock = MockFeedHandle::new();
        mock.expect_descriptor().returning(move || d.clone());
        mock.expect_start().returning(|| Err(Error::Other("no api key".into())));
        r.register(Arc::new(mock)).await;

        assert!(!r.start("broken").await);
        let rec = r.get("broken").await.unwrap();
        assert_eq!(rec.status, FeedStatus::Error);
        assert_eq!(rec.error_count, 1);
        assert!(rec.last_error.unwrap().contains("no api key"));
    }

    #[tokio::test]
    async fn unknown_feeds_return_false() {
        let r = registry();
        assert!(!r.start("nope").await);
        assert!(!r.stop("nope").await);
        assert!(!r.unregister("nope").await);
    }

    #[tokio::test]
    async fn register_overwrites_and_unregister_stops() {
        let r = registry();
        r.register(Arc::new(handle("a", Priority::Low))).await;
        r.register(Arc::new(handle("a", Priority::Critical))).await;
        assert_eq!(r.len().await, 1);
        assert_eq!(r.get("a").await.unwrap().descriptor.priority, Priority::Critical);

        r.start("a").await;
        assert!(r.unregister("a").await);
        assert!(r.is_empty().await);
    }

    #[tokio::test]
    async fn consecutive_failures_degrade_then_fail_then_reset() {
        let r = registry();
        r.register(Arc::new(handle("q", Priority::High))).await;
        r.start("q").await;

        for _ in 0..3 {
            r.record_error("q", "timeout").await;
        }
        assert_eq!(r.get("q").await.unwrap().status, FeedStatus::Degraded);

        for _ in 0..2 {
            r.record_error("q", "timeout").await;
        }
        let rec = r.get("q").await.unwrap();
        assert_eq!(rec.status, FeedStatus::Unhealthy);
        assert_eq!(rec.consecutive_failures, 5);

        r.update_status("q", FeedStatus::Healthy, Some(ok_metrics())).await;
        let rec = r.get("q").await.unwrap();
        assert_eq!(rec.consecutive_failures, 0);
        assert_eq!(rec.status, FeedStatus::Healthy);
    }

    #[tokio::test]
    async fn illegal_report_leaves_status() {
        let r = registry();
        r.register(Arc::new(handle("q", Priority::High))).await;
        r.update_status("q", FeedStatus::Healthy, None).await;
        assert_eq!(r.get("q").await.unwrap().status, FeedStatus::Registered);
    }

    #[tokio::test]
    async fn start_all_orders_by_priority_and_stop_all_reverses() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let r = registry();
        for (name, p) in [("low", Priority::Low), ("crit", Priority::Critical), ("mid", Priority::Medium)] {
            let d = descriptor(name, p);
            let log = Arc::clone(&order);
            let stop_log = Arc::clone(&order);
            let n = name.to_string();
            let sn = format!("stop:{name}");
            let mut mock = MockFeedHandle::new();
            mock.expect_descriptor().returning(move || d.clone());
            mock.expect_start().returning(move || {
                log.lock().unwrap().push(n.clone());
                Ok(())
            });
            mock.expect_stop().returning(move || {
                stop_log.lock().unwrap().push(sn.clone());
                Ok(())
            });
            r.register(Arc::new(mock)).await;
        }

        let results = r.start_all(Duration::ZERO).await;
        assert!(results.values().all(|ok| *ok));
        r.stop_all().await;
        assert_eq!(
            *order.lock().unwrap(),
            vec!["crit", "mid", "low", "stop:low", "stop:mid", "stop:crit"]
        );
    }

    #[tokio::test]
    async fn heartbeat_timeout_marks_unhealthy() {
        let r = registry();
        r.register(Arc::new(handle("q", Priority::High))).await;
        r.start("q").await;

        assert!(r.check_heartbeats_at(Utc::now()).await.is_empty());
        let later = Utc::now() + ChronoDuration::seconds(301);
        assert_eq!(r.check_heartbeats_at(later).await, vec!["q".to_string()]);
        assert_eq!(r.get("q").await.unwrap().status, FeedStatus::Unhealthy);
        // already unhealthy: not reported again
        assert!(r.check_heartbeats_at(later).await.is_empty());
    }

    #[tokio::test]
    async fn cleanup_prunes_old_errors() {
        let r = registry();
        r.register(Arc::new(handle("q", Priority::High))).await;
        r.record_error("q", "old").await;
        let later = Utc::now() + ChronoDuration::days(2);
        assert_eq!(r.cleanup_at(later).await, 1);
        let rec = r.get("q").await.unwrap();
        assert!(rec.recent_errors.is_empty());
        assert_eq!(rec.error_count, 1);
    }

    #[tokio::test]
    async fn system_health_aggregates() {
        let r = registry();
        assert_eq!(r.system_health().await.average_health_score, 100.0);

        r.register(Arc::new(handle("a", Priority::High))).await;
        r.register(Arc::new(handle("b", Priority::Low))).await;
        r.start("a").await;
        r.record_error("b", "boom").await;

        let h = r.system_health().await;
        assert_eq!(h.total_feeds, 2);
        assert_eq!(h.running_feeds, 1);
        assert_eq!(h.status_counts["running"], 1);
        assert_eq!(h.status_counts["registered"], 1);
        // b: 0% success -> -50, one error -> -5
        assert_eq!(h.average_health_score, (100.0 + 45.0) / 2.0);
    }

    #[tokio::test]
    async fn queries_filter_and_order() {
        let r = registry();
        r.register(Arc::new(handle("b", Priority::Low))).await;
        r.register(Arc::new(handle("a", Priority::Critical))).await;
        let names: Vec<_> = r.list_feeds(&FeedFilter::default()).await.into_iter().map(|f| f.descriptor.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(r.feeds_by_priority(Priority::Low).await.len(), 1);
        assert_eq!(r.feeds_by_category("market_data").await.len(), 2);
        assert!(r.feeds_by_category("news").await.is_empty());
    }

    #[tokio::test]
    async fn background_loops_stop_on_shutdown() {
        let r = Arc::new(FeedRegistry::new(RegistryConfig {
            health_check_interval_secs: 1,
            cleanup_interval_secs: 1,
            ..RegistryConfig::default()
        }));
        r.initialize().await;
        r.initialize().await;
        r.register(Arc::new(handle("q", Priority::High))).await;
        r.start("q").await;
        let results = r.shutdown().await;
        assert_eq!(results.get("q"), Some(&true));
        assert_eq!(r.get("q").await.unwrap().status, FeedStatus::Stopped);
    }

    #[rstest]
    #[case(100.0, 0.0, 0, 100.0)]
    #[case(80.0, 6.0, 1, 75.0)]
    #[case(50.0, 11.0, 2, 45.0)]
    #[case(0.0, 60.0, 100, 0.0)]
    #[case(f64::NEG_INFINITY, 0.0, 0, 0.0)]
    fn health_score_is_clamped(#[case] rate: f64, #[case] secs: f64, #[case] errors: u64, #[case] expected: f64) {
        assert_eq!(health_score(rate, secs, errors), expected);
    }
}

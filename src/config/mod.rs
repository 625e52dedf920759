//! Configuration module for the ingestion platform

mod manager;

use crate::registry::Priority;
use crate::utils::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub use manager::{deep_merge, ConfigManager};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Time-series store connection and retry settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Feed registry timing
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Alert routing and cooldowns
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Metrics export
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Which store implementation backs the connection pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// PostgreSQL wire protocol (QuestDB, TimescaleDB)
    #[default]
    Postgres,
    /// In-process tables, for dry runs
    Memory,
}

/// Time-series store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_host")]
    pub host: String,
    #[serde(default = "default_store_port")]
    pub port: u16,
    #[serde(default = "default_store_database")]
    pub database: String,
    #[serde(default = "default_store_user")]
    pub user: String,
    #[serde(default = "default_store_password")]
    pub password: String,
    /// Maximum concurrently checked-out connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Attempts per insert chunk or query before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    /// Minimum spacing between real health probes
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs.max(0.0))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// libpq-style connection string
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} connect_timeout={}",
            self.host, self.port, self.database, self.user, self.password, self.connect_timeout_secs
        )
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            host: default_store_host(),
            port: default_store_port(),
            database: default_store_database(),
            user: default_store_user(),
            password: default_store_password(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            batch_size: default_batch_size(),
        }
    }
}

/// Feed registry timing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    /// Period of the background heartbeat check
    #[serde(default = "default_registry_health_interval_secs")]
    pub health_check_interval_secs: u64,
    /// A running feed silent for longer than this is marked unhealthy
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Delay between consecutive starts in `start_all`
    #[serde(default = "default_stagger_delay_ms")]
    pub stagger_delay_ms: u64,
    /// Pause between stop and start on restart
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// How long per-feed error entries survive cleanup
    #[serde(default = "default_error_retention_secs")]
    pub error_retention_secs: u64,
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn error_retention(&self) -> Duration {
        Duration::from_secs(self.error_retention_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_registry_health_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            stagger_delay_ms: default_stagger_delay_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            error_retention_secs: default_error_retention_secs(),
        }
    }
}

/// Cooldown per severity in minutes; 0 disables suppression
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CooldownMinutes {
    #[serde(default = "default_info_cooldown")]
    pub info: u64,
    #[serde(default = "default_warning_cooldown")]
    pub warning: u64,
    #[serde(default = "default_error_cooldown")]
    pub error: u64,
    #[serde(default = "default_critical_cooldown")]
    pub critical: u64,
}

impl Default for CooldownMinutes {
    fn default() -> Self {
        Self {
            info: default_info_cooldown(),
            warning: default_warning_cooldown(),
            error: default_error_cooldown(),
            critical: default_critical_cooldown(),
        }
    }
}

/// Channel names per severity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeverityRouting {
    #[serde(default = "default_channels")]
    pub info: Vec<String>,
    #[serde(default = "default_channels")]
    pub warning: Vec<String>,
    #[serde(default = "default_channels")]
    pub error: Vec<String>,
    #[serde(default = "default_channels")]
    pub critical: Vec<String>,
}

impl Default for SeverityRouting {
    fn default() -> Self {
        Self {
            info: default_channels(),
            warning: default_channels(),
            error: default_channels(),
            critical: default_channels(),
        }
    }
}

/// Alert manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_minutes: CooldownMinutes,
    #[serde(default)]
    pub severity_routing: SeverityRouting,
    /// Target of the `webhook` channel
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    #[serde(default = "default_alert_history")]
    pub max_history: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_minutes: CooldownMinutes::default(),
            severity_routing: SeverityRouting::default(),
            webhook_url: None,
            webhook_timeout_secs: default_webhook_timeout_secs(),
            max_history: default_alert_history(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TelemetryConfig {
    /// Install the Prometheus recorder at bootstrap
    #[serde(default)]
    pub prometheus_enabled: bool,
}

/// Poll intervals per market session, in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionIntervals {
    #[serde(default = "default_market_interval")]
    pub market_hours_secs: u64,
    #[serde(default = "default_extended_interval")]
    pub extended_hours_secs: u64,
    #[serde(default = "default_off_hours_interval")]
    pub off_hours_secs: u64,
}

impl Default for CollectionIntervals {
    fn default() -> Self {
        Self {
            market_hours_secs: default_market_interval(),
            extended_hours_secs: default_extended_interval(),
            off_hours_secs: default_off_hours_interval(),
        }
    }
}

/// Record acceptance rules applied after schema coercion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationRules {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Reject (rather than warn about) records breaking a rule
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default = "default_max_null_percentage")]
    pub max_null_percentage: f64,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            enabled: true,
            strict_mode: false,
            required_fields: Vec::new(),
            max_null_percentage: default_max_null_percentage(),
        }
    }
}

/// Per-execution alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertThresholds {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: f64,
    #[serde(default = "default_min_quality_score")]
    pub min_data_quality_score: f64,
    #[serde(default)]
    pub min_records_per_execution: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            enabled: true,
            max_execution_time_ms: default_max_execution_time_ms(),
            min_data_quality_score: default_min_quality_score(),
            min_records_per_execution: 0,
        }
    }
}

/// Settings for a single feed, layered over the feed defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub market_type: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub intervals: CollectionIntervals,
    #[serde(default)]
    pub validation: ValidationRules,
    #[serde(default)]
    pub alerts: AlertThresholds,
    /// Persist one telemetry row per execution
    #[serde(default = "default_true")]
    pub telemetry_enabled: bool,
    /// Health check warns when the last execution is older than this
    #[serde(default = "default_max_execution_age_secs")]
    pub max_execution_age_secs: u64,
    /// Source-specific settings, passed through untouched
    #[serde(default)]
    pub settings: toml::Table,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            category: None,
            market_type: None,
            priority: None,
            batch_size: default_batch_size(),
            intervals: CollectionIntervals::default(),
            validation: ValidationRules::default(),
            alerts: AlertThresholds::default(),
            telemetry_enabled: true,
            max_execution_age_secs: default_max_execution_age_secs(),
            settings: toml::Table::new(),
        }
    }
}

// --------- Helper default functions for serde ---------
fn default_true() -> bool {
    true
}
fn default_store_host() -> String {
    "localhost".to_string()
}
fn default_store_port() -> u16 {
    8812
}
fn default_store_database() -> String {
    "qdb".to_string()
}
fn default_store_user() -> String {
    "admin".to_string()
}
fn default_store_password() -> String {
    "quest".to_string()
}
fn default_pool_size() -> usize {
    10
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_secs() -> f64 {
    1.0
}
fn default_health_check_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    1000
}
fn default_registry_health_interval_secs() -> u64 {
    60
}
fn default_heartbeat_timeout_secs() -> u64 {
    300
}
fn default_cleanup_interval_secs() -> u64 {
    3600
}
fn default_stagger_delay_ms() -> u64 {
    1_000
}
fn default_restart_delay_ms() -> u64 {
    2_000
}
fn default_error_retention_secs() -> u64 {
    86_400
}
fn default_info_cooldown() -> u64 {
    60
}
fn default_warning_cooldown() -> u64 {
    30
}
fn default_error_cooldown() -> u64 {
    15
}
fn default_critical_cooldown() -> u64 {
    5
}
fn default_channels() -> Vec<String> {
    vec!["console".to_string()]
}
fn default_webhook_timeout_secs() -> u64 {
    10
}
fn default_alert_history() -> usize {
    1000
}
fn default_market_interval() -> u64 {
    180
}
fn default_extended_interval() -> u64 {
    600
}
fn default_off_hours_interval() -> u64 {
    1800
}
fn default_max_null_percentage() -> f64 {
    15.0
}
fn default_max_execution_time_ms() -> f64 {
    30_000.0
}
fn default_min_quality_score() -> f64 {
    90.0
}
fn default_max_execution_age_secs() -> u64 {
    3600
}

impl Config {
    /// Serialize config to a TOML string
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load configuration from a specific file path
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {:?}: {}", path.as_ref(), e))
        })?;
        let mut cfg: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config file: {}", e)))?;
        cfg.merge_env()?;
        Ok(cfg)
    }

    /// Save the configuration to a file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }
        std::fs::write(path, content).map_err(|e| {
            Error::ConfigError(format!("Failed to write config file {:?}: {}", path, e))
        })?;
        Ok(())
    }

    /// Validate the configuration for required fields and reasonable values
    pub fn validate(&self) -> Result<()> {
        let store = &self.store;
        if store.backend == StoreBackend::Postgres && store.host.trim().is_empty() {
            return Err(Error::ConfigError("store.host must be set".to_string()));
        }
        if store.pool_size == 0 {
            return Err(Error::ConfigError("store.pool_size must be > 0".to_string()));
        }
        if store.retry_attempts == 0 {
            return Err(Error::ConfigError("store.retry_attempts must be > 0".to_string()));
        }
        if store.batch_size == 0 {
            return Err(Error::ConfigError("store.batch_size must be > 0".to_string()));
        }
        if store.connect_timeout_secs == 0 {
            return Err(Error::ConfigError("store.connect_timeout_secs must be > 0".to_string()));
        }
        if !store.retry_delay_secs.is_finite() || store.retry_delay_secs < 0.0 {
            return Err(Error::ConfigError("store.retry_delay_secs must be >= 0".to_string()));
        }
        if self.registry.heartbeat_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "registry.heartbeat_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.registry.health_check_interval_secs == 0 || self.registry.cleanup_interval_secs == 0 {
            return Err(Error::ConfigError(
                "registry loop intervals must be > 0".to_string(),
            ));
        }
        if self.alerts.max_history == 0 {
            return Err(Error::ConfigError("alerts.max_history must be > 0".to_string()));
        }
        Ok(())
    }

    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        if std::path::Path::new("feedhub.toml").exists() {
            return Self::from_file("feedhub.toml");
        }

        if let Some(mut path) = dirs::config_dir() {
            path.push("feedhub");
            path.push("feedhub.toml");
            if path.exists() {
                return Self::from_file(path);
            }
        }

        let mut config = Self::default();
        config.merge_env()?;
        Ok(config)
    }

    /// Merge environment variables into the configuration
    pub fn merge_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("FEEDHUB_STORE_HOST") {
            self.store.host = host;
        }
        if let Ok(port) = env::var("FEEDHUB_STORE_PORT") {
            self.store.port = port
                .parse()
                .map_err(|_| Error::ConfigError(format!("FEEDHUB_STORE_PORT is not a port: {port}")))?;
        }
        if let Ok(database) = env::var("FEEDHUB_STORE_DATABASE") {
            self.store.database = database;
        }
        if let Ok(user) = env::var("FEEDHUB_STORE_USER") {
            self.store.user = user;
        }
        if let Ok(password) = env::var("FEEDHUB_STORE_PASSWORD") {
            self.store.password = password;
        }
        if let Ok(size) = env::var("FEEDHUB_STORE_POOL_SIZE") {
            self.store.pool_size = size.parse().map_err(|_| {
                Error::ConfigError(format!("FEEDHUB_STORE_POOL_SIZE is not a number: {size}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.port, 8812);
        assert_eq!(config.store.pool_size, 10);
        assert_eq!(config.store.retry_attempts, 3);
        assert_eq!(config.registry.heartbeat_timeout_secs, 300);
        assert_eq!(config.alerts.severity_routing.error, vec!["console".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_save_and_load_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("feedhub.toml");

        let mut config = Config::default();
        config.store.host = "questdb.internal".to_string();
        config.store.backend = StoreBackend::Memory;

        config.save(&config_path).unwrap();

        let loaded = Config::from_file(&config_path).unwrap();
        assert_eq!(loaded.store.host, "questdb.internal");
        assert_eq!(loaded.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let cfg: Config = toml::from_str("[store]\npool_size = 4\n").unwrap();
        assert_eq!(cfg.store.pool_size, 4);
        assert_eq!(cfg.store.database, "qdb");
        assert_eq!(cfg.registry, RegistryConfig::default());
    }

    #[test]
    #[serial]
    fn test_merge_env() {
        temp_env::with_vars(
            vec![
                ("FEEDHUB_STORE_HOST", Some("db.example")),
                ("FEEDHUB_STORE_PORT", Some("9000")),
                ("FEEDHUB_STORE_POOL_SIZE", Some("3")),
            ],
            || {
                let mut config = Config::default();
                config.merge_env().unwrap();

                assert_eq!(config.store.host, "db.example");
                assert_eq!(config.store.port, 9000);
                assert_eq!(config.store.pool_size, 3);
            },
        );
    }

    #[test]
    #[serial]
    fn test_merge_env_rejects_bad_port() {
        temp_env::with_var("FEEDHUB_STORE_PORT", Some("not-a-port"), || {
            let mut config = Config::default();
            assert!(config.merge_env().is_err());
        });
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let mut config = Config::default();
        config.store.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_feed_config_defaults() {
        let feed: FeedConfig = toml::from_str("priority = \"critical\"\n[validation]\nstrict_mode = true\n").unwrap();
        assert_eq!(feed.priority, Some(Priority::Critical));
        assert!(feed.validation.strict_mode);
        assert_eq!(feed.validation.max_null_percentage, 15.0);
        assert_eq!(feed.intervals.market_hours_secs, 180);
        assert_eq!(feed.alerts.max_execution_time_ms, 30_000.0);
        assert_eq!(feed.batch_size, 1000);
    }
}

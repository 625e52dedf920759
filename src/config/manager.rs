//! Layered configuration: a global file with per-environment overrides, feed
//! defaults, and one optional file per feed.
//!
//! ```text
//! <root>/global/system.toml
//! <root>/feeds/feed_defaults.toml
//! <root>/feeds/<feed_name>.toml
//! ```

use super::{Config, FeedConfig};
use crate::utils::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const ENV_VAR: &str = "FEEDHUB_ENV";
const DEFAULTS_FILE: &str = "feed_defaults";

/// Recursively overlay `overrides` onto `base`. Tables merge key by key;
/// every other value replaces what was there.
pub fn deep_merge(base: &mut toml::Table, overrides: &toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(key), value) {
            | (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                deep_merge(existing, incoming);
            }
            | _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Immutable snapshot of every configuration layer, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    root: PathBuf,
    environment: String,
    global: toml::Table,
    feed_defaults: toml::Table,
    feeds: HashMap<String, toml::Table>,
}

impl ConfigManager {
    /// Load all layers under `root`, picking the environment from `FEEDHUB_ENV`.
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Self> {
        let environment = std::env::var(ENV_VAR).unwrap_or_else(|_| "production".to_string());
        Self::load_for_env(root, environment)
    }

    pub fn load_for_env<P: AsRef<Path>>(root: P, environment: impl Into<String>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let environment = environment.into();
        info!(root = %root.display(), %environment, "Loading configuration layers");

        let mut global = read_table(&root.join("global").join("system.toml"))?.unwrap_or_else(|| {
            warn!("Global config file not found under {}", root.display());
            toml::Table::new()
        });
        if let Some(toml::Value::Table(envs)) = global.remove("environments") {
            if let Some(toml::Value::Table(overrides)) = envs.get(&environment) {
                debug!(%environment, keys = overrides.len(), "Applying environment overrides");
                deep_merge(&mut global, overrides);
            }
        }

        let feeds_dir = root.join("feeds");
        let feed_defaults = read_table(&feeds_dir.join(format!("{DEFAULTS_FILE}.toml")))?.unwrap_or_else(|| {
            warn!("Default feed config not found under {}", feeds_dir.display());
            toml::Table::new()
        });

        let mut feeds = HashMap::new();
        if feeds_dir.is_dir() {
            for entry in std::fs::read_dir(&feeds_dir)? {
                let path = entry?.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if path.extension().and_then(|e| e.to_str()) != Some("toml") || stem == DEFAULTS_FILE {
                    continue;
                }
                if let Some(table) = read_table(&path)? {
                    let mut merged = feed_defaults.clone();
                    deep_merge(&mut merged, &table);
                    feeds.insert(stem.to_string(), merged);
                }
            }
        }
        info!(feeds = feeds.len(), "Configuration loaded");

        Ok(Self { root, environment, global, feed_defaults, feeds })
    }

    /// Build directly from tables, without touching the filesystem.
    pub fn from_tables(global: toml::Table, feed_defaults: toml::Table, feeds: HashMap<String, toml::Table>) -> Self {
        let feeds = feeds
            .into_iter()
            .map(|(name, table)| {
                let mut merged = feed_defaults.clone();
                deep_merge(&mut merged, &table);
                (name, merged)
            })
            .collect();
        Self {
            root: PathBuf::new(),
            environment: "production".to_string(),
            global,
            feed_defaults,
            feeds,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Typed global configuration with `FEEDHUB_STORE_*` overrides applied.
    pub fn global_config(&self) -> Result<Config> {
        let mut config: Config = toml::Value::Table(self.global.clone())
            .try_into()
            .map_err(|e: toml::de::Error| Error::ConfigError(format!("Invalid global config: {e}")))?;
        config.merge_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Merged configuration for one feed; feeds without their own file get the defaults.
    pub fn feed_config(&self, feed_name: &str) -> Result<FeedConfig> {
        let table = self.feeds.get(feed_name).unwrap_or(&self.feed_defaults).clone();
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| Error::ConfigError(format!("Invalid config for feed '{feed_name}': {e}")))
    }

    /// Names of feeds that ship their own configuration file.
    pub fn configured_feeds(&self) -> Vec<String> {
        let mut names: Vec<String> = self.feeds.keys().cloned().collect();
        names.sort();
        names
    }
}

fn read_table(path: &Path) -> Result<Option<toml::Table>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let table: toml::Table = toml::from_str(&content)
        .map_err(|e| Error::ConfigError(format!("Failed to parse {}: {}", path.display(), e)))?;
    Ok(Some(table))
}

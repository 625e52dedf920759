//! Build-time feed registration. Each feed module contributes a
//! `(name, constructor)` entry; discovery builds the enabled ones and hands
//! them to the registry.

use super::FeedRegistry;
use crate::alerts::AlertManager;
use crate::config::{ConfigManager, FeedConfig};
use crate::feed::{Feed, FeedPipeline, FeedRunner};
use crate::store::StoreManager;
use crate::utils::error::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

pub type FeedConstructor = fn(&FeedConfig) -> Result<Arc<dyn Feed>>;

#[derive(Clone, Copy)]
struct CatalogEntry {
    name: &'static str,
    build: FeedConstructor,
}

#[derive(Clone, Default)]
pub struct FeedCatalog {
    entries: Vec<CatalogEntry>,
}

impl FeedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: &[(&'static str, FeedConstructor)]) -> Self {
        table.iter().fold(Self::new(), |catalog, (name, build)| catalog.with(*name, *build))
    }

    /// Add an entry. A later entry with the same name replaces the earlier one.
    pub fn with(mut self, name: &'static str, build: FeedConstructor) -> Self {
        self.entries.retain(|e| e.name != name);
        self.entries.push(CatalogEntry { name, build });
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build and register every enabled feed. Failures are collected per
    /// feed and never stop the rest of the catalog.
    pub async fn discover(&self, ctx: &DiscoveryContext<'_>) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        for entry in &self.entries {
            report.discovered.push(entry.name.to_string());
            match self.build_one(entry, ctx).await {
                | Ok(Some(name)) => report.registered.push(name),
                | Ok(None) => report.skipped.push(entry.name.to_string()),
                | Err(e) => {
                    warn!(feed = entry.name, error = %e, "Feed discovery failed");
                    report.errors.push((entry.name.to_string(), e.to_string()));
                }
            }
        }
        info!(
            discovered = report.discovered.len(),
            registered = report.registered.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "Feed discovery finished"
        );
        report
    }

    async fn build_one(&self, entry: &CatalogEntry, ctx: &DiscoveryContext<'_>) -> Result<Option<String>> {
        let config = ctx.config.feed_config(entry.name)?;
        if !config.enabled {
            info!(feed = entry.name, "Feed disabled in config, skipping");
            return Ok(None);
        }
        let feed = (entry.build)(&config)?;
        let pipeline = FeedPipeline::new(feed, config, Arc::clone(&ctx.store), Arc::clone(&ctx.alerts))?;
        let name = pipeline.name().to_string();
        let runner = FeedRunner::new(Arc::new(pipeline), Arc::downgrade(ctx.registry));
        ctx.registry.register(Arc::new(runner)).await;
        Ok(Some(name))
    }
}

/// Everything a discovered feed is wired to.
pub struct DiscoveryContext<'a> {
    pub config: &'a ConfigManager,
    pub store: Arc<StoreManager>,
    pub alerts: Arc<AlertManager>,
    pub registry: &'a Arc<FeedRegistry>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub discovered: Vec<String>,
    pub registered: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<(String, String)>,
}

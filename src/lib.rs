//! # feedhub
//! Market-data ingestion for a trading bot.
//!
//! Feeds poll upstream sources and write validated, batched records into a
//! partitioned time-series store. The [`registry`] supervises feed
//! lifecycles, [`store`] owns the connection pool, schemas, batched inserts
//! and store health, and [`feed`] runs one collection end to end.
//! [`platform::Platform`] wires everything together.

pub use crate::utils::error::{Error, Result};

pub mod alerts;
pub mod config;
pub mod feed;
pub mod platform;
pub mod registry;
pub mod schedule;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod utils;
pub mod validation;

pub use crate::feed::{Feed, FeedExecutionResult, FeedPipeline, FeedRunner};
pub use crate::platform::Platform;
pub use crate::registry::{FeedRegistry, FeedStatus, Priority};
pub use crate::store::StoreManager;

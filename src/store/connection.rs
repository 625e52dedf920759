//! Connection-level abstraction over the time-series store.

use crate::schema::SqlValue;
use crate::utils::error::StoreError;
use async_trait::async_trait;

/// Rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First column of the first row.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|r| r.first())
    }
}

/// One live session with the store.
#[async_trait]
pub trait StoreConnection: Send {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError>;

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, StoreError>;

    async fn begin(&mut self) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Trivial round trip used as a liveness test.
    async fn ping(&mut self) -> Result<(), StoreError> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Opens new connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError>;

    /// Human readable target, for logs.
    fn describe(&self) -> String;
}

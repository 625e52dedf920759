//! Bounded pool of live store connections.
//!
//! Checkout is gated by a semaphore sized to the pool, so an exhausted pool
//! makes callers wait rather than fail. Every connection handed out has just
//! answered a `SELECT 1`; a dead one is discarded and replaced once before the
//! error reaches the caller.

use super::connection::{Connector, StoreConnection};
use crate::utils::error::StoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

/// Pool sizing and timing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            connect_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

/// Counters describing pool usage since creation
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PoolStats {
    pub size: usize,
    pub active: usize,
    pub idle: usize,
    pub total_gets: u64,
    pub total_puts: u64,
    pub wait_time_total_ms: f64,
    pub avg_wait_time_ms: f64,
    pub connections_created: u64,
    pub connections_closed: u64,
    pub connection_errors: u64,
}

impl PoolStats {
    /// Checked-out connections as a percentage of pool size.
    pub fn usage_percent(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.active as f64 / self.size as f64 * 100.0
        }
    }
}

/// Result of a pool health probe
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub healthy: bool,
    pub response_time_ms: f64,
    pub checked_at: DateTime<Utc>,
    pub error: Option<String>,
    pub stats: PoolStats,
}

#[derive(Debug, Default)]
struct Counters {
    total_gets: u64,
    total_puts: u64,
    wait_time_total: Duration,
    created: u64,
    closed: u64,
    errors: u64,
}

/// A connection checked out of the pool. Hand it back with
/// [`ConnectionPool::release`]; dropping it closes the connection and frees
/// its slot.
pub struct PooledConnection {
    conn: Box<dyn StoreConnection>,
    permit: OwnedSemaphorePermit,
    checked_out_at: Instant,
}

impl PooledConnection {
    pub fn held_for(&self) -> Duration {
        self.checked_out_at.elapsed()
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("checked_out_at", &self.checked_out_at)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn StoreConnection>>>,
    counters: Mutex<Counters>,
    last_health: Mutex<Option<(Instant, PoolHealth)>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let size = config.size.max(1);
        Self {
            connector,
            config: PoolConfig { size, ..config },
            slots: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::with_capacity(size)),
            counters: Mutex::new(Counters::default()),
            last_health: Mutex::new(None),
        }
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Open and verify the first connection. Further connections are opened
    /// on demand up to the pool size.
    #[instrument(skip(self), fields(target = %self.connector.describe()))]
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let mut conn = self.open().await?;
        if let Err(e) = conn.ping().await {
            conn.close().await;
            self.counters.lock().await.closed += 1;
            return Err(e);
        }
        self.idle.lock().await.push(conn);
        info!(size = self.config.size, "Connection pool initialized");
        Ok(())
    }

    async fn open(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let attempt = tokio::time::timeout(self.config.connect_timeout, self.connector.connect()).await;
        let mut counters = self.counters.lock().await;
        match attempt {
            | Ok(Ok(conn)) => {
                counters.created += 1;
                Ok(conn)
            }
            | Ok(Err(e)) => {
                counters.errors += 1;
                Err(e)
            }
            | Err(_) => {
                counters.errors += 1;
                Err(StoreError::ConnectTimeout(self.config.connect_timeout))
            }
        }
    }

    /// Check out a verified connection, waiting for a free slot if necessary.
    pub async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        let started = Instant::now();
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::PoolClosed)?;
        let waited = started.elapsed();

        let mut last_error = None;
        for attempt in 0..2 {
            // Retry always uses a fresh connection.
            let reused = if attempt == 0 { self.idle.lock().await.pop() } else { None };
            let mut conn = match reused {
                | Some(conn) => conn,
                | None => match self.open().await {
                    | Ok(conn) => conn,
                    | Err(e) => {
                        warn!(attempt, error = %e, "Failed to open store connection");
                        last_error = Some(e);
                        continue;
                    }
                },
            };

            match conn.ping().await {
                | Ok(()) => {
                    let mut counters = self.counters.lock().await;
                    counters.total_gets += 1;
                    counters.wait_time_total += waited;
                    metrics::histogram!("feedhub_pool_wait_seconds", waited.as_secs_f64());
                    return Ok(PooledConnection { conn, permit, checked_out_at: Instant::now() });
                }
                | Err(e) => {
                    warn!(attempt, error = %e, "Discarding connection that failed liveness test");
                    conn.close().await;
                    let mut counters = self.counters.lock().await;
                    counters.closed += 1;
                    counters.errors += 1;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::Connection("no connection available".to_string())))
    }

    /// Return a connection. With `force_close`, or when the connection is
    /// already dead, it is closed instead of going back to the idle set.
    pub async fn release(&self, pooled: PooledConnection, force_close: bool) {
        let PooledConnection { mut conn, permit, checked_out_at } = pooled;
        debug!(held_ms = checked_out_at.elapsed().as_millis() as u64, force_close, "Releasing connection");

        if force_close || conn.is_closed() || self.slots.is_closed() {
            conn.close().await;
            self.counters.lock().await.closed += 1;
        } else {
            self.idle.lock().await.push(conn);
        }
        self.counters.lock().await.total_puts += 1;
        drop(permit);
    }

    pub async fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().await.len();
        let counters = self.counters.lock().await;
        let active = self.config.size.saturating_sub(self.slots.available_permits());
        let wait_ms = counters.wait_time_total.as_secs_f64() * 1000.0;
        PoolStats {
            size: self.config.size,
            active,
            idle,
            total_gets: counters.total_gets,
            total_puts: counters.total_puts,
            wait_time_total_ms: wait_ms,
            avg_wait_time_ms: if counters.total_gets > 0 { wait_ms / counters.total_gets as f64 } else { 0.0 },
            connections_created: counters.created,
            connections_closed: counters.closed,
            connection_errors: counters.errors,
        }
    }

    /// Probe the store through the pool. Probes closer together than the
    /// configured interval return the previous result.
    pub async fn health_check(&self) -> PoolHealth {
        let mut cached = self.last_health.lock().await;
        if let Some((at, health)) = cached.as_ref() {
            if at.elapsed() < self.config.health_check_interval {
                return health.clone();
            }
        }

        let started = Instant::now();
        let outcome = match self.acquire().await {
            | Ok(conn) => {
                self.release(conn, false).await;
                Ok(())
            }
            | Err(e) => Err(e),
        };
        let health = PoolHealth {
            healthy: outcome.is_ok(),
            response_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            checked_at: Utc::now(),
            error: outcome.err().map(|e| e.to_string()),
            stats: self.stats().await,
        };
        *cached = Some((Instant::now(), health.clone()));
        health
    }

    /// Close every idle connection and refuse further checkouts.
    pub async fn close_all(&self) {
        self.slots.close();
        let drained: Vec<_> = self.idle.lock().await.drain(..).collect();
        let n = drained.len() as u64;
        for mut conn in drained {
            conn.close().await;
        }
        self.counters.lock().await.closed += n;
        info!(closed = n, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;
    use assert_matches::assert_matches;

    fn pool(backend: &MemoryBackend, size: usize) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(backend.clone()),
            PoolConfig { size, connect_timeout: Duration::from_secs(1), health_check_interval: Duration::ZERO },
        )
    }

    #[tokio::test]
    async fn acquire_and_release_reuses_connection() {
        let backend = MemoryBackend::new();
        let pool = pool(&backend, 2);
        pool.initialize().await.unwrap();

        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().await.active, 1);
        pool.release(conn, false).await;

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, false).await;

        let stats = pool.stats().await;
        assert_eq!(stats.total_gets, 2);
        assert_eq!(stats.total_puts, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.connections_created, 1);
        assert_eq!(backend.connects().await, 1);
    }

    #[tokio::test]
    async fn exhausted_pool_blocks_until_release() {
        let backend = MemoryBackend::new();
        let pool = Arc::new(pool(&backend, 1));

        let held = pool.acquire().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err(), "second acquire should block");

        let p = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { p.acquire().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.release(held, false).await;
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dead_connection_is_replaced_once() {
        let backend = MemoryBackend::new();
        let pool = pool(&backend, 2);
        pool.initialize().await.unwrap();

        backend.fail_pings(1).await;
        let conn = pool.acquire().await.unwrap();
        pool.release(conn, false).await;

        let stats = pool.stats().await;
        assert_eq!(stats.connections_closed, 1);
        assert_eq!(stats.connections_created, 2);

        backend.fail_pings(2).await;
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.stats().await.active, 0);
    }

    #[tokio::test]
    async fn force_close_discards_connection() {
        let backend = MemoryBackend::new();
        let pool = pool(&backend, 1);
        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true).await;
        let stats = pool.stats().await;
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.connections_closed, 1);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_after_retry() {
        let backend = MemoryBackend::new();
        backend.fail_connects(2).await;
        let pool = pool(&backend, 1);
        assert_matches!(pool.acquire().await, Err(StoreError::Connection(_)));
        assert_eq!(pool.stats().await.connection_errors, 2);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn health_check_is_cached_within_interval() {
        let backend = MemoryBackend::new();
        let pool = ConnectionPool::new(
            Arc::new(backend.clone()),
            PoolConfig { size: 1, connect_timeout: Duration::from_secs(1), health_check_interval: Duration::from_secs(60) },
        );
        let first = pool.health_check().await;
        assert!(first.healthy);

        backend.fail_connects(5).await;
        let second = pool.health_check().await;
        assert!(second.healthy);
        assert_eq!(second.checked_at, first.checked_at);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let backend = MemoryBackend::new();
        let pool = pool(&backend, 1);
        pool.initialize().await.unwrap();
        pool.close_all().await;
        assert!(pool.is_closed());
        assert_matches!(pool.acquire().await, Err(StoreError::PoolClosed));
    }
}

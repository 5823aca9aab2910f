//! Bounded pool of exclusive backend connections
//!
//! Capacity is enforced by a semaphore: a caller holds one permit for as long
//! as it holds a connection, so at most `max_connections` handles exist at any
//! time and waiters are served in FIFO order. Idle connections sit in a
//! mutex-guarded queue that is never locked across an await point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::{BackendConnection, BackendRequest, BackendResponse, Connector};
use crate::error::{BackendError, PoolError};
use crate::metrics;

/// Pool sizing and timeouts
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed instead of reused
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: None,
        }
    }
}

struct IdleConnection<T> {
    id: u64,
    conn: T,
    since: Instant,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
    closed: AtomicBool,
    in_use: AtomicUsize,
    next_id: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl<C: Connector> PoolInner<C> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection<C::Connection>>> {
        // The queue holds no invariant a panicking holder could break
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the most recently used connection that is still healthy
    fn take_idle(&self) -> Option<(u64, C::Connection)> {
        let mut stale = Vec::new();
        let found = {
            let mut idle = self.idle();
            loop {
                let Some(entry) = idle.pop_back() else {
                    break None;
                };
                let expired = self
                    .config
                    .idle_timeout
                    .is_some_and(|timeout| entry.since.elapsed() >= timeout);
                if expired || !entry.conn.is_reusable() {
                    stale.push(entry);
                    continue;
                }
                break Some((entry.id, entry.conn));
            }
        };

        for entry in stale {
            self.discard(entry.id, "stale idle connection");
        }
        found
    }

    fn put_back(&self, id: u64, conn: C::Connection, broken: bool) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        metrics::update_pool_in_use(self.in_use.load(Ordering::Acquire));

        if broken || !conn.is_reusable() {
            drop(conn);
            self.discard(id, "connection not reusable");
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            drop(conn);
            self.discard(id, "pool closed");
            return;
        }

        self.idle().push_back(IdleConnection {
            id,
            conn,
            since: Instant::now(),
        });
    }

    fn discard(&self, id: u64, reason: &'static str) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_discarded();
        tracing::debug!(connection_id = id, reason, "Discarded backend connection");
    }
}

/// Pool of connections to one backend endpoint
///
/// Cheap to clone; clones share the same connections.
pub struct BackendPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for BackendPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> BackendPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let max = config.max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                permits: Arc::new(Semaphore::new(max)),
                config: PoolConfig {
                    max_connections: max,
                    ..config
                },
                idle: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                in_use: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Borrow a connection for exclusive use
    ///
    /// Waits up to the configured acquire timeout for capacity, reuses an idle
    /// connection when one is healthy and otherwise opens a new one. The
    /// returned future is cancel-safe: dropping it gives up the place in the
    /// queue and leaks nothing.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, PoolError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let started = Instant::now();
        let permit = match tokio::time::timeout(
            inner.config.acquire_timeout,
            inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(
                    waited_ms,
                    capacity = inner.config.max_connections,
                    "Backend connection pool exhausted"
                );
                return Err(PoolError::Exhausted { waited_ms });
            }
        };

        let (id, conn) = match inner.take_idle() {
            Some(found) => found,
            None => {
                let conn = inner.connector.connect().await.map_err(|e| {
                    tracing::warn!(
                        endpoint = %inner.connector.endpoint(),
                        error = %e,
                        "Failed to connect to backend"
                    );
                    PoolError::Connect(e)
                })?;
                let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                inner.created.fetch_add(1, Ordering::Relaxed);
                metrics::record_connection_created();
                tracing::debug!(
                    connection_id = id,
                    endpoint = %inner.connector.endpoint(),
                    "Opened backend connection"
                );
                (id, conn)
            }
        };

        let in_use = inner.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::update_pool_in_use(in_use);

        Ok(PooledConnection {
            id,
            conn: Some(conn),
            broken: false,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Stop lending connections and close the idle ones
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        let drained: Vec<_> = self.inner.idle().drain(..).collect();
        for entry in drained {
            self.inner.discard(entry.id, "pool closed");
        }
        tracing::debug!("Closed backend connection pool");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.config.max_connections,
            in_use: self.inner.in_use.load(Ordering::Acquire),
            idle: self.inner.idle().len(),
            created: self.inner.created.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub idle: usize,
    pub created: u64,
    pub discarded: u64,
}

/// Exclusive handle on a pooled connection
///
/// The connection goes back to the pool exactly once: through
/// [`release`](Self::release) or when the handle is dropped. A handle marked
/// broken is closed instead of returned.
pub struct PooledConnection<C: Connector> {
    id: u64,
    conn: Option<C::Connection>,
    broken: bool,
    pool: Arc<PoolInner<C>>,
    // Dropped after `drop` has returned the connection, so a waiter woken by
    // the permit finds it idle
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send one request; a transport error marks the connection broken
    pub async fn round_trip(
        &mut self,
        request: &BackendRequest,
    ) -> Result<BackendResponse, BackendError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(BackendError::Closed);
        };
        let result = conn.round_trip(request).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Close the connection on release instead of reusing it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn connection(&self) -> Option<&C::Connection> {
        self.conn.as_ref()
    }

    /// Return the connection to the pool
    pub fn release(self) {
        drop(self);
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(self.id, conn, self.broken);
        }
    }
}

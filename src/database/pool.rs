//! Bounded SQLite connection pool
//!
//! Every pooled connection is a `tokio_rusqlite::Connection`, i.e. one worker
//! thread owning one SQLite handle. At most `max_connections` are open at a
//! time; callers beyond that queue on a semaphore until `acquire_timeout_ms`
//! runs out. Idle connections above `min_connections` are closed by the
//! health monitor.
//!
//! `:memory:` is mapped to a named shared-cache database so that every
//! connection in the pool sees the same data. Such a database lives only as
//! long as one connection is open, so the pool holds an extra anchor
//! connection that is never checked out and not counted in [`PoolStats`].
//!
//! A timed-out connection is dropped from the pool right away, but its worker
//! keeps the SQLite handle until the interrupted statement unwinds. Open
//! handles can briefly exceed `max_connections` by the number of such
//! connections.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{InterruptHandle, OpenFlags};
use serde::Serialize;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::client::RetryManager;
use crate::config::DatabaseConfig;
use crate::error::DbError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

static MEMORY_DB_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Point-in-time view of pool usage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub max: usize,
    /// `in_use / max`
    pub utilization: f64,
}

/// Per-call overrides for [`ConnectionPool::query`]
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    /// Statement timeout; the pool default when `None`
    pub timeout: Option<Duration>,
    /// Retry transient failures (busy, locked, pool timeout)
    pub retry: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: true,
        }
    }
}

struct IdleConnection {
    conn: Connection,
    interrupt: Arc<InterruptHandle>,
    idle_since: Instant,
}

struct PoolInner {
    target: String,
    in_memory: bool,
    _anchor: Option<Connection>,
    min_connections: usize,
    max_connections: usize,
    idle_timeout: Duration,
    statement_timeout: Duration,
    acquire_timeout: Duration,
    high_water_mark: f64,
    health_interval: Duration,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    total: AtomicUsize,
    in_use: AtomicUsize,
    waiting: AtomicUsize,
    closed: AtomicBool,
    retry: RetryManager,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn open_connection(&self) -> Result<(Connection, Arc<InterruptHandle>), DbError> {
        let opened = connect(&self.target, self.in_memory).await?;
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(total, "Opened database connection");
        Ok(opened)
    }

    /// Close idle connections past the idle timeout, keeping the floor
    fn reap_idle(&self) -> usize {
        let floor = self.min_connections;
        let mut idle = self.idle();
        let mut reaped = 0;

        while let Some(oldest) = idle.front() {
            if oldest.idle_since.elapsed() < self.idle_timeout
                || self.total.load(Ordering::SeqCst) <= floor
            {
                break;
            }
            idle.pop_front();
            self.total.fetch_sub(1, Ordering::SeqCst);
            reaped += 1;
        }

        reaped
    }
}

async fn connect(
    target: &str,
    in_memory: bool,
) -> Result<(Connection, Arc<InterruptHandle>), DbError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(target, flags).await?;

    let interrupt = conn
        .call(move |conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            if !in_memory {
                let _mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            }
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(conn.get_interrupt_handle())
        })
        .await?;

    Ok((conn, Arc::new(interrupt)))
}

/// Decrements the waiter count however the acquire ends
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A checked-out connection; returned to the pool on drop
pub struct PooledConnection {
    conn: Option<Connection>,
    interrupt: Arc<InterruptHandle>,
    pool: Arc<PoolInner>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Run `f` on the connection's worker thread, bounded by `timeout`
    ///
    /// On timeout the running statement is interrupted and the connection is
    /// discarded instead of being returned to the pool.
    pub async fn call<F, T>(&mut self, timeout: Duration, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.as_ref().ok_or(DbError::ConnectionClosed)?;
        let fut = conn.call(move |c| f(c).map_err(tokio_rusqlite::Error::from));

        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let err = DbError::from(e);
                if matches!(err, DbError::ConnectionClosed) {
                    self.discard = true;
                }
                Err(err)
            }
            Err(_) => {
                self.interrupt.interrupt();
                self.discard = true;
                let timeout_ms = timeout.as_millis() as u64;
                warn!(timeout_ms, "Statement timed out, interrupting");
                Err(DbError::StatementTimeout { timeout_ms })
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        let Some(conn) = self.conn.take() else {
            return;
        };

        if self.discard || self.pool.closed.load(Ordering::SeqCst) {
            self.pool.total.fetch_sub(1, Ordering::SeqCst);
            debug!("Discarding database connection");
        } else {
            self.pool.idle().push_back(IdleConnection {
                conn,
                interrupt: self.interrupt.clone(),
                idle_since: Instant::now(),
            });
        }
    }
}

/// Bounded pool of SQLite connections
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open the pool and eagerly create `min_connections` connections
    pub async fn open(config: &DatabaseConfig) -> Result<Self, DbError> {
        if config.max_connections == 0 {
            return Err(DbError::Open(
                "max_connections must be at least 1".to_string(),
            ));
        }

        let in_memory = config.path == ":memory:";
        let target = if in_memory {
            let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::SeqCst);
            format!(
                "file:marketing-sync-mem-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                seq
            )
        } else {
            if let Some(parent) = Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| DbError::Open(format!("{}: {}", parent.display(), e)))?;
                }
            }
            config.path.clone()
        };

        let anchor = if in_memory {
            Some(connect(&target, true).await?.0)
        } else {
            None
        };

        let inner = Arc::new(PoolInner {
            target,
            in_memory,
            _anchor: anchor,
            min_connections: config.min_connections.min(config.max_connections),
            max_connections: config.max_connections,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            statement_timeout: Duration::from_millis(config.statement_timeout_ms),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            high_water_mark: config.high_water_mark,
            health_interval: Duration::from_secs(config.health_check_interval_secs.max(1)),
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            idle: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            retry: RetryManager::new(config.retry.clone()),
        });

        for _ in 0..inner.min_connections {
            let (conn, interrupt) = inner.open_connection().await?;
            inner.idle().push_back(IdleConnection {
                conn,
                interrupt,
                idle_since: Instant::now(),
            });
        }

        info!(
            path = %config.path,
            min_connections = inner.min_connections,
            max_connections = inner.max_connections,
            "Database pool opened"
        );

        Ok(Self { inner })
    }

    /// Check out a connection, queueing while the pool is saturated
    pub async fn acquire(&self) -> Result<PooledConnection, DbError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::PoolClosed);
        }

        let started = Instant::now();
        let permit = {
            let _waiting = WaitingGuard::new(&inner.waiting);
            match tokio::time::timeout(
                inner.acquire_timeout,
                inner.semaphore.clone().acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DbError::PoolClosed),
                Err(_) => {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    warn!(
                        waited_ms,
                        max_connections = inner.max_connections,
                        "Timed out waiting for a database connection"
                    );
                    return Err(DbError::PoolTimeout { waited_ms });
                }
            }
        };

        let reused = inner.idle().pop_back();
        let (conn, interrupt) = match reused {
            Some(idle) => (idle.conn, idle.interrupt),
            None => inner.open_connection().await?,
        };
        inner.in_use.fetch_add(1, Ordering::SeqCst);

        Ok(PooledConnection {
            conn: Some(conn),
            interrupt,
            pool: self.inner.clone(),
            discard: false,
            _permit: permit,
        })
    }

    async fn run<F, T>(&self, options: QueryOptions, f: F) -> Result<T, DbError>
    where
        F: Fn(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let timeout = options.timeout.unwrap_or(self.inner.statement_timeout);
        let attempt = || {
            let f = f.clone();
            async move {
                let mut conn = self.acquire().await?;
                conn.call(timeout, move |c| (*f)(c)).await
            }
        };

        if options.retry {
            self.inner.retry.execute(attempt).await
        } else {
            attempt().await
        }
    }

    /// Run `f` on a pooled connection with the default timeout and retries
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: Fn(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.run(QueryOptions::default(), f).await
    }

    /// Run `f` inside BEGIN/COMMIT, rolling back if it fails
    ///
    /// A retried transaction re-runs `f` from the start on a fresh BEGIN.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: Fn(&rusqlite::Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.with_connection(move |conn| run_in_transaction(conn, &f))
            .await
    }

    /// Run a query and map each row
    pub async fn query<T, M>(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
        options: QueryOptions,
        map_row: M,
    ) -> Result<Vec<T>, DbError>
    where
        M: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let sql = sql.to_string();
        self.run(options, move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                map_row(row)
            })?;
            let collected: rusqlite::Result<Vec<T>> = rows.collect();
            collected
        })
        .await
    }

    /// Run a single statement, returning the number of changed rows
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<usize, DbError> {
        let sql = sql.to_string();
        self.with_connection(move |conn| {
            conn.execute(&sql, rusqlite::params_from_iter(params.iter()))
        })
        .await
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let idle = inner.idle().len();
        let in_use = inner.in_use.load(Ordering::SeqCst);

        PoolStats {
            total: inner.total.load(Ordering::SeqCst),
            idle,
            in_use,
            waiting: inner.waiting.load(Ordering::SeqCst),
            max: inner.max_connections,
            utilization: in_use as f64 / inner.max_connections as f64,
        }
    }

    /// Sample pool health once: reap idle connections and warn on saturation
    pub fn check_health(&self) -> PoolStats {
        let reaped = self.inner.reap_idle();
        if reaped > 0 {
            debug!(reaped, "Closed idle database connections");
        }

        let stats = self.stats();
        if stats.utilization >= self.inner.high_water_mark {
            warn!(
                in_use = stats.in_use,
                waiting = stats.waiting,
                max = stats.max,
                utilization = stats.utilization,
                "Database pool above high-water mark"
            );
        } else {
            debug!(
                total = stats.total,
                idle = stats.idle,
                in_use = stats.in_use,
                "Database pool health"
            );
        }

        stats
    }

    /// Periodically run [`check_health`](Self::check_health) until shutdown
    pub fn spawn_health_monitor(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.inner.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.check_health();
                    }
                    _ = shutdown.recv() => {
                        debug!("Database pool monitor stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Refuse new acquires and close idle connections
    ///
    /// Checked-out connections are closed when they are returned.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();
        let drained = self.inner.idle().drain(..).count();
        self.inner.total.fetch_sub(drained, Ordering::SeqCst);
        info!(closed = drained, "Database pool closed");
    }
}

fn run_in_transaction<T, F>(conn: &mut rusqlite::Connection, f: &F) -> rusqlite::Result<T>
where
    F: Fn(&rusqlite::Connection) -> rusqlite::Result<T>,
{
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = f(conn).and_then(|value| conn.execute_batch("COMMIT").map(|_| value));

    if let Err(e) = &result {
        if !conn.is_autocommit() {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                error!(error = %rollback_err, cause = %e, "Rollback failed");
            }
        }
    }

    result
}

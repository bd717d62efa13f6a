//! Statement execution
//!
//! All database work funnels through one `SqlExecutor`:
//! - the async path queues jobs on a FIFO drained by a single worker thread,
//!   so statements run strictly in submission order
//! - the sync path borrows the same connection on the caller's thread and
//!   spins on busy errors instead of yielding
//!
//! Every async job bumps a pending counter before it is queued and drops it
//! once its result has been delivered, whether it failed or not. `drain()`
//! waits for the counter to reach zero.

use rusqlite::{CachedStatement, Connection};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::adapters::sqlite::explain::ExplainWriter;
use crate::adapters::sqlite::pool::DbPool;
use crate::types::error::{GlodaError, Result};

type Job = Box<dyn FnOnce(&DbPool) + Send>;

/// Result of an asynchronously executed job.
///
/// Awaiting yields the job's result; dropping it does not cancel the job.
pub struct Pending<T> {
    inner: PendingInner<T>,
}

enum PendingInner<T> {
    Ready(Option<Result<T>>),
    Waiting(oneshot::Receiver<Result<T>>),
}

impl<T> Pending<T> {
    pub fn ready(result: Result<T>) -> Self {
        Self {
            inner: PendingInner::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            inner: PendingInner::Waiting(rx),
        }
    }
}

impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            PendingInner::Ready(slot) => Poll::Ready(slot.take().unwrap_or(Err(GlodaError::Shutdown))),
            PendingInner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(GlodaError::Shutdown))),
        }
    }
}

/// Prepares (or reuses) a cached statement. Failures here are programming
/// errors in the schema or generated SQL and surface as `Statement`.
pub fn prepare<'c>(conn: &'c Connection, sql: &str) -> Result<CachedStatement<'c>> {
    conn.prepare_cached(sql)
        .map_err(|e| GlodaError::Statement(format!("{} [{}]", e, sql)))
}

pub struct SqlExecutor {
    pool: DbPool,
    sender: Mutex<Option<flume::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<watch::Sender<usize>>,
    busy_retry_limit: u32,
    explain: Option<Arc<ExplainWriter>>,
    closed: AtomicBool,
}

impl SqlExecutor {
    pub fn new(
        pool: DbPool,
        busy_retry_limit: u32,
        explain: Option<ExplainWriter>,
    ) -> Result<Self> {
        let (sender, receiver) = flume::unbounded::<Job>();
        let worker_pool = pool.clone();
        let worker = thread::Builder::new()
            .name("gloda-sql".into())
            .spawn(move || {
                debug!("SQL worker started");
                while let Ok(job) = receiver.recv() {
                    job(&worker_pool);
                }
                debug!("SQL worker stopped");
            })?;

        let (pending, _) = watch::channel(0usize);

        Ok(Self {
            pool,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            pending: Arc::new(pending),
            busy_retry_limit,
            explain: explain.map(Arc::new),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn explain(&self) -> Option<Arc<ExplainWriter>> {
        self.explain.clone()
    }

    /// Number of queued or running async jobs.
    pub fn pending_count(&self) -> usize {
        *self.pending.borrow()
    }

    /// Queues `f` for the worker thread.
    pub fn execute_async<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.execute_async_then(f, |_| {})
    }

    /// Queues `f`, then runs `after` on the worker once the connection has
    /// been released but before the result is delivered.
    pub fn execute_async_then<T, F, A>(&self, f: F, after: A) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        A: FnOnce(&Result<T>) + Send + 'static,
    {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let sender = match sender {
            Some(sender) if !self.is_closed() => sender,
            _ => return Pending::ready(Err(GlodaError::Shutdown)),
        };

        let (tx, rx) = oneshot::channel();
        let pending = self.pending.clone();
        pending.send_modify(|n| *n += 1);

        let job: Job = Box::new(move |pool| {
            let result = match pool.get() {
                Ok(conn) => f(&*conn),
                Err(e) => Err(GlodaError::from(e)),
            };
            if let Err(e) = &result {
                warn!("Async statement failed: {}", e);
            }
            after(&result);
            // the receiver may have been dropped (fire-and-forget)
            let _ = tx.send(result);
            pending.send_modify(|n| *n = n.saturating_sub(1));
        });

        if let Err(flume::SendError(job)) = sender.send(job) {
            warn!("SQL worker is gone, dropping job");
            drop(job);
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Pending::ready(Err(GlodaError::Shutdown));
        }

        Pending::waiting(rx)
    }

    /// Runs `f` on the caller's thread, retrying busy errors up to the
    /// configured limit without yielding.
    pub fn execute_sync<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        if self.is_closed() {
            return Err(GlodaError::Shutdown);
        }
        let conn = self.pool.get()?;
        let mut attempts = 0u32;
        loop {
            match f(&*conn) {
                Err(e) if e.is_busy() && attempts < self.busy_retry_limit => {
                    attempts += 1;
                }
                Err(e) if e.is_busy() => {
                    warn!("Giving up after {} busy retries", attempts);
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Resolves once every queued async job has completed.
    pub async fn drain(&self) {
        let mut rx = self.pending.subscribe();
        // the sender lives in self, so this only fails if we are gone
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Waits for outstanding work, stops the worker and finalizes every
    /// memoized statement. Later calls return `Shutdown`.
    pub async fn shutdown(&self) -> Result<()> {
        self.drain().await;
        self.closed.store(true, Ordering::SeqCst);

        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("SQL worker panicked");
            }
        }

        let conn = self.pool.get()?;
        conn.flush_prepared_statement_cache();

        if let Some(explain) = &self.explain {
            explain.close()?;
        }
        info!("SQL executor shut down");
        Ok(())
    }
}

impl Drop for SqlExecutor {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool::create_memory_pool;
    use rusqlite::params;

    fn executor() -> SqlExecutor {
        let pool = create_memory_pool(1000).unwrap();
        pool.get()
            .unwrap()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        SqlExecutor::new(pool, 10, None).unwrap()
    }

    #[tokio::test]
    async fn test_async_jobs_run_in_submission_order() {
        let executor = executor();
        for i in 0..20i64 {
            drop(executor.execute_async(move |conn| {
                conn.execute("INSERT INTO t (id, v) VALUES (?1, ?2)", params![i, i.to_string()])?;
                Ok(())
            }));
        }
        let ids: Vec<i64> = executor
            .execute_async(|conn| {
                let mut stmt = prepare(conn, "SELECT id FROM t ORDER BY rowid")?;
                let ids = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                Ok(ids)
            })
            .await
            .unwrap();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failed_jobs_still_release_the_counter() {
        let executor = executor();
        let result = executor
            .execute_async(|conn| {
                conn.execute("INSERT INTO missing VALUES (1)", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
        executor.drain().await;
        assert_eq!(executor.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_sql_is_a_statement_error() {
        let executor = executor();
        let result = executor
            .execute_async(|conn| {
                prepare(conn, "SELEC nonsense")?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GlodaError::Statement(_))));
    }

    #[test]
    fn test_sync_path_retries_busy_errors() {
        let executor = executor();
        let mut calls = 0;
        let value = executor
            .execute_sync(|_| {
                calls += 1;
                if calls < 5 {
                    Err(GlodaError::Busy("locked".into()))
                } else {
                    Ok(calls)
                }
            })
            .unwrap();
        assert_eq!(value, 5);

        let mut calls = 0;
        let result: Result<()> = executor.execute_sync(|_| {
            calls += 1;
            Err(GlodaError::Busy("locked".into()))
        });
        assert!(result.unwrap_err().is_busy());
        assert_eq!(calls, 11);
    }

    #[tokio::test]
    async fn test_after_shutdown_jobs_are_refused() {
        let executor = executor();
        drop(executor.execute_async(|conn| {
            conn.execute("INSERT INTO t (id, v) VALUES (1, 'a')", [])?;
            Ok(())
        }));
        executor.shutdown().await.unwrap();
        assert_eq!(executor.pending_count(), 0);

        let result = executor.execute_async(|_| Ok(())).await;
        assert!(matches!(result, Err(GlodaError::Shutdown)));
        assert!(matches!(executor.execute_sync(|_| Ok(())), Err(GlodaError::Shutdown)));
    }
}

//! Virtually nested transactions
//!
//! Only the outermost begin/commit reach the database. A rollback at any
//! depth poisons the whole transaction: the outermost commit then issues a
//! ROLLBACK instead. Post-commit callbacks run on the SQL worker after a real
//! COMMIT succeeded and are discarded otherwise.

use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::adapters::sqlite::executor::{Pending, SqlExecutor};
use crate::types::error::Result;

pub type PostCommitCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TxState {
    depth: u32,
    good: bool,
    post_commit: Vec<PostCommitCallback>,
}

pub struct TransactionCoordinator {
    executor: Arc<SqlExecutor>,
    state: Mutex<TxState>,
}

impl TransactionCoordinator {
    pub fn new(executor: Arc<SqlExecutor>) -> Self {
        Self {
            executor,
            state: Mutex::new(TxState::default()),
        }
    }

    pub fn depth(&self) -> u32 {
        self.state.lock().map(|s| s.depth).unwrap_or(0)
    }

    pub fn begin(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if state.depth == 0 {
            state.post_commit.clear();
            state.good = true;
            drop(self.run("BEGIN TRANSACTION"));
        }
        state.depth += 1;
    }

    /// Ends one nesting level. At the outermost level this resolves once the
    /// COMMIT (or the ROLLBACK of a poisoned transaction) has executed.
    pub fn commit(&self) -> Pending<()> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return Pending::ready(Ok(())),
        };
        if state.depth == 0 {
            warn!("Commit without an open transaction");
            return Pending::ready(Ok(()));
        }
        state.depth -= 1;
        if state.depth > 0 {
            return Pending::ready(Ok(()));
        }

        if state.good {
            let callbacks = std::mem::take(&mut state.post_commit);
            self.executor.execute_async_then(
                |conn| {
                    conn.execute_batch("COMMIT")?;
                    Ok(())
                },
                move |result: &Result<()>| {
                    if result.is_ok() {
                        debug!("Running {} post-commit callbacks", callbacks.len());
                        for callback in callbacks {
                            callback();
                        }
                    }
                },
            )
        } else {
            state.post_commit.clear();
            debug!("Transaction was poisoned, rolling back instead of committing");
            self.run("ROLLBACK")
        }
    }

    /// Ends one nesting level and poisons the enclosing transaction.
    pub fn rollback(&self) -> Pending<()> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return Pending::ready(Ok(())),
        };
        if state.depth == 0 {
            warn!("Rollback without an open transaction");
            return Pending::ready(Ok(()));
        }
        state.depth -= 1;
        state.good = false;
        if state.depth > 0 {
            return Pending::ready(Ok(()));
        }
        state.post_commit.clear();
        self.run("ROLLBACK")
    }

    /// Queues `callback` to run after the current transaction commits. With
    /// no transaction open it runs immediately.
    pub fn run_post_commit(&self, callback: PostCommitCallback) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if state.depth == 0 {
            drop(state);
            callback();
        } else {
            state.post_commit.push(callback);
        }
    }

    /// Commits every open nesting level; used at shutdown.
    pub fn commit_all(&self) -> Pending<()> {
        let mut last = Pending::ready(Ok(()));
        while self.depth() > 0 {
            last = self.commit();
        }
        last
    }

    fn run(&self, sql: &'static str) -> Pending<()> {
        self.executor.execute_async(move |conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool::create_memory_pool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<SqlExecutor>, TransactionCoordinator) {
        let pool = create_memory_pool(1000).unwrap();
        pool.get()
            .unwrap()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();
        let executor = Arc::new(SqlExecutor::new(pool, 10, None).unwrap());
        let tx = TransactionCoordinator::new(executor.clone());
        (executor, tx)
    }

    fn insert(executor: &SqlExecutor, id: i64) {
        drop(executor.execute_async(move |conn| {
            conn.execute("INSERT INTO t (id) VALUES (?1)", [id])?;
            Ok(())
        }));
    }

    async fn count(executor: &SqlExecutor) -> i64 {
        executor
            .execute_async(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_nested_commit_is_single_outer_commit() {
        let (executor, tx) = setup();
        let fired = Arc::new(AtomicUsize::new(0));

        tx.begin();
        insert(&executor, 1);
        tx.begin();
        insert(&executor, 2);
        let counter = fired.clone();
        tx.run_post_commit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tx.commit().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(tx.depth(), 1);

        tx.commit().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(count(&executor).await, 2);
    }

    #[tokio::test]
    async fn test_inner_rollback_discards_outer_writes() {
        let (executor, tx) = setup();
        let fired = Arc::new(AtomicUsize::new(0));

        tx.begin();
        insert(&executor, 1);
        tx.begin();
        insert(&executor, 2);
        let counter = fired.clone();
        tx.run_post_commit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tx.rollback().await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count(&executor).await, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_post_commit_outside_transaction_runs_now() {
        let (_executor, tx) = setup();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        tx.run_post_commit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

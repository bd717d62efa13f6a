use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

use crate::types::error::GlodaError;

// Shorthand for the pool type used everywhere in the datastore.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Memoized statements kept per connection. The datastore prepares a few
/// dozen fixed statements plus one per distinct translated query shape.
pub const STATEMENT_CACHE_CAPACITY: usize = 256;

/// Opens the single shared connection to a database file.
pub fn create_pool(db_path: &Path, cache_pages: i64) -> Result<DbPool, GlodaError> {
    build_pool(SqliteConnectionManager::file(db_path), cache_pages)
}

/// Opens a private in-memory database. The pool never reaps its one
/// connection, so the database lives as long as the pool.
pub fn create_memory_pool(cache_pages: i64) -> Result<DbPool, GlodaError> {
    build_pool(SqliteConnectionManager::memory(), cache_pages)
}

fn build_pool(manager: SqliteConnectionManager, cache_pages: i64) -> Result<DbPool, GlodaError> {
    let manager = manager.with_init(move |conn| {
        conn.execute_batch(&format!(
            "PRAGMA synchronous = FULL;
             PRAGMA cache_size = {};",
            cache_pages
        ))?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        Ok(())
    });

    let pool = Pool::builder()
        .max_size(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .build(manager)?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pool_keeps_its_database() {
        let pool = create_memory_pool(1000).unwrap();
        pool.get()
            .unwrap()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);

        let sync: i64 = conn.query_row("PRAGMA synchronous", [], |r| r.get(0)).unwrap();
        assert_eq!(sync, 2);
        let cache: i64 = conn.query_row("PRAGMA cache_size", [], |r| r.get(0)).unwrap();
        assert_eq!(cache, 1000);
    }
}

use rusqlite::Connection;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use crate::types::error::Result;

/// In-memory id sequence for one table.
///
/// Seeded once from `MAX(id)` and never re-queried, so ids are reserved
/// synchronously even though the row itself is written later. Ids of failed
/// inserts are not reused.
#[derive(Debug)]
pub struct ManagedId {
    table: String,
    next: AtomicI64,
}

impl ManagedId {
    pub fn new(table: &str, next: i64) -> Self {
        Self {
            table: table.to_string(),
            next: AtomicI64::new(next),
        }
    }

    /// Seeds from the highest id in `table`, never going below `floor`.
    pub fn seed(conn: &Connection, table: &str, floor: i64) -> Result<Self> {
        let max: Option<i64> = conn.query_row(&format!("SELECT MAX(id) FROM {}", table), [], |row| {
            row.get(0)
        })?;
        let next = max.map(|m| m + 1).unwrap_or(floor).max(floor);
        debug!("Managed id for {} starts at {}", table, next);
        Ok(Self::new(table, next))
    }

    pub fn allocate(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next `allocate` call will return.
    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

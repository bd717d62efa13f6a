//! EXPLAIN dumping
//!
//! Debug aid: appends the `EXPLAIN` program of every asynchronously executed
//! query to a JSON document of the form
//! `{"queries": [{"sql": "...", "operations": [[addr, opcode, ...], ...]}]}`.

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use crate::types::error::GlodaError;

#[derive(Debug)]
struct ExplainFile {
    out: BufWriter<File>,
    wrote_any: bool,
}

#[derive(Debug)]
pub struct ExplainWriter {
    file: Mutex<Option<ExplainFile>>,
}

impl ExplainWriter {
    pub fn create(path: &Path) -> Result<Self, GlodaError> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(b"{\"queries\": [")?;
        Ok(Self {
            file: Mutex::new(Some(ExplainFile {
                out,
                wrote_any: false,
            })),
        })
    }

    /// Runs `EXPLAIN` for `sql` and appends the result. Failures are logged;
    /// the query itself is unaffected.
    pub fn record(&self, conn: &Connection, sql: &str, args: &[rusqlite::types::Value]) {
        let operations = match explain_operations(conn, sql, args) {
            Ok(ops) => ops,
            Err(e) => {
                warn!("EXPLAIN failed for {}: {}", sql, e);
                return;
            }
        };
        let entry = json!({ "sql": sql, "operations": operations });

        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(file) = guard.as_mut() {
            let separator: &[u8] = if file.wrote_any { b",\n" } else { b"\n" };
            let written = file
                .out
                .write_all(separator)
                .and_then(|_| file.out.write_all(entry.to_string().as_bytes()));
            match written {
                Ok(()) => file.wrote_any = true,
                Err(e) => warn!("Failed to write EXPLAIN output: {}", e),
            }
        }
    }

    /// Terminates the JSON document. Later `record` calls are ignored.
    pub fn close(&self) -> Result<(), GlodaError> {
        let taken = self.file.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut file) = taken {
            file.out.write_all(b"\n]}")?;
            file.out.flush()?;
        }
        Ok(())
    }
}

fn explain_operations(
    conn: &Connection,
    sql: &str,
    args: &[rusqlite::types::Value],
) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(&format!("EXPLAIN {}", sql))?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
    let mut operations = Vec::new();
    while let Some(row) = rows.next()? {
        let mut op = Vec::with_capacity(column_count);
        for i in 0..column_count {
            op.push(match row.get_ref(i)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => json!(v),
                ValueRef::Real(v) => json!(v),
                ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
                ValueRef::Blob(b) => json!(b.len()),
            });
        }
        operations.push(Value::Array(op));
    }
    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_is_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("explain.json");
        let writer = ExplainWriter::create(&path).unwrap();

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        writer.record(&conn, "SELECT * FROM t WHERE id = ?", &[rusqlite::types::Value::Integer(1)]);
        writer.record(&conn, "SELECT v FROM t", &[]);
        writer.close().unwrap();
        // ignored after close
        writer.record(&conn, "SELECT 1", &[]);

        let text = std::fs::read_to_string(&path).unwrap();
        let doc: Value = serde_json::from_str(&text).unwrap();
        let queries = doc["queries"].as_array().unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1]["sql"], "SELECT v FROM t");
        assert!(!queries[0]["operations"].as_array().unwrap().is_empty());
    }
}

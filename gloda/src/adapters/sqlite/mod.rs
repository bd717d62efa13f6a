pub mod executor;
pub mod explain;
pub mod ids;
pub mod pool;
pub mod schema;
pub mod transaction;

// Re-export the commonly used types so callers can do
// `use crate::adapters::sqlite::SqlExecutor`.
pub use executor::{prepare, Pending, SqlExecutor};
pub use ids::ManagedId;
pub use pool::DbPool;
pub use schema::{TableDef, SCHEMA_VERSION};
pub use transaction::TransactionCoordinator;

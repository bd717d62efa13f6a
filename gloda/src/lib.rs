//! Gloda - global message index datastore
//!
//! Persists messages, conversations, contacts, identities and folder
//! mappings in one SQLite file, and answers attribute queries with live,
//! listener-observable collections whose items are unique per row.
//!
//! ## Module Organization
//!
//! - `types/`: Data model and the error type
//! - `config/`: Configuration management
//! - `adapters/`: SQLite pool, statement executor, schema and transactions
//! - `nouns/`: Noun registry and the built-in nouns
//! - `query/`: Query model, SQL translation and reference resolution
//! - `cache/`: Collections and the per-noun identity caches
//! - `datastore/`: The `Datastore` and its entity repositories
//! - `services/`: Background folder liveness tracking

pub mod adapters;
pub mod cache;
pub mod config;
pub mod datastore;
pub mod nouns;
pub mod query;
pub mod services;
pub mod types;

use tracing_subscriber::EnvFilter;

pub use cache::{Collection, CollectionListener, CollectionManager};
pub use config::DatastoreConfig;
pub use datastore::{AttributeRow, Datastore, FolderDescriptor};
pub use query::{Constraint, Query, QueryOptions};
pub use types::{GlodaError, Result};

/// Installs the global `fmt` subscriber.
///
/// `RUST_LOG` wins when set. Otherwise debug builds log this crate at
/// debug level and everything else at info.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("gloda_datastore=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

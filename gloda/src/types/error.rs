//! Unified error type for the datastore
//!
//! SQLite failures are classified on conversion so that callers can react to
//! the two conditions the datastore treats specially:
//! - `Corrupt`: the database file must be deleted and recreated
//! - `Busy`: transient contention, retried on the synchronous path only

use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NounId;

/// Datastore error type
///
/// Errors are `Clone` so a single failure can be handed to every waiter of a
/// shared operation, and serializable so embedders can ship them over IPC.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum GlodaError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database is corrupt: {0}")]
    Corrupt(String),

    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Statement construction failed: {0}")]
    Statement(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown noun: {0}")]
    UnknownNoun(NounId),

    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Datastore has been shut down")]
    Shutdown,

    #[error("{0}")]
    Other(String),
}

impl GlodaError {
    pub fn is_busy(&self) -> bool {
        matches!(self, GlodaError::Busy(_))
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, GlodaError::Corrupt(_))
    }
}

impl From<rusqlite::Error> for GlodaError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    GlodaError::Corrupt(err.to_string())
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    GlodaError::Busy(err.to_string())
                }
                _ => GlodaError::Database(err.to_string()),
            },
            _ => GlodaError::Database(err.to_string()),
        }
    }
}

impl From<r2d2::Error> for GlodaError {
    fn from(err: r2d2::Error) -> Self {
        GlodaError::Database(err.to_string())
    }
}

impl From<std::io::Error> for GlodaError {
    fn from(err: std::io::Error) -> Self {
        GlodaError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for GlodaError {
    fn from(err: toml::de::Error) -> Self {
        GlodaError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for GlodaError {
    fn from(err: serde_json::Error) -> Self {
        GlodaError::Parse(err.to_string())
    }
}

impl From<String> for GlodaError {
    fn from(err: String) -> Self {
        GlodaError::Other(err)
    }
}

impl From<&str> for GlodaError {
    fn from(err: &str) -> Self {
        GlodaError::Other(err.to_string())
    }
}

/// Result type alias using GlodaError
pub type Result<T> = std::result::Result<T, GlodaError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_sqlite_codes_are_classified() {
        let busy: GlodaError = sqlite_failure(rusqlite::ffi::SQLITE_BUSY).into();
        assert!(busy.is_busy());

        let locked: GlodaError = sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).into();
        assert!(locked.is_busy());

        let corrupt: GlodaError = sqlite_failure(rusqlite::ffi::SQLITE_CORRUPT).into();
        assert!(corrupt.is_corrupt());

        let not_a_db: GlodaError = sqlite_failure(rusqlite::ffi::SQLITE_NOTADB).into();
        assert!(not_a_db.is_corrupt());

        let other: GlodaError = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).into();
        assert!(matches!(other, GlodaError::Database(_)));
    }

    #[test]
    fn test_error_serializes_with_tag() {
        let json = serde_json::to_string(&GlodaError::Busy("locked".into())).unwrap();
        assert_eq!(json, r#"{"type":"Busy","message":"locked"}"#);
    }
}

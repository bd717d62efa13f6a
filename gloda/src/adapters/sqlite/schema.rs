//! Schema management
//!
//! Tables are described declaratively by `TableDef`. Creating one also
//! creates, when asked for:
//! - the `<table>Text` full-text shadow table keyed by docid
//! - its indices
//! - a generic `<table>Attributes(nounID, attributeID, value)` side table
//!
//! Version policy on open (stored in `PRAGMA user_version`):
//! - 31..=34: from the future but compatible, left untouched
//! - 35..=39: from the future, lowered by 5
//! - 40 and up, or below 26: the file is deleted and recreated
//! - 26..=29: accepted as is; the version is raised later
//!
//! A file SQLite reports as corrupt is deleted and recreated.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::sqlite::pool::{create_memory_pool, create_pool, DbPool};
use crate::config::DatabaseConfig;
use crate::types::error::{GlodaError, Result};

pub const SCHEMA_VERSION: i32 = 30;
const LEAVE_LOW: i32 = 31;
const LEAVE_HIGH: i32 = 34;
const DOWNGRADE_LOW: i32 = 35;
const DOWNGRADE_HIGH: i32 = 39;
const DOWNGRADE_DELTA: i32 = 5;
const MIGRATION_FLOOR: i32 = 26;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub decl: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub fulltext_columns: Vec<ColumnDef>,
    pub indices: Vec<IndexDef>,
    pub generic_attributes: bool,
}

impl TableDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn column(mut self, name: &str, decl: &str) -> Self {
        self.columns.push(ColumnDef {
            name: name.to_string(),
            decl: decl.to_string(),
        });
        self
    }

    pub fn fulltext(mut self, name: &str, decl: &str) -> Self {
        self.fulltext_columns.push(ColumnDef {
            name: name.to_string(),
            decl: decl.to_string(),
        });
        self
    }

    pub fn index(mut self, name: &str, columns: &[&str]) -> Self {
        self.indices.push(IndexDef {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn with_generic_attributes(mut self) -> Self {
        self.generic_attributes = true;
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn text_table_name(&self) -> Option<String> {
        if self.fulltext_columns.is_empty() {
            None
        } else {
            Some(format!("{}Text", self.name))
        }
    }

    pub fn attribute_table_name(&self) -> Option<String> {
        if self.generic_attributes {
            Some(format!("{}Attributes", self.name))
        } else {
            None
        }
    }

    /// The generic side table, itself a plain table definition.
    fn attribute_table(&self) -> Option<TableDef> {
        let name = self.attribute_table_name()?;
        let index_name = format!("{}AttribQuery", self.name);
        Some(
            TableDef::new(&name)
                .column("nounID", "INTEGER NOT NULL")
                .column("attributeID", "INTEGER NOT NULL")
                .column("value", "NUMERIC")
                .index(&index_name, &["attributeID", "value", "nounID"]),
        )
    }

    pub fn create_statements(&self) -> Vec<String> {
        let mut statements = Vec::new();
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.decl))
            .collect();
        statements.push(format!("CREATE TABLE {} ({})", self.name, columns.join(", ")));

        if let Some(text_table) = self.text_table_name() {
            let columns: Vec<String> = self
                .fulltext_columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.decl))
                .collect();
            statements.push(format!(
                "CREATE VIRTUAL TABLE {} USING fts4({})",
                text_table,
                columns.join(", ")
            ));
        }

        for index in &self.indices {
            statements.push(format!(
                "CREATE INDEX {} ON {}({})",
                index.name,
                self.name,
                index.columns.join(", ")
            ));
        }

        if let Some(attribute_table) = self.attribute_table() {
            statements.extend(attribute_table.create_statements());
        }
        statements
    }

    pub fn create(&self, conn: &Connection) -> Result<()> {
        info!("Creating table: {}", self.name);
        for sql in self.create_statements() {
            conn.execute_batch(&sql)
                .map_err(|e| GlodaError::Schema(format!("{}: {}", sql, e)))?;
        }
        Ok(())
    }

    /// Creates the table unless it already exists.
    pub fn ensure(&self, conn: &Connection) -> Result<bool> {
        if table_exists(conn, &self.name)? {
            return Ok(false);
        }
        self.create(conn)?;
        Ok(true)
    }
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn folder_locations_table() -> TableDef {
    TableDef::new("folderLocations")
        .column("id", "INTEGER PRIMARY KEY")
        .column("folderURI", "TEXT NOT NULL UNIQUE")
        .column("dirtyStatus", "INTEGER NOT NULL")
        .column("name", "TEXT NOT NULL")
        .column("indexingPriority", "INTEGER NOT NULL")
        .index("folderURIIndex", &["folderURI"])
}

pub fn conversations_table() -> TableDef {
    TableDef::new("conversations")
        .column("id", "INTEGER PRIMARY KEY")
        .column("subject", "TEXT NOT NULL")
        .column("oldestMessageDate", "INTEGER")
        .column("newestMessageDate", "INTEGER")
        .fulltext("subject", "TEXT")
        .index("subject", &["subject"])
        .index("oldestMessageDate", &["oldestMessageDate"])
        .index("newestMessageDate", &["newestMessageDate"])
}

pub fn messages_table() -> TableDef {
    TableDef::new("messages")
        .column("id", "INTEGER PRIMARY KEY")
        .column("folderID", "INTEGER")
        .column("messageKey", "INTEGER")
        .column("conversationID", "INTEGER NOT NULL")
        .column("date", "INTEGER")
        .column("headerMessageID", "TEXT")
        .column("deleted", "INTEGER NOT NULL DEFAULT 0")
        .column("jsonAttributes", "TEXT")
        .column("notability", "INTEGER NOT NULL DEFAULT 0")
        .fulltext("body", "TEXT")
        .fulltext("subject", "TEXT")
        .fulltext("attachmentNames", "TEXT")
        .fulltext("author", "TEXT")
        .fulltext("recipients", "TEXT")
        .index("messageLocation", &["folderID", "messageKey"])
        .index("headerMessageID", &["headerMessageID"])
        .index("conversationID", &["conversationID"])
        .index("date", &["date"])
        .index("deleted", &["deleted"])
}

pub fn attribute_definitions_table() -> TableDef {
    TableDef::new("attributeDefinitions")
        .column("id", "INTEGER PRIMARY KEY")
        .column("attributeType", "INTEGER NOT NULL")
        .column("extensionName", "TEXT NOT NULL")
        .column("name", "TEXT NOT NULL")
        .column("parameter", "BLOB")
        .index("attributeDefinitionName", &["extensionName", "name"])
}

pub fn message_attributes_table() -> TableDef {
    TableDef::new("messageAttributes")
        .column("conversationID", "INTEGER NOT NULL")
        .column("messageID", "INTEGER NOT NULL")
        .column("attributeID", "INTEGER NOT NULL")
        .column("value", "NUMERIC")
        .index(
            "messageAttribQuery",
            &["attributeID", "value", "conversationID", "messageID"],
        )
        .index("messageAttribFastDeletion", &["messageID"])
}

pub fn contacts_table() -> TableDef {
    TableDef::new("contacts")
        .column("id", "INTEGER PRIMARY KEY")
        .column("directoryUUID", "TEXT")
        .column("contactUUID", "TEXT")
        .column("popularity", "INTEGER")
        .column("frecency", "INTEGER")
        .column("name", "TEXT")
        .column("jsonAttributes", "TEXT")
        .index("popularity", &["popularity"])
        .index("frecency", &["frecency"])
}

pub fn contact_attributes_table() -> TableDef {
    TableDef::new("contactAttributes")
        .column("contactID", "INTEGER NOT NULL")
        .column("attributeID", "INTEGER NOT NULL")
        .column("value", "NUMERIC")
        .index("contactAttribQuery", &["attributeID", "value", "contactID"])
}

pub fn identities_table() -> TableDef {
    TableDef::new("identities")
        .column("id", "INTEGER PRIMARY KEY")
        .column("contactID", "INTEGER NOT NULL")
        .column("kind", "TEXT NOT NULL")
        .column("value", "TEXT NOT NULL")
        .column("description", "NOT NULL")
        .column("relay", "INTEGER NOT NULL")
        .index("identityLookup", &["kind", "value"])
        .index("identityContact", &["contactID"])
}

fn datastore_meta_table() -> TableDef {
    TableDef::new("datastoreMeta")
        .column("key", "TEXT PRIMARY KEY")
        .column("value", "TEXT")
}

/// Every table a fresh database starts with.
pub fn core_tables() -> Vec<TableDef> {
    vec![
        folder_locations_table(),
        conversations_table(),
        messages_table(),
        attribute_definitions_table(),
        message_attributes_table(),
        contacts_table(),
        contact_attributes_table(),
        identities_table(),
        datastore_meta_table(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionAction {
    Current,
    /// Newer but compatible; leave the stored version alone.
    LeaveFuture,
    /// Newer; store the given lower version.
    Downgrade(i32),
    /// Older but readable without transformation.
    Migrate,
    /// Delete the file and start over.
    Nuke,
}

pub fn version_action(stored: i32) -> VersionAction {
    if stored == SCHEMA_VERSION {
        VersionAction::Current
    } else if stored > SCHEMA_VERSION {
        if (LEAVE_LOW..=LEAVE_HIGH).contains(&stored) {
            VersionAction::LeaveFuture
        } else if (DOWNGRADE_LOW..=DOWNGRADE_HIGH).contains(&stored) {
            VersionAction::Downgrade(stored - DOWNGRADE_DELTA)
        } else {
            VersionAction::Nuke
        }
    } else if stored < MIGRATION_FLOOR {
        VersionAction::Nuke
    } else {
        VersionAction::Migrate
    }
}

pub fn read_schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

pub fn write_schema_version(conn: &Connection, version: i32) -> Result<()> {
    // pragmas do not take bound parameters
    conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
    Ok(())
}

/// A database ready for use.
pub struct OpenedDatabase {
    pub pool: DbPool,
    /// Version the schema in the file actually has.
    pub schema_version: i32,
    pub datastore_id: String,
    /// True when the file was created (or recreated) by this open.
    pub created: bool,
    pub path: Option<PathBuf>,
}

/// Opens (creating, migrating or recreating as needed) the database at
/// `path`.
pub fn open_database(path: &Path, config: &DatabaseConfig) -> Result<OpenedDatabase> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    if !path.exists() {
        debug!("Creating database because it doesn't exist: {:?}", path);
        return create_database(path, config);
    }

    match open_existing(path, config) {
        Ok(opened) => Ok(opened),
        Err(e) if e.is_corrupt() => {
            warn!("Database was corrupt, removing the old one: {}", e);
            remove_database_files(path)?;
            warn!("Removed old database, creating a new one");
            create_database(path, config)
        }
        Err(e) => Err(e),
    }
}

/// Creates a private in-memory database with the full schema.
pub fn open_memory_database(config: &DatabaseConfig) -> Result<OpenedDatabase> {
    let pool = create_memory_pool(config.cache_pages(4096))?;
    let datastore_id = {
        let conn = pool.get()?;
        create_schema(&conn)?
    };
    Ok(OpenedDatabase {
        pool,
        schema_version: SCHEMA_VERSION,
        datastore_id,
        created: true,
        path: None,
    })
}

fn open_existing(path: &Path, config: &DatabaseConfig) -> Result<OpenedDatabase> {
    let probe = Connection::open(path)?;
    let stored = read_schema_version(&probe)?;
    let page_size = page_size(&probe);

    let schema_version = match version_action(stored) {
        VersionAction::Current => stored,
        VersionAction::LeaveFuture => {
            debug!("Database from the future in acceptable range; leaving version at {}", stored);
            stored
        }
        VersionAction::Downgrade(lowered) => {
            debug!(
                "Database from the future in downgrade range; setting version to {} down from {}",
                lowered, stored
            );
            write_schema_version(&probe, lowered)?;
            lowered
        }
        VersionAction::Migrate => {
            debug!(
                "Database needs migration (DB version: {}, desired version: {}); no transform required",
                stored, SCHEMA_VERSION
            );
            stored
        }
        VersionAction::Nuke => {
            drop(probe);
            remove_database_files(path)?;
            warn!(
                "Global database has been purged due to schema change. Old version was {}, new version is {}",
                stored, SCHEMA_VERSION
            );
            return create_database(path, config);
        }
    };
    drop(probe);

    let pool = create_pool(path, config.cache_pages(page_size))?;
    let datastore_id = {
        let conn = pool.get()?;
        ensure_datastore_id(&conn)?
    };

    Ok(OpenedDatabase {
        pool,
        schema_version,
        datastore_id,
        created: false,
        path: Some(path.to_path_buf()),
    })
}

fn create_database(path: &Path, config: &DatabaseConfig) -> Result<OpenedDatabase> {
    let page_size = {
        let probe = Connection::open(path)?;
        page_size(&probe)
    };
    let pool = create_pool(path, config.cache_pages(page_size))?;
    let datastore_id = {
        let conn = pool.get()?;
        create_schema(&conn)?
    };
    info!("Created database at {:?}", path);
    Ok(OpenedDatabase {
        pool,
        schema_version: SCHEMA_VERSION,
        datastore_id,
        created: true,
        path: Some(path.to_path_buf()),
    })
}

/// Creates every core table in one transaction, stamps the schema version
/// and generates a fresh datastore id.
fn create_schema(conn: &Connection) -> Result<String> {
    let tx = conn.unchecked_transaction()?;
    for table in core_tables() {
        table.create(&tx)?;
    }
    write_schema_version(&tx, SCHEMA_VERSION)?;
    let datastore_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO datastoreMeta (key, value) VALUES ('id', ?1)",
        params![datastore_id],
    )?;
    tx.commit()?;
    Ok(datastore_id)
}

fn ensure_datastore_id(conn: &Connection) -> Result<String> {
    datastore_meta_table().ensure(conn)?;
    let existing: Option<String> = conn
        .query_row("SELECT value FROM datastoreMeta WHERE key = 'id'", [], |row| row.get(0))
        .optional()?;
    match existing {
        Some(id) => Ok(id),
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO datastoreMeta (key, value) VALUES ('id', ?1)",
                params![id],
            )?;
            Ok(id)
        }
    }
}

fn page_size(conn: &Connection) -> i64 {
    conn.query_row("PRAGMA page_size", [], |row| row.get(0))
        .unwrap_or_else(|e| {
            warn!("Unable to read page size, using fallback cache size: {}", e);
            0
        })
}

fn remove_database_files(path: &Path) -> Result<()> {
    fs::remove_file(path)?;
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if sidecar.exists() {
            fs::remove_file(&sidecar)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_bands() {
        assert_eq!(version_action(30), VersionAction::Current);
        assert_eq!(version_action(31), VersionAction::LeaveFuture);
        assert_eq!(version_action(34), VersionAction::LeaveFuture);
        assert_eq!(version_action(35), VersionAction::Downgrade(30));
        assert_eq!(version_action(39), VersionAction::Downgrade(34));
        assert_eq!(version_action(40), VersionAction::Nuke);
        assert_eq!(version_action(29), VersionAction::Migrate);
        assert_eq!(version_action(26), VersionAction::Migrate);
        assert_eq!(version_action(25), VersionAction::Nuke);
        assert_eq!(version_action(0), VersionAction::Nuke);
    }

    #[test]
    fn test_generic_attributes_table_is_derived() {
        let table = TableDef::new("widgets")
            .column("id", "INTEGER PRIMARY KEY")
            .column("name", "TEXT")
            .fulltext("name", "TEXT")
            .with_generic_attributes();
        let statements = table.create_statements();
        assert_eq!(statements[0], "CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT)");
        assert_eq!(statements[1], "CREATE VIRTUAL TABLE widgetsText USING fts4(name TEXT)");
        assert!(statements.contains(
            &"CREATE TABLE widgetsAttributes (nounID INTEGER NOT NULL, attributeID INTEGER NOT NULL, value NUMERIC)"
                .to_string()
        ));
        assert!(statements.contains(
            &"CREATE INDEX widgetsAttribQuery ON widgetsAttributes(attributeID, value, nounID)".to_string()
        ));

        let conn = Connection::open_in_memory().unwrap();
        assert!(table.ensure(&conn).unwrap());
        assert!(!table.ensure(&conn).unwrap());
        assert!(table_exists(&conn, "widgetsAttributes").unwrap());
    }

    #[test]
    fn test_memory_database_has_core_schema() {
        let opened = open_memory_database(&DatabaseConfig::default()).unwrap();
        let conn = opened.pool.get().unwrap();
        for table in core_tables() {
            assert!(table_exists(&conn, &table.name).unwrap(), "{}", table.name);
        }
        assert!(table_exists(&conn, "messagesText").unwrap());
        assert_eq!(read_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(opened.datastore_id.len(), 36);
    }

    #[test]
    fn test_reopen_keeps_datastore_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gloda.sqlite");
        let config = DatabaseConfig::default();

        let first = open_database(&path, &config).unwrap();
        assert!(first.created);
        let id = first.datastore_id.clone();
        drop(first);

        let second = open_database(&path, &config).unwrap();
        assert!(!second.created);
        assert_eq!(second.datastore_id, id);
    }

    #[test]
    fn test_garbage_file_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gloda.sqlite");
        fs::write(&path, vec![0x42u8; 8192]).unwrap();

        let opened = open_database(&path, &DatabaseConfig::default()).unwrap();
        assert!(opened.created);
        let conn = opened.pool.get().unwrap();
        assert!(table_exists(&conn, "messages").unwrap());
    }
}

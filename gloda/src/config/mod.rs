use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

use crate::types::error::GlodaError;
use crate::types::{
    NounId, NOUN_CONTACT, NOUN_CONVERSATION, NOUN_FOLDER, NOUN_IDENTITY, NOUN_MESSAGE,
};

/// Global configuration instance
static CONFIG: OnceCell<RwLock<DatastoreConfig>> = OnceCell::new();

pub const DEFAULT_DB_FILE_NAME: &str = "global-messages-db.sqlite";

/// Smallest LRU cache any noun gets.
pub const MIN_NOUN_CACHE_SIZE: usize = 32;

const MIN_PAGE_CACHE_BYTES: u64 = 8 * 1024 * 1024;
const MAX_PAGE_CACHE_BYTES: u64 = 64 * 1024 * 1024;
const FALLBACK_PHYSICAL_MEMORY: u64 = 256 * 1024 * 1024;
pub const FALLBACK_CACHE_PAGES: i64 = 1000;

/// Datastore configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatastoreConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub folders: FolderConfig,
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file (default: <data dir>/gloda/global-messages-db.sqlite)
    pub path: Option<PathBuf>,

    /// How many times a synchronous statement is retried on SQLITE_BUSY
    #[serde(default = "default_busy_retry_limit")]
    pub busy_retry_limit: u32,

    /// Share of physical memory, in permille, given to the page cache
    #[serde(default = "default_cache_permillage")]
    pub cache_to_memory_permillage: u32,

    /// Physical memory size used for the page cache computation
    pub physical_memory_bytes: Option<u64>,

    /// When set, the EXPLAIN output of every async query is dumped here
    pub explain_to_path: Option<PathBuf>,
}

/// Per-noun LRU cache sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_folder_cache")]
    pub folder: usize,

    #[serde(default = "default_conversation_cache")]
    pub conversation: usize,

    #[serde(default = "default_message_cache")]
    pub message: usize,

    #[serde(default = "default_contact_cache")]
    pub contact: usize,

    #[serde(default = "default_identity_cache")]
    pub identity: usize,

    /// Size for nouns registered at runtime
    #[serde(default = "default_extension_cache")]
    pub default: usize,
}

/// Folder handle lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    /// Period of the sweep releasing unused folder handles
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Quiet time after a header retrieval before a handle may be released
    #[serde(default = "default_acceptably_old_threshold")]
    pub acceptably_old_threshold_ms: i64,
}

fn default_busy_retry_limit() -> u32 {
    32000
}

fn default_cache_permillage() -> u32 {
    10
}

fn default_folder_cache() -> usize {
    64
}

fn default_conversation_cache() -> usize {
    512
}

fn default_message_cache() -> usize {
    2048
}

fn default_contact_cache() -> usize {
    128
}

fn default_identity_cache() -> usize {
    256
}

fn default_extension_cache() -> usize {
    64
}

fn default_cleanup_interval() -> u64 {
    2000
}

fn default_acceptably_old_threshold() -> i64 {
    10000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_retry_limit: default_busy_retry_limit(),
            cache_to_memory_permillage: default_cache_permillage(),
            physical_memory_bytes: None,
            explain_to_path: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            folder: default_folder_cache(),
            conversation: default_conversation_cache(),
            message: default_message_cache(),
            contact: default_contact_cache(),
            identity: default_identity_cache(),
            default: default_extension_cache(),
        }
    }
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval(),
            acceptably_old_threshold_ms: default_acceptably_old_threshold(),
        }
    }
}

impl DatabaseConfig {
    /// The configured database file, or the default one under the user's
    /// data directory.
    pub fn resolved_path(&self) -> Result<PathBuf, GlodaError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        dirs::data_local_dir()
            .map(|dir| dir.join("gloda").join(DEFAULT_DB_FILE_NAME))
            .ok_or_else(|| GlodaError::Config("No data directory available".into()))
    }

    /// Page cache size in pages for the given page size: a permille share of
    /// physical memory bounded to [8 MiB, 64 MiB].
    pub fn cache_pages(&self, page_size: i64) -> i64 {
        if page_size <= 0 {
            return FALLBACK_CACHE_PAGES;
        }
        let permillage = self.cache_to_memory_permillage.min(50) as u64;
        let memory = self
            .physical_memory_bytes
            .unwrap_or(FALLBACK_PHYSICAL_MEMORY);
        let bytes = (memory.saturating_mul(permillage) as f64 / 1000.0).round() as u64;
        let bytes = bytes.clamp(MIN_PAGE_CACHE_BYTES, MAX_PAGE_CACHE_BYTES);
        (bytes as f64 / page_size as f64).round() as i64
    }
}

impl CacheConfig {
    pub fn size_for(&self, noun: NounId) -> usize {
        let size = match noun {
            NOUN_FOLDER => self.folder,
            NOUN_CONVERSATION => self.conversation,
            NOUN_MESSAGE => self.message,
            NOUN_CONTACT => self.contact,
            NOUN_IDENTITY => self.identity,
            _ => self.default,
        };
        size.max(MIN_NOUN_CACHE_SIZE)
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("gloda").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".gloda.toml"));
    }

    paths
}

/// Initialize configuration from default paths
pub fn init_config() -> Result<(), GlodaError> {
    info!("Initializing configuration from default paths");

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return init_config_from_path(&path);
        }
    }

    info!("No config file found, using defaults");
    set_config(DatastoreConfig::default())
}

/// Initialize configuration from a specific path
pub fn init_config_from_path(path: &Path) -> Result<(), GlodaError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| GlodaError::Config(format!("Failed to read config: {}", e)))?;

    let config = parse_config(&content)?;
    set_config(config)
}

pub fn parse_config(content: &str) -> Result<DatastoreConfig, GlodaError> {
    toml::from_str(content).map_err(|e| GlodaError::Config(format!("Failed to parse config: {}", e)))
}

/// Set the global configuration
pub fn set_config(config: DatastoreConfig) -> Result<(), GlodaError> {
    match CONFIG.get() {
        Some(lock) => {
            let mut guard = lock
                .write()
                .map_err(|e| GlodaError::Config(format!("Failed to lock config: {}", e)))?;
            *guard = config;
        }
        None => {
            CONFIG.set(RwLock::new(config)).ok();
        }
    }
    Ok(())
}

/// Current global configuration, defaults when never initialized
pub fn get_config() -> DatastoreConfig {
    CONFIG
        .get()
        .and_then(|lock| lock.read().ok().map(|c| c.clone()))
        .unwrap_or_default()
}

/// Check if configuration is initialized
pub fn is_initialized() -> bool {
    CONFIG.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = parse_config(
            r#"
            [database]
            path = "/tmp/gloda.sqlite"

            [cache]
            message = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/gloda.sqlite")));
        assert_eq!(config.database.busy_retry_limit, 32000);
        assert_eq!(config.folders.cleanup_interval_ms, 2000);
        assert_eq!(config.folders.acceptably_old_threshold_ms, 10000);
        // below the floor
        assert_eq!(config.cache.size_for(NOUN_MESSAGE), MIN_NOUN_CACHE_SIZE);
        assert_eq!(config.cache.size_for(NOUN_CONTACT), 128);
        assert_eq!(config.cache.size_for(5000), 64);
    }

    #[test]
    fn test_empty_file_is_valid() {
        let config = parse_config("").unwrap();
        assert_eq!(config.database.cache_to_memory_permillage, 10);
        assert!(config.database.explain_to_path.is_none());
    }

    #[test]
    fn test_cache_pages_are_bounded() {
        let mut db = DatabaseConfig::default();
        // 1% of 256 MiB is below the 8 MiB floor
        assert_eq!(db.cache_pages(1024), 8 * 1024);

        db.physical_memory_bytes = Some(2 * 1024 * 1024 * 1024);
        db.cache_to_memory_permillage = 20;
        // 2% of 2 GiB is 40.96 MiB
        assert_eq!(db.cache_pages(4096), 10486);

        db.cache_to_memory_permillage = 900;
        assert_eq!(db.cache_pages(4096), 64 * 1024 * 1024 / 4096);

        assert_eq!(db.cache_pages(0), FALLBACK_CACHE_PAGES);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let err = parse_config("[database\n").unwrap_err();
        assert!(matches!(err, GlodaError::Config(_)));
    }
}

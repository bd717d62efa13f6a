//! The datastore
//!
//! `Datastore` owns the database connection (through the SQL executor), the
//! noun registry, the collection/cache manager and the id sequences. It is
//! shared as `Arc<Datastore>`. Entity operations live in one file per noun:
//! - `attributes`: attribute definitions and attribute rows
//! - `folders`: the folder URI mapping
//! - `conversations`, `messages`, `contacts`, `identities`
//!
//! Writes are queued on the executor and return a `Pending` the caller may
//! await or drop. Reads that must answer immediately use the synchronous
//! path and are only meant for startup-like code.

pub mod attributes;
pub mod contacts;
pub mod conversations;
pub mod folders;
pub mod identities;
pub mod messages;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::adapters::sqlite::explain::ExplainWriter;
use crate::adapters::sqlite::schema::{
    open_database, open_memory_database, version_action, write_schema_version,
    OpenedDatabase, VersionAction,
};
use crate::adapters::sqlite::{
    ManagedId, Pending, SqlExecutor, TransactionCoordinator, SCHEMA_VERSION,
};
use crate::cache::{Collection, CollectionListener, CollectionManager};
use crate::config::DatastoreConfig;
use crate::nouns::{builtin_attributes, builtin_nouns, AttributeBinder, NounDef, NounRegistry};
use crate::query::{Query, QueryResolver};
use crate::services::FolderLivenessTracker;
use crate::types::{GlodaError, ItemRef, NounId, Result};

pub use attributes::{AttributeRow, AttributeStore};
pub use folders::FolderDescriptor;

/// Id sequences of the built-in nouns.
struct ManagedIds {
    folder: ManagedId,
    conversation: ManagedId,
    message: ManagedId,
    contact: ManagedId,
    identity: ManagedId,
}

pub struct Datastore {
    config: DatastoreConfig,
    executor: Arc<SqlExecutor>,
    transactions: TransactionCoordinator,
    registry: Arc<RwLock<NounRegistry>>,
    cache: Arc<CollectionManager>,
    attributes: Arc<AttributeStore>,
    resolver: QueryResolver,
    ids: ManagedIds,
    /// Sequences of nouns registered at runtime.
    noun_ids: Mutex<HashMap<NounId, Arc<ManagedId>>>,
    folders: RwLock<folders::FolderMaps>,
    liveness: FolderLivenessTracker,
    schema_version: AtomicI32,
    datastore_id: String,
    path: Option<PathBuf>,
    shut_down: AtomicBool,
}

impl Datastore {
    /// Opens the database at the configured path, creating, migrating or
    /// recreating it as needed.
    pub fn open(config: DatastoreConfig) -> Result<Arc<Self>> {
        let path = config.database.resolved_path()?;
        info!("Opening datastore at {:?}", path);
        let opened = open_database(&path, &config.database)?;
        Self::from_opened(config, opened)
    }

    /// Opens a private in-memory datastore.
    pub fn open_in_memory(config: DatastoreConfig) -> Result<Arc<Self>> {
        let opened = open_memory_database(&config.database)?;
        Self::from_opened(config, opened)
    }

    fn from_opened(config: DatastoreConfig, opened: OpenedDatabase) -> Result<Arc<Self>> {
        let explain = match &config.database.explain_to_path {
            Some(path) => {
                info!("Dumping EXPLAIN output to {:?}", path);
                Some(ExplainWriter::create(path)?)
            }
            None => None,
        };
        let executor = Arc::new(SqlExecutor::new(
            opened.pool,
            config.database.busy_retry_limit,
            explain,
        )?);

        let registry = Arc::new(RwLock::new(NounRegistry::new()));
        {
            let mut registry = registry
                .write()
                .map_err(|_| GlodaError::Other("noun registry lock poisoned".into()))?;
            for noun in builtin_nouns() {
                registry.register_noun(noun)?;
            }
        }

        let seed = |table: &str, floor: i64| {
            executor.execute_sync(|conn| ManagedId::seed(conn, table, floor))
        };
        let ids = ManagedIds {
            folder: seed("folderLocations", 1)?,
            conversation: seed("conversations", 1)?,
            message: seed("messages", 32)?,
            contact: seed("contacts", 1)?,
            identity: seed("identities", 1)?,
        };

        let attributes = Arc::new(AttributeStore::load(
            executor.clone(),
            registry.clone(),
            seed("attributeDefinitions", 32)?,
        )?);
        for spec in builtin_attributes() {
            attributes.define(spec)?;
        }

        let folder_maps = folders::load_folders(&executor)?;

        let cache = Arc::new(CollectionManager::new(config.cache.clone()));
        let binder: Arc<dyn AttributeBinder> = attributes.clone();
        let resolver = QueryResolver::new(executor.clone(), registry.clone(), cache.clone(), binder);
        let liveness = FolderLivenessTracker::new(&config.folders);

        let datastore = Arc::new(Self {
            transactions: TransactionCoordinator::new(executor.clone()),
            executor,
            registry,
            cache,
            attributes,
            resolver,
            ids,
            noun_ids: Mutex::new(HashMap::new()),
            folders: RwLock::new(folder_maps),
            liveness,
            schema_version: AtomicI32::new(opened.schema_version),
            datastore_id: opened.datastore_id,
            path: opened.path,
            shut_down: AtomicBool::new(false),
            config,
        });

        if version_action(opened.schema_version) == VersionAction::Migrate {
            info!(
                "Raising schema version from {} to {}",
                opened.schema_version, SCHEMA_VERSION
            );
            drop(datastore.update_schema_version(SCHEMA_VERSION));
        }

        info!(
            "Datastore {} ready (schema version {})",
            datastore.datastore_id,
            datastore.schema_version()
        );
        Ok(datastore)
    }

    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    pub fn datastore_id(&self) -> &str {
        &self.datastore_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Version the schema in the file currently has.
    pub fn schema_version(&self) -> i32 {
        self.schema_version.load(Ordering::SeqCst)
    }

    /// Stores a new schema version. Runs outside the transaction state.
    pub fn update_schema_version(&self, version: i32) -> Pending<()> {
        self.schema_version.store(version, Ordering::SeqCst);
        self.executor
            .execute_async(move |conn| write_schema_version(conn, version))
    }

    pub fn collection_manager(&self) -> &Arc<CollectionManager> {
        &self.cache
    }

    pub fn executor(&self) -> &Arc<SqlExecutor> {
        &self.executor
    }

    pub fn liveness(&self) -> &FolderLivenessTracker {
        &self.liveness
    }

    pub(crate) fn registry(&self) -> Result<RwLockReadGuard<'_, NounRegistry>> {
        self.registry
            .read()
            .map_err(|_| GlodaError::Other("noun registry lock poisoned".into()))
    }

    pub fn noun(&self, id: NounId) -> Result<Arc<dyn NounDef>> {
        self.registry()?.noun(id)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(GlodaError::Shutdown)
        } else {
            Ok(())
        }
    }

    /* ---------- transactions ---------- */

    /// Opens a (possibly nested) transaction.
    pub fn begin_transaction(&self) {
        self.transactions.begin();
    }

    pub fn commit_transaction(&self) -> Pending<()> {
        self.transactions.commit()
    }

    /// Rolls back, poisoning every enclosing level.
    pub fn rollback_transaction(&self) -> Pending<()> {
        self.transactions.rollback()
    }

    pub fn transaction_depth(&self) -> u32 {
        self.transactions.depth()
    }

    pub fn run_post_commit(&self, callback: Box<dyn FnOnce() + Send>) {
        self.transactions.run_post_commit(callback);
    }

    /* ---------- nouns ---------- */

    /// Registers a noun at runtime, creating its tables when missing.
    pub fn register_noun(&self, noun: Arc<dyn NounDef>) -> Result<()> {
        self.check_open()?;
        if self.registry()?.has_noun(noun.id()) {
            return Err(GlodaError::InvalidInput(format!(
                "noun {} is already registered",
                noun.id()
            )));
        }
        if let Some(table) = noun.table() {
            let created = self.executor.execute_sync(|conn| {
                let tx = conn.unchecked_transaction()?;
                let created = table.ensure(&tx)?;
                tx.commit()?;
                Ok(created)
            })?;
            if !created {
                debug!("Table {} already exists", table.name);
            }
            let sequence = self
                .executor
                .execute_sync(|conn| ManagedId::seed(conn, &table.name, 1))?;
            if let Ok(mut noun_ids) = self.noun_ids.lock() {
                noun_ids.insert(noun.id(), Arc::new(sequence));
            }
        }
        info!("Registered noun {} ({})", noun.name(), noun.id());
        self.registry
            .write()
            .map_err(|_| GlodaError::Other("noun registry lock poisoned".into()))?
            .register_noun(noun)
    }

    /// Next id for an item of a runtime-registered noun.
    pub fn allocate_id(&self, noun: NounId) -> Result<i64> {
        self.noun_ids
            .lock()
            .ok()
            .and_then(|ids| ids.get(&noun).cloned())
            .map(|sequence| sequence.allocate())
            .ok_or(GlodaError::UnknownNoun(noun))
    }

    /// Inserts an item of any persisted noun and announces it.
    pub fn insert_item(&self, item: ItemRef) -> Result<Pending<()>> {
        self.check_open()?;
        let noun = self.noun(item.noun_id())?;
        let row = item.clone();
        let pending = self
            .executor
            .execute_async(move |conn| noun.insert(conn, &row));
        self.cache.items_added(item.noun_id(), &[item]);
        Ok(pending)
    }

    /* ---------- queries ---------- */

    /// Runs `query`; the returned collection stays live until dropped.
    pub async fn query(
        &self,
        query: Query,
        listener: Option<Arc<dyn CollectionListener>>,
    ) -> Result<Arc<Collection>> {
        self.check_open()?;
        self.resolver.query(query, listener).await
    }

    /// Runs `query` and returns its items without keeping a collection.
    pub async fn load(&self, query: Query) -> Result<Vec<ItemRef>> {
        self.check_open()?;
        self.resolver.load(query).await
    }

    /// Resolves once every queued statement has run.
    pub async fn drain(&self) {
        self.executor.drain().await;
    }

    /// Commits open transactions, stops the folder timer and waits for all
    /// queued work before closing the executor.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down datastore {}", self.datastore_id);
        let depth = self.transactions.depth();
        if depth > 0 {
            warn!("Committing {} open transaction levels at shutdown", depth);
        }
        if let Err(e) = self.transactions.commit_all().await {
            warn!("Final commit failed: {}", e);
        }
        self.liveness.stop();
        self.executor.shutdown().await?;
        info!("Datastore shut down");
        Ok(())
    }
}

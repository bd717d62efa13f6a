//! Folder URI mapping
//!
//! Every folder of the external store is known by URI. The mapping to a
//! datastore id lives in `folderLocations` and is mirrored in two maps
//! loaded at startup. Lookups never touch the database.

use rusqlite::params;
use std::collections::HashMap;
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use super::Datastore;
use crate::adapters::sqlite::{prepare, Pending, SqlExecutor};
use crate::services::folder_liveness::now_ms;
use crate::types::{
    DirtyStatus, FolderActivity, FolderHandle, GlodaError, GlodaFolder, GlodaItem,
    IndexingPriority, Result,
};

#[derive(Default)]
pub(crate) struct FolderMaps {
    by_uri: HashMap<String, Arc<GlodaFolder>>,
    by_id: HashMap<i64, Arc<GlodaFolder>>,
}

impl FolderMaps {
    fn insert(&mut self, folder: Arc<GlodaFolder>) {
        self.by_uri.insert(folder.uri(), folder.clone());
        self.by_id.insert(folder.id(), folder);
    }

    fn remove(&mut self, folder: &GlodaFolder) {
        self.by_uri.remove(&folder.uri());
        self.by_id.remove(&folder.id());
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// What the mail store tells us about a folder the first time we see it.
#[derive(Debug, Clone)]
pub struct FolderDescriptor {
    pub uri: String,
    pub name: String,
    pub indexing_priority: IndexingPriority,
    /// Messages currently in the folder; a non-empty folder starts filthy.
    pub total_messages: u64,
}

impl FolderDescriptor {
    pub fn new(uri: &str) -> Self {
        let name = uri
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(uri)
            .to_string();
        Self {
            uri: uri.to_string(),
            name,
            indexing_priority: IndexingPriority::DEFAULT,
            total_messages: 0,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_priority(mut self, priority: IndexingPriority) -> Self {
        self.indexing_priority = priority;
        self
    }

    pub fn with_total_messages(mut self, total: u64) -> Self {
        self.total_messages = total;
        self
    }
}

/// Reads every `folderLocations` row. Runs once at startup.
pub(crate) fn load_folders(executor: &SqlExecutor) -> Result<FolderMaps> {
    let rows = executor.execute_sync(|conn| {
        let mut stmt = prepare(
            conn,
            "SELECT id, folderURI, dirtyStatus, name, indexingPriority FROM folderLocations",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(GlodaFolder::new(
                    row.get(0)?,
                    row.get::<_, String>(1)?,
                    row.get(2)?,
                    row.get::<_, String>(3)?,
                    IndexingPriority(row.get(4)?),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;

    let mut maps = FolderMaps::default();
    for folder in rows {
        maps.insert(Arc::new(folder));
    }
    debug!("Loaded {} folder mappings", maps.len());
    Ok(maps)
}

impl Datastore {
    fn folder_maps(&self) -> Result<RwLockReadGuard<'_, FolderMaps>> {
        self.folders
            .read()
            .map_err(|_| GlodaError::Other("folder map lock poisoned".into()))
    }

    fn folder_maps_mut(&self) -> Result<RwLockWriteGuard<'_, FolderMaps>> {
        self.folders
            .write()
            .map_err(|_| GlodaError::Other("folder map lock poisoned".into()))
    }

    /// Returns the folder mapped to `descriptor.uri`, creating the mapping
    /// on first sight.
    pub fn map_folder(&self, descriptor: &FolderDescriptor) -> Result<Arc<GlodaFolder>> {
        self.check_open()?;
        if let Some(folder) = self.folder_maps()?.by_uri.get(&descriptor.uri) {
            return Ok(folder.clone());
        }

        let mut maps = self.folder_maps_mut()?;
        // lost a race with another mapper
        if let Some(folder) = maps.by_uri.get(&descriptor.uri) {
            return Ok(folder.clone());
        }

        let status = if descriptor.total_messages > 0 {
            DirtyStatus::Filthy
        } else {
            DirtyStatus::Clean
        };
        let folder = Arc::new(GlodaFolder::new(
            self.ids.folder.allocate(),
            descriptor.uri.clone(),
            status.to_bits(),
            descriptor.name.clone(),
            descriptor.indexing_priority,
        ));

        let id = folder.id();
        let uri = descriptor.uri.clone();
        let name = descriptor.name.clone();
        let priority = descriptor.indexing_priority.0;
        let bits = folder.dirty_bits();
        drop(self.executor.execute_async(move |conn| {
            prepare(
                conn,
                "INSERT INTO folderLocations (id, folderURI, dirtyStatus, name, indexingPriority) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![id, uri, bits, name, priority])?;
            Ok(())
        }));

        info!("Mapped folder {} to id {}", descriptor.uri, id);
        maps.insert(folder.clone());
        Ok(folder)
    }

    /// Maps a bare URI, naming the folder after its last path segment.
    pub fn map_folder_uri(&self, uri: &str) -> Result<Arc<GlodaFolder>> {
        self.map_folder(&FolderDescriptor::new(uri))
    }

    pub fn folder_by_id(&self, id: i64) -> Option<Arc<GlodaFolder>> {
        self.folder_maps().ok()?.by_id.get(&id).cloned()
    }

    pub fn folder_by_uri(&self, uri: &str) -> Option<Arc<GlodaFolder>> {
        self.folder_maps().ok()?.by_uri.get(uri).cloned()
    }

    pub fn folder_count(&self) -> usize {
        self.folder_maps().map(|maps| maps.len()).unwrap_or(0)
    }

    fn write_dirty_bits(&self, folder: &GlodaFolder) -> Pending<()> {
        let id = folder.id();
        let bits = folder.dirty_bits();
        self.executor.execute_async(move |conn| {
            prepare(conn, "UPDATE folderLocations SET dirtyStatus = ?1 WHERE id = ?2")?
                .execute(params![bits, id])?;
            Ok(())
        })
    }

    /// Persists a new dirty status when it differs from the current one.
    pub fn update_folder_dirty_status(
        &self,
        folder: &GlodaFolder,
        status: DirtyStatus,
    ) -> Result<Pending<()>> {
        self.check_open()?;
        if !folder.set_dirty_status(status) {
            return Ok(Pending::ready(Ok(())));
        }
        debug!("Folder {} is now {:?}", folder.id(), status);
        Ok(self.write_dirty_bits(folder))
    }

    pub fn update_folder_compacted(&self, folder: &GlodaFolder, compacted: bool) -> Result<Pending<()>> {
        self.check_open()?;
        if !folder.set_compacted(compacted) {
            return Ok(Pending::ready(Ok(())));
        }
        Ok(self.write_dirty_bits(folder))
    }

    pub fn update_folder_indexing_priority(
        &self,
        folder: &GlodaFolder,
        priority: IndexingPriority,
    ) -> Result<Pending<()>> {
        self.check_open()?;
        folder.set_indexing_priority(priority);
        let id = folder.id();
        Ok(self.executor.execute_async(move |conn| {
            prepare(conn, "UPDATE folderLocations SET indexingPriority = ?1 WHERE id = ?2")?
                .execute(params![priority.0, id])?;
            Ok(())
        }))
    }

    /// Moves the mapping of `old_uri` to `new_uri`, keeping the folder id.
    pub fn rename_folder(&self, old_uri: &str, new_uri: &str, new_name: Option<&str>) -> Result<Pending<()>> {
        self.check_open()?;
        let mut maps = self.folder_maps_mut()?;
        let folder = maps
            .by_uri
            .remove(old_uri)
            .ok_or_else(|| GlodaError::InvalidInput(format!("unknown folder {}", old_uri)))?;
        folder.set_uri(new_uri);
        if let Some(name) = new_name {
            folder.set_name(name);
        }
        maps.by_uri.insert(new_uri.to_string(), folder.clone());
        drop(maps);

        info!("Renamed folder {} from {} to {}", folder.id(), old_uri, new_uri);
        let id = folder.id();
        let uri = new_uri.to_string();
        let name = folder.name();
        Ok(self.executor.execute_async(move |conn| {
            prepare(conn, "UPDATE folderLocations SET folderURI = ?1, name = ?2 WHERE id = ?3")?
                .execute(params![uri, name, id])?;
            Ok(())
        }))
    }

    /// Tombstones the folder and deletes its row. Lookups fail right away,
    /// before the delete has run.
    pub fn delete_folder_by_id(&self, id: i64) -> Result<Pending<()>> {
        self.check_open()?;
        {
            let mut maps = self.folder_maps_mut()?;
            if let Some(folder) = maps.by_id.get(&id).cloned() {
                folder.mark_deleted();
                maps.remove(&folder);
            }
        }
        info!("Deleting folder {}", id);
        Ok(self.executor.execute_async(move |conn| {
            prepare(conn, "DELETE FROM folderLocations WHERE id = ?1")?.execute(params![id])?;
            Ok(())
        }))
    }

    /// Records `activity` on `folder`, attaching `handle` when it has none.
    /// Folders used for header retrieval are tracked until they go quiet.
    pub fn acquire_folder(
        &self,
        folder: &Arc<GlodaFolder>,
        handle: Option<Arc<dyn FolderHandle>>,
        activity: FolderActivity,
    ) -> Result<()> {
        self.check_open()?;
        if folder.is_deleted() {
            return Err(GlodaError::InvalidInput(format!("folder {} was deleted", folder.id())));
        }
        if activity != FolderActivity::FolderOnlyNoData && !folder.has_handle() {
            if let Some(handle) = handle {
                folder.attach_handle(handle);
            }
        }
        if folder.note_activity(activity, now_ms()) {
            self.liveness.track(folder.clone());
        }
        Ok(())
    }

    /// Clears the indexing flag and releases the handle if nothing else
    /// needs it.
    pub fn folder_indexing_done(&self, folder: &GlodaFolder) {
        folder.set_indexing(false, now_ms(), self.liveness.threshold_ms());
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DatastoreConfig;
    use crate::datastore::{Datastore, FolderDescriptor};
    use crate::types::{DirtyStatus, FolderActivity, FolderHandle, GlodaItem, IndexingPriority};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct Handle {
        releases: AtomicUsize,
    }

    impl FolderHandle for Handle {
        fn release_database(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stored(ds: &Datastore, id: i64) -> Option<(String, i64, i64)> {
        use rusqlite::OptionalExtension;
        ds.executor()
            .execute_sync(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT folderURI, dirtyStatus, indexingPriority FROM folderLocations WHERE id = ?1",
                        [id],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .optional()?)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_map_folder_is_stable_and_starts_filthy_when_full() {
        let ds = Datastore::open_in_memory(DatastoreConfig::default()).unwrap();
        let inbox = ds
            .map_folder(
                &FolderDescriptor::new("mailbox://me@host/Inbox")
                    .with_priority(IndexingPriority::INBOX)
                    .with_total_messages(12),
            )
            .unwrap();
        let again = ds.map_folder_uri("mailbox://me@host/Inbox").unwrap();
        assert!(Arc::ptr_eq(&inbox, &again));
        assert_eq!(inbox.name(), "Inbox");
        assert_eq!(inbox.dirty_status(), DirtyStatus::Filthy);

        let empty = ds.map_folder_uri("mailbox://me@host/Archive").unwrap();
        assert_eq!(empty.id(), inbox.id() + 1);
        assert_eq!(empty.dirty_status(), DirtyStatus::Clean);

        ds.drain().await;
        assert_eq!(
            stored(&ds, inbox.id()),
            Some(("mailbox://me@host/Inbox".to_string(), 2, 50))
        );
    }

    #[tokio::test]
    async fn test_status_and_priority_updates_persist() {
        let ds = Datastore::open_in_memory(DatastoreConfig::default()).unwrap();
        let folder = ds.map_folder_uri("imap://me@host/Lists").unwrap();

        ds.update_folder_dirty_status(&folder, DirtyStatus::Dirty)
            .unwrap()
            .await
            .unwrap();
        ds.update_folder_compacted(&folder, true).unwrap().await.unwrap();
        ds.update_folder_indexing_priority(&folder, IndexingPriority::NEVER)
            .unwrap()
            .await
            .unwrap();

        assert_eq!(folder.dirty_status(), DirtyStatus::Dirty);
        assert!(folder.compacted());
        assert_eq!(stored(&ds, folder.id()), Some(("imap://me@host/Lists".to_string(), 0x9, -1)));
    }

    #[tokio::test]
    async fn test_rename_keeps_id() {
        let ds = Datastore::open_in_memory(DatastoreConfig::default()).unwrap();
        let folder = ds.map_folder_uri("imap://me@host/Old").unwrap();
        ds.rename_folder("imap://me@host/Old", "imap://me@host/New", Some("New"))
            .unwrap()
            .await
            .unwrap();

        assert!(ds.folder_by_uri("imap://me@host/Old").is_none());
        let renamed = ds.folder_by_uri("imap://me@host/New").unwrap();
        assert!(Arc::ptr_eq(&renamed, &folder));
        assert_eq!(renamed.name(), "New");
        assert_eq!(stored(&ds, folder.id()).map(|s| s.0), Some("imap://me@host/New".to_string()));
        assert!(ds.rename_folder("imap://me@host/Old", "x", None).is_err());
    }

    #[tokio::test]
    async fn test_acquire_for_indexing_keeps_handle_until_done() {
        let ds = Datastore::open_in_memory(DatastoreConfig::default()).unwrap();
        let folder = ds.map_folder_uri("imap://me@host/Work").unwrap();
        let handle = Arc::new(Handle::default());

        ds.acquire_folder(&folder, Some(handle.clone()), FolderActivity::Indexing)
            .unwrap();
        assert!(folder.indexing());
        assert!(folder.has_handle());
        assert_eq!(ds.liveness().live_count(), 0);

        ds.folder_indexing_done(&folder);
        assert!(!folder.has_handle());
        assert_eq!(handle.releases.load(Ordering::SeqCst), 1);

        ds.acquire_folder(&folder, Some(handle.clone()), FolderActivity::HeaderRetrieval)
            .unwrap();
        assert_eq!(ds.liveness().live_count(), 1);
        ds.shutdown().await.unwrap();
    }
}

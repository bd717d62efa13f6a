//! Folders: the datastore's view of an external mail store folder
//!
//! A folder row maps the store's URI to a datastore id and tracks whether its
//! contents are indexed. The live handle onto the store's folder (which keeps
//! the store's message database open) is held here and released by the
//! folder liveness tracker once the folder goes quiet.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::types::item::{GlodaItem, ItemState};
use crate::types::value::AttributeValue;
use crate::types::{NounId, NOUN_FOLDER};

const DIRTY_STATUS_MASK: i64 = 0x7;
const COMPACTED_FLAG: i64 = 0x8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirtyStatus {
    /// Believed to be fully indexed.
    Clean,
    /// Some messages are unindexed or dirty.
    Dirty,
    /// Must be entirely reindexed regardless of per-message state.
    Filthy,
}

impl DirtyStatus {
    pub fn to_bits(self) -> i64 {
        match self {
            DirtyStatus::Clean => 0,
            DirtyStatus::Dirty => 1,
            DirtyStatus::Filthy => 2,
        }
    }

    pub fn from_bits(bits: i64) -> Self {
        match bits & DIRTY_STATUS_MASK {
            0 => DirtyStatus::Clean,
            1 => DirtyStatus::Dirty,
            _ => DirtyStatus::Filthy,
        }
    }
}

/// Indexing priority of a folder. Higher values are indexed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexingPriority(pub i64);

impl IndexingPriority {
    pub const NEVER: IndexingPriority = IndexingPriority(-1);
    pub const LOWEST: IndexingPriority = IndexingPriority(0);
    pub const DEFAULT: IndexingPriority = IndexingPriority(20);
    pub const CHECK_NEW: IndexingPriority = IndexingPriority(30);
    pub const FAVORITE: IndexingPriority = IndexingPriority(40);
    pub const INBOX: IndexingPriority = IndexingPriority(50);
    pub const SENT: IndexingPriority = IndexingPriority(60);
    pub const HIGHEST: IndexingPriority = IndexingPriority(100);
}

impl Default for IndexingPriority {
    fn default() -> Self {
        IndexingPriority::DEFAULT
    }
}

/// Why a caller wants the live folder handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderActivity {
    /// The folder is about to be indexed. The caller clears
    /// `set_indexing(false)` when done.
    Indexing,
    /// Message headers will be read; the folder is tracked as live.
    HeaderRetrieval,
    /// Metadata only, the store's database is not opened.
    FolderOnlyNoData,
}

/// Live handle onto a folder of the external mail store.
pub trait FolderHandle: Send + Sync + fmt::Debug {
    /// Lets the store close the folder's message database.
    fn release_database(&self);
}

#[derive(Debug, Clone)]
struct FolderData {
    uri: String,
    dirty_bits: i64,
    name: String,
    indexing_priority: IndexingPriority,
}

#[derive(Debug)]
pub struct GlodaFolder {
    id: i64,
    data: RwLock<FolderData>,
    deleted: AtomicBool,
    compacting: AtomicBool,
    indexing: AtomicBool,
    /// Millisecond timestamp of the last header retrieval, 0 when not live.
    last_retrieval_ms: AtomicI64,
    handle: Mutex<Option<Arc<dyn FolderHandle>>>,
    state: ItemState,
}

impl GlodaFolder {
    pub fn new(
        id: i64,
        uri: impl Into<String>,
        dirty_bits: i64,
        name: impl Into<String>,
        indexing_priority: IndexingPriority,
    ) -> Self {
        Self {
            id,
            data: RwLock::new(FolderData {
                uri: uri.into(),
                dirty_bits,
                name: name.into(),
                indexing_priority,
            }),
            deleted: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
            indexing: AtomicBool::new(false),
            last_retrieval_ms: AtomicI64::new(0),
            handle: Mutex::new(None),
            state: ItemState::new(),
        }
    }

    pub fn uri(&self) -> String {
        self.data.read().map(|d| d.uri.clone()).unwrap_or_default()
    }

    pub(crate) fn set_uri(&self, uri: &str) {
        if let Ok(mut data) = self.data.write() {
            data.uri = uri.to_string();
        }
    }

    pub fn name(&self) -> String {
        self.data.read().map(|d| d.name.clone()).unwrap_or_default()
    }

    pub(crate) fn set_name(&self, name: &str) {
        if let Ok(mut data) = self.data.write() {
            data.name = name.to_string();
        }
    }

    pub fn dirty_status(&self) -> DirtyStatus {
        DirtyStatus::from_bits(self.dirty_bits())
    }

    /// Raw persisted status: dirty status plus the compacted flag.
    pub fn dirty_bits(&self) -> i64 {
        self.data.read().map(|d| d.dirty_bits).unwrap_or_default()
    }

    /// Replaces the dirty status, keeping the compacted flag. Returns whether
    /// anything changed.
    pub(crate) fn set_dirty_status(&self, status: DirtyStatus) -> bool {
        match self.data.write() {
            Ok(mut data) => {
                let bits = status.to_bits() | (data.dirty_bits & !DIRTY_STATUS_MASK);
                let changed = bits != data.dirty_bits;
                data.dirty_bits = bits;
                changed
            }
            Err(_) => false,
        }
    }

    pub fn compacted(&self) -> bool {
        self.dirty_bits() & COMPACTED_FLAG != 0
    }

    pub(crate) fn set_compacted(&self, compacted: bool) -> bool {
        match self.data.write() {
            Ok(mut data) => {
                let bits = if compacted {
                    data.dirty_bits | COMPACTED_FLAG
                } else {
                    data.dirty_bits & !COMPACTED_FLAG
                };
                let changed = bits != data.dirty_bits;
                data.dirty_bits = bits;
                changed
            }
            Err(_) => false,
        }
    }

    pub fn compacting(&self) -> bool {
        self.compacting.load(Ordering::SeqCst)
    }

    pub fn set_compacting(&self, compacting: bool) {
        self.compacting.store(compacting, Ordering::SeqCst);
    }

    pub fn indexing_priority(&self) -> IndexingPriority {
        self.data
            .read()
            .map(|d| d.indexing_priority)
            .unwrap_or_default()
    }

    pub(crate) fn set_indexing_priority(&self, priority: IndexingPriority) {
        if let Ok(mut data) = self.data.write() {
            data.indexing_priority = priority;
        }
    }

    /// Tombstoned folders are gone from the lookup maps even if their row is
    /// still being deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn indexing(&self) -> bool {
        self.indexing.load(Ordering::SeqCst)
    }

    /// Clearing the indexing flag immediately tries to release the handle.
    pub fn set_indexing(&self, indexing: bool, now_ms: i64, threshold_ms: i64) {
        self.indexing.store(indexing, Ordering::SeqCst);
        if !indexing {
            self.forget_if_unused(now_ms, threshold_ms);
        }
    }

    pub fn has_handle(&self) -> bool {
        self.handle.lock().map(|h| h.is_some()).unwrap_or(false)
    }

    pub fn handle(&self) -> Option<Arc<dyn FolderHandle>> {
        self.handle.lock().ok().and_then(|h| h.clone())
    }

    pub(crate) fn attach_handle(&self, handle: Arc<dyn FolderHandle>) {
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }

    /// Records an activity on the folder. Returns true when the folder just
    /// became live and must be handed to the liveness tracker.
    pub(crate) fn note_activity(&self, activity: FolderActivity, now_ms: i64) -> bool {
        match activity {
            FolderActivity::Indexing => {
                self.indexing.store(true, Ordering::SeqCst);
                false
            }
            FolderActivity::HeaderRetrieval => {
                let previous = self.last_retrieval_ms.swap(now_ms, Ordering::SeqCst);
                previous == 0
            }
            FolderActivity::FolderOnlyNoData => false,
        }
    }

    /// Releases the live handle unless the folder is being indexed or had a
    /// header retrieval within `threshold_ms`. Returns true once the folder
    /// holds nothing and no longer needs tracking.
    pub fn forget_if_unused(&self, now_ms: i64, threshold_ms: i64) -> bool {
        if self.indexing() {
            return false;
        }
        let acceptably_old = now_ms - threshold_ms;
        if self.last_retrieval_ms.load(Ordering::SeqCst) > acceptably_old {
            return false;
        }

        let released = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = released {
            handle.release_database();
            self.last_retrieval_ms.store(0, Ordering::SeqCst);
        }
        true
    }
}

impl fmt::Display for GlodaFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Folder:{}", self.id)
    }
}

impl GlodaItem for GlodaFolder {
    fn noun_id(&self) -> NounId {
        NOUN_FOLDER
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn unique_value(&self) -> Option<String> {
        Some(self.uri())
    }

    fn column_value(&self, column: &str) -> Option<AttributeValue> {
        match column {
            "id" => Some(AttributeValue::Int(self.id)),
            "folderURI" => Some(AttributeValue::Str(self.uri())),
            "dirtyStatus" => Some(AttributeValue::Int(self.dirty_bits())),
            "name" => Some(AttributeValue::Str(self.name())),
            "indexingPriority" => Some(AttributeValue::Int(self.indexing_priority().0)),
            _ => None,
        }
    }

    fn state(&self) -> &ItemState {
        &self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct CountingHandle {
        releases: AtomicUsize,
    }

    impl FolderHandle for CountingHandle {
        fn release_database(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dirty_status_keeps_compacted_flag() {
        let folder = GlodaFolder::new(1, "mailbox://a/Inbox", 0, "Inbox", IndexingPriority::INBOX);
        assert!(folder.set_compacted(true));
        assert!(folder.set_dirty_status(DirtyStatus::Filthy));
        assert_eq!(folder.dirty_bits(), 0x8 | 2);
        assert_eq!(folder.dirty_status(), DirtyStatus::Filthy);
        assert!(folder.compacted());
        assert!(!folder.set_dirty_status(DirtyStatus::Filthy));
    }

    #[test]
    fn test_priorities_are_ordered() {
        assert!(IndexingPriority::NEVER < IndexingPriority::LOWEST);
        assert!(IndexingPriority::INBOX < IndexingPriority::SENT);
        assert!(IndexingPriority::SENT < IndexingPriority::HIGHEST);
    }

    #[test]
    fn test_forget_if_unused_respects_threshold_and_indexing() {
        let folder = GlodaFolder::new(2, "mailbox://a/Sent", 0, "Sent", IndexingPriority::SENT);
        let handle = Arc::new(CountingHandle::default());
        folder.attach_handle(handle.clone());

        assert!(folder.note_activity(FolderActivity::HeaderRetrieval, 1_000));
        assert!(!folder.note_activity(FolderActivity::HeaderRetrieval, 2_000));
        assert!(!folder.forget_if_unused(5_000, 10_000));

        folder.note_activity(FolderActivity::Indexing, 20_000);
        assert!(!folder.forget_if_unused(20_000, 10_000));

        folder.set_indexing(false, 20_000, 10_000);
        assert_eq!(handle.releases.load(Ordering::SeqCst), 1);
        assert!(!folder.has_handle());
        assert!(folder.forget_if_unused(20_000, 10_000));
    }
}

//! Collection and cache manager
//!
//! The identity map of the datastore: every item handed out is either in its
//! noun's LRU cache or in a live collection, and every later load of the same
//! row is unified with that instance. Collections register weakly; once the
//! caller drops a collection it stops receiving notifications.

pub mod collection;

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use crate::config::{CacheConfig, MIN_NOUN_CACHE_SIZE};
use crate::types::{AttributeValue, ItemRef, NounId};

pub use collection::{Collection, CollectionListener};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
}

struct NounCache {
    by_id: LruCache<i64, ItemRef>,
    by_unique: LruCache<String, ItemRef>,
    hits: u64,
    misses: u64,
}

impl NounCache {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(MIN_NOUN_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            by_id: LruCache::new(capacity),
            by_unique: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    fn insert(&mut self, item: &ItemRef) {
        self.by_id.put(item.id(), item.clone());
        if let Some(unique) = item.unique_value() {
            self.by_unique.put(unique, item.clone());
        }
    }

    fn remove(&mut self, id: i64) {
        if let Some(item) = self.by_id.pop(&id) {
            if let Some(unique) = item.unique_value() {
                self.by_unique.pop(&unique);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CollectionManager {
    config: CacheConfig,
    caches: Mutex<HashMap<NounId, NounCache>>,
    collections: Mutex<Vec<Weak<Collection>>>,
}

impl CollectionManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            caches: Mutex::new(HashMap::new()),
            collections: Mutex::new(Vec::new()),
        }
    }

    fn with_cache<R>(&self, noun: NounId, f: impl FnOnce(&mut NounCache) -> R) -> R {
        let mut caches = lock(&self.caches);
        let cache = caches
            .entry(noun)
            .or_insert_with(|| NounCache::new(self.config.size_for(noun)));
        f(cache)
    }

    pub fn register_collection(&self, collection: &Arc<Collection>) {
        let mut collections = lock(&self.collections);
        collections.retain(|c| c.strong_count() > 0);
        collections.push(Arc::downgrade(collection));
    }

    /// Collections of `noun` that are still alive.
    pub fn live_collections(&self, noun: NounId) -> Vec<Arc<Collection>> {
        let mut collections = lock(&self.collections);
        collections.retain(|c| c.strong_count() > 0);
        collections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.noun() == noun)
            .collect()
    }

    fn find_in_collections(&self, noun: NounId, id: i64) -> Option<ItemRef> {
        self.live_collections(noun)
            .iter()
            .find_map(|collection| collection.get(id))
    }

    /// Looks an item up in the cache, then in live collections. `promote`
    /// refreshes its LRU position.
    pub fn cache_lookup_one(&self, noun: NounId, id: i64, promote: bool) -> Option<ItemRef> {
        let cached = self.with_cache(noun, |cache| {
            let found = if promote {
                cache.by_id.get(&id).cloned()
            } else {
                cache.by_id.peek(&id).cloned()
            };
            if found.is_some() {
                cache.hits += 1;
            }
            found
        });
        if cached.is_some() {
            return cached;
        }

        let found = self.find_in_collections(noun, id);
        self.with_cache(noun, |cache| match &found {
            Some(item) => {
                cache.hits += 1;
                cache.insert(item);
            }
            None => cache.misses += 1,
        });
        found
    }

    /// Splits `ids` into the items already known and the ids that still
    /// need loading.
    pub fn cache_lookup_many(&self, noun: NounId, ids: &[i64]) -> (HashMap<i64, ItemRef>, Vec<i64>) {
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for &id in ids {
            if found.contains_key(&id) || missing.contains(&id) {
                continue;
            }
            match self.cache_lookup_one(noun, id, true) {
                Some(item) => {
                    found.insert(id, item);
                }
                None => missing.push(id),
            }
        }
        (found, missing)
    }

    pub fn cache_lookup_one_by_unique_value(&self, noun: NounId, value: &str) -> Option<ItemRef> {
        let cached = self.with_cache(noun, |cache| {
            let found = cache.by_unique.get(value).cloned();
            match found {
                Some(_) => cache.hits += 1,
                None => cache.misses += 1,
            }
            found
        });
        if cached.is_some() {
            return cached;
        }
        self.live_collections(noun).iter().find_map(|collection| {
            collection
                .items()
                .into_iter()
                .find(|item| item.unique_value().as_deref() == Some(value))
        })
    }

    /// Replaces freshly loaded items with instances already known, and
    /// caches the rest. The returned list preserves input order.
    pub fn cache_load_unify(&self, noun: NounId, items: Vec<ItemRef>) -> Vec<ItemRef> {
        items
            .into_iter()
            .map(|item| self.unify_one(noun, item))
            .collect()
    }

    /// Records a single item loaded outside a query.
    pub fn item_loaded(&self, item: ItemRef) -> ItemRef {
        self.unify_one(item.noun_id(), item)
    }

    fn unify_one(&self, noun: NounId, item: ItemRef) -> ItemRef {
        match self.cache_lookup_one(noun, item.id(), true) {
            Some(known) => {
                if !Arc::ptr_eq(&known, &item) {
                    debug!("Unified duplicate load of {} {}", noun, item.id());
                }
                known
            }
            None => {
                self.with_cache(noun, |cache| cache.insert(&item));
                item
            }
        }
    }

    /// New items: cached, and added to every live collection whose query
    /// matches them.
    pub fn items_added(&self, noun: NounId, items: &[ItemRef]) {
        self.with_cache(noun, |cache| {
            for item in items {
                cache.insert(item);
            }
        });

        for collection in self.live_collections(noun) {
            if collection.query().is_frozen() {
                continue;
            }
            let matching: Vec<ItemRef> = items
                .iter()
                .filter(|item| collection.query().test(item))
                .cloned()
                .collect();
            let added = collection.add_items(&matching);
            collection.notify_added(&added);
        }
    }

    /// Changed items: collections gain, keep or lose them depending on
    /// whether their query still matches.
    pub fn items_modified(&self, noun: NounId, items: &[ItemRef]) {
        for collection in self.live_collections(noun) {
            let frozen = collection.query().is_frozen();
            let mut modified = Vec::new();
            let mut removed_ids = Vec::new();
            let mut newly_matching = Vec::new();
            for item in items {
                let present = collection.contains(item.id());
                let matches = collection.query().test(item);
                match (present, matches || frozen) {
                    (true, true) => modified.push(item.clone()),
                    (true, false) => removed_ids.push(item.id()),
                    (false, true) if !frozen => newly_matching.push(item.clone()),
                    _ => {}
                }
            }
            collection.notify_modified(&modified);
            let removed = collection.remove_ids(&removed_ids);
            collection.notify_removed(&removed);
            let added = collection.add_items(&newly_matching);
            collection.notify_added(&added);
        }
    }

    /// Deleted rows: evicted from the cache and every collection.
    pub fn items_deleted(&self, noun: NounId, ids: &[i64]) {
        self.with_cache(noun, |cache| {
            for &id in ids {
                cache.remove(id);
            }
        });
        for collection in self.live_collections(noun) {
            let removed = collection.remove_ids(ids);
            collection.notify_removed(&removed);
        }
    }

    /// Deletes by column value, for bulk deletions where the ids are not
    /// known (all messages of a folder).
    pub fn items_deleted_by_attribute(&self, noun: NounId, column: &str, value: &AttributeValue) {
        let matches = |item: &ItemRef| {
            item.column_value(column)
                .map(|v| v.matches(value))
                .unwrap_or(false)
        };

        let mut ids: Vec<i64> = self.with_cache(noun, |cache| {
            cache
                .by_id
                .iter()
                .filter(|(_, item)| matches(item))
                .map(|(id, _)| *id)
                .collect()
        });
        for collection in self.live_collections(noun) {
            ids.extend(
                collection
                    .items()
                    .iter()
                    .filter(|item| matches(item))
                    .map(|item| item.id()),
            );
        }
        ids.sort_unstable();
        ids.dedup();
        if !ids.is_empty() {
            self.items_deleted(noun, &ids);
        }
    }

    pub fn stats(&self, noun: NounId) -> CacheStats {
        self.with_cache(noun, |cache| CacheStats {
            hits: cache.hits,
            misses: cache.misses,
            len: cache.by_id.len(),
        })
    }

    /// Drops every cached item and collection registration.
    pub fn clear(&self) {
        lock(&self.caches).clear();
        lock(&self.collections).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Constraint, Query};
    use crate::types::{GlodaMessage, MessageData, NOUN_MESSAGE};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(id: i64, folder: Option<i64>) -> ItemRef {
        Arc::new(GlodaMessage::new(
            id,
            MessageData {
                folder_id: folder,
                message_key: folder.map(|_| id),
                conversation_id: 1,
                ..Default::default()
            },
        ))
    }

    #[derive(Default)]
    struct Counter {
        added: AtomicUsize,
        removed: AtomicUsize,
        modified: AtomicUsize,
    }

    impl CollectionListener for Counter {
        fn on_items_added(&self, items: &[ItemRef], _: &Collection) {
            self.added.fetch_add(items.len(), Ordering::SeqCst);
        }
        fn on_items_modified(&self, items: &[ItemRef], _: &Collection) {
            self.modified.fetch_add(items.len(), Ordering::SeqCst);
        }
        fn on_items_removed(&self, items: &[ItemRef], _: &Collection) {
            self.removed.fetch_add(items.len(), Ordering::SeqCst);
        }
    }

    #[test]
    fn test_load_unify_keeps_first_instance() {
        let manager = CollectionManager::new(CacheConfig::default());
        let first = manager.cache_load_unify(NOUN_MESSAGE, vec![message(40, Some(1))]);
        let second = manager.cache_load_unify(NOUN_MESSAGE, vec![message(40, Some(1))]);
        assert!(Arc::ptr_eq(&first[0], &second[0]));

        let (found, missing) = manager.cache_lookup_many(NOUN_MESSAGE, &[40, 41, 41]);
        assert!(found.contains_key(&40));
        assert_eq!(missing, vec![41]);
    }

    #[test]
    fn test_live_collections_follow_changes() {
        let manager = CollectionManager::new(CacheConfig::default());
        let counter = Arc::new(Counter::default());
        let collection = Arc::new(Collection::new(
            Query::new(NOUN_MESSAGE).constrain(Constraint::IdIn(vec![40, 41])),
            Some(counter.clone()),
        ));
        manager.register_collection(&collection);

        manager.items_added(NOUN_MESSAGE, &[message(40, Some(1)), message(50, Some(1))]);
        assert_eq!(collection.len(), 1);
        assert_eq!(counter.added.load(Ordering::SeqCst), 1);

        let item = collection.get(40).unwrap();
        manager.items_modified(NOUN_MESSAGE, &[item]);
        assert_eq!(counter.modified.load(Ordering::SeqCst), 1);

        manager.items_deleted_by_attribute(NOUN_MESSAGE, "folderID", &AttributeValue::Int(1));
        assert!(collection.is_empty());
        assert_eq!(counter.removed.load(Ordering::SeqCst), 1);
        assert!(manager.cache_lookup_one(NOUN_MESSAGE, 50, false).is_none());
    }

    #[test]
    fn test_dropped_collections_are_forgotten() {
        let manager = CollectionManager::new(CacheConfig::default());
        let collection = Arc::new(Collection::new(Query::new(NOUN_MESSAGE), None));
        manager.register_collection(&collection);
        assert_eq!(manager.live_collections(NOUN_MESSAGE).len(), 1);
        drop(collection);
        assert!(manager.live_collections(NOUN_MESSAGE).is_empty());
    }
}

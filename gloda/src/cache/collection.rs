use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::query::Query;
use crate::types::{ItemRef, NounId};

/// Receives changes to a collection's result set.
///
/// Callbacks are never invoked while the collection manager holds a lock, so
/// a listener may query the datastore again.
pub trait CollectionListener: Send + Sync {
    fn on_items_added(&self, _items: &[ItemRef], _collection: &Collection) {}

    fn on_items_modified(&self, _items: &[ItemRef], _collection: &Collection) {}

    fn on_items_removed(&self, _items: &[ItemRef], _collection: &Collection) {}

    fn on_query_completed(&self, _collection: &Collection) {}
}

/// A live result set bound to the query that produced it.
pub struct Collection {
    id: Uuid,
    query: Query,
    items: RwLock<Vec<ItemRef>>,
    id_map: RwLock<HashMap<i64, ItemRef>>,
    listener: Option<Arc<dyn CollectionListener>>,
    completed: AtomicBool,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.id)
            .field("noun", &self.query.noun)
            .field("len", &self.len())
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Collection {
    pub fn new(query: Query, listener: Option<Arc<dyn CollectionListener>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query,
            items: RwLock::new(Vec::new()),
            id_map: RwLock::new(HashMap::new()),
            listener,
            completed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn noun(&self) -> NounId {
        self.query.noun
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn items(&self) -> Vec<ItemRef> {
        self.items.read().map(|items| items.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: i64) -> Option<ItemRef> {
        self.id_map.read().ok()?.get(&id).cloned()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.id_map
            .read()
            .map(|map| map.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// Appends the items not already present; returns the ones added.
    pub(crate) fn add_items(&self, items: &[ItemRef]) -> Vec<ItemRef> {
        let (mut list, mut map) = match (self.items.write(), self.id_map.write()) {
            (Ok(list), Ok(map)) => (list, map),
            _ => return Vec::new(),
        };
        let mut added = Vec::new();
        for item in items {
            if map.contains_key(&item.id()) {
                continue;
            }
            map.insert(item.id(), item.clone());
            list.push(item.clone());
            added.push(item.clone());
        }
        added
    }

    /// Removes items by id; returns the ones that were present.
    pub(crate) fn remove_ids(&self, ids: &[i64]) -> Vec<ItemRef> {
        let (mut list, mut map) = match (self.items.write(), self.id_map.write()) {
            (Ok(list), Ok(map)) => (list, map),
            _ => return Vec::new(),
        };
        let removed: Vec<ItemRef> = ids.iter().filter_map(|id| map.remove(id)).collect();
        if !removed.is_empty() {
            list.retain(|item| map.contains_key(&item.id()));
        }
        removed
    }

    pub(crate) fn notify_added(&self, items: &[ItemRef]) {
        if let (Some(listener), false) = (&self.listener, items.is_empty()) {
            listener.on_items_added(items, self);
        }
    }

    pub(crate) fn notify_modified(&self, items: &[ItemRef]) {
        if let (Some(listener), false) = (&self.listener, items.is_empty()) {
            listener.on_items_modified(items, self);
        }
    }

    pub(crate) fn notify_removed(&self, items: &[ItemRef]) {
        if let (Some(listener), false) = (&self.listener, items.is_empty()) {
            listener.on_items_removed(items, self);
        }
    }

    pub(crate) fn notify_completed(&self) {
        self.mark_completed();
        if let Some(listener) = &self.listener {
            listener.on_query_completed(self);
        }
    }
}

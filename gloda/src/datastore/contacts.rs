//! Contacts

use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::Datastore;
use crate::adapters::sqlite::{prepare, Pending};
use crate::types::{downcast_item, ContactData, GlodaContact, ItemRef, Result, NOUN_CONTACT};

impl Datastore {
    /// Allocates an id and builds the contact. Nothing is written until
    /// `insert_contact`.
    pub fn create_contact(&self, data: ContactData) -> Result<Arc<GlodaContact>> {
        self.check_open()?;
        Ok(Arc::new(GlodaContact::new(self.ids.contact.allocate(), data)))
    }

    pub fn insert_contact(&self, contact: &Arc<GlodaContact>) -> Result<Pending<()>> {
        self.check_open()?;
        let item: ItemRef = contact.clone();
        let noun = self.noun(NOUN_CONTACT)?;
        let row = item.clone();
        let pending = self.executor.execute_async(move |conn| noun.insert(conn, &row));
        self.cache.items_added(NOUN_CONTACT, &[item]);
        Ok(pending)
    }

    pub fn update_contact(&self, contact: &Arc<GlodaContact>) -> Result<Pending<()>> {
        self.check_open()?;
        let item: ItemRef = contact.clone();
        let noun = self.noun(NOUN_CONTACT)?;
        let row = item.clone();
        let pending = self.executor.execute_async(move |conn| noun.update(conn, &row));
        self.cache.items_modified(NOUN_CONTACT, &[item]);
        Ok(pending)
    }

    /// Cached contact, or a synchronous load of its row. References are
    /// not resolved.
    pub fn get_contact_by_id(&self, id: i64) -> Result<Option<Arc<GlodaContact>>> {
        self.check_open()?;
        let item = match self.cache.cache_lookup_one(NOUN_CONTACT, id, true) {
            Some(item) => Some(item),
            None => {
                let noun = self.noun(NOUN_CONTACT)?;
                self.executor
                    .execute_sync(|conn| {
                        Ok(prepare(conn, "SELECT * FROM contacts WHERE id = ?1")?
                            .query_row(params![id], |row| noun.row_to_object(row))
                            .optional()?)
                    })?
                    .map(|item| self.cache.item_loaded(item))
            }
        };
        Ok(item.and_then(|item| downcast_item::<GlodaContact>(&item)))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DatastoreConfig;
    use crate::datastore::Datastore;
    use crate::types::{ContactData, GlodaItem, NOUN_CONTACT};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_contact_prefers_cache() {
        let ds = Datastore::open_in_memory(DatastoreConfig::default()).unwrap();
        let contact = ds
            .create_contact(ContactData {
                name: "Ada".to_string(),
                popularity: 3,
                ..Default::default()
            })
            .unwrap();
        ds.insert_contact(&contact).unwrap().await.unwrap();

        let cached = ds.get_contact_by_id(contact.id()).unwrap().unwrap();
        assert!(Arc::ptr_eq(&cached, &contact));
        assert!(ds.get_contact_by_id(999).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_persists_and_reloads() {
        let ds = Datastore::open_in_memory(DatastoreConfig::default()).unwrap();
        let contact = ds.create_contact(ContactData::default()).unwrap();
        ds.insert_contact(&contact).unwrap().await.unwrap();
        contact.update(|data| {
            data.name = "Grace".to_string();
            data.frecency = 40;
        });
        ds.update_contact(&contact).unwrap().await.unwrap();

        ds.collection_manager().clear();
        let loaded = ds.get_contact_by_id(contact.id()).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&loaded, &contact));
        assert_eq!(loaded.name(), "Grace");
        assert_eq!(loaded.data().frecency, 40);
        assert_eq!(ds.collection_manager().stats(NOUN_CONTACT).len, 1);
    }
}

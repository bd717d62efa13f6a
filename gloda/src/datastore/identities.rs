//! Identities

use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::Datastore;
use crate::adapters::sqlite::prepare;
use crate::types::{downcast_item, GlodaIdentity, ItemRef, Result, NOUN_IDENTITY};

impl Datastore {
    /// Allocates, writes and announces an identity of `contact_id`.
    pub fn create_identity(
        &self,
        contact_id: i64,
        kind: &str,
        value: &str,
        description: Option<&str>,
        relay: bool,
    ) -> Result<Arc<GlodaIdentity>> {
        self.check_open()?;
        let identity = Arc::new(GlodaIdentity::new(
            self.ids.identity.allocate(),
            contact_id,
            kind,
            value,
            description.map(str::to_string),
            relay,
        ));
        let item: ItemRef = identity.clone();
        let noun = self.noun(NOUN_IDENTITY)?;
        let row = item.clone();
        drop(self.executor.execute_async(move |conn| noun.insert(conn, &row)));
        self.cache.items_added(NOUN_IDENTITY, &[item]);
        Ok(identity)
    }

    /// Identity by `(kind, value)`: cached first, else loaded synchronously.
    pub fn get_identity(&self, kind: &str, value: &str) -> Result<Option<Arc<GlodaIdentity>>> {
        self.check_open()?;
        let key = GlodaIdentity::lookup_key(kind, value);
        let item = match self.cache.cache_lookup_one_by_unique_value(NOUN_IDENTITY, &key) {
            Some(item) => Some(item),
            None => {
                let noun = self.noun(NOUN_IDENTITY)?;
                self.executor
                    .execute_sync(|conn| {
                        Ok(
                            prepare(conn, "SELECT * FROM identities WHERE kind = ?1 AND value = ?2")?
                                .query_row(params![kind, value], |row| noun.row_to_object(row))
                                .optional()?,
                        )
                    })?
                    .map(|item| self.cache.item_loaded(item))
            }
        };
        Ok(item.and_then(|item| downcast_item::<GlodaIdentity>(&item)))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DatastoreConfig;
    use crate::datastore::Datastore;
    use crate::types::GlodaItem;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_identity_by_kind_and_value() {
        let ds = Datastore::open_in_memory(DatastoreConfig::default()).unwrap();
        let identity = ds
            .create_identity(7, "email", "ada@example.com", None, false)
            .unwrap();
        let found = ds.get_identity("email", "ada@example.com").unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &identity));
        ds.drain().await;

        ds.collection_manager().clear();
        let loaded = ds.get_identity("email", "ada@example.com").unwrap().unwrap();
        assert_eq!(loaded.id(), identity.id());
        assert_eq!(loaded.contact_id, 7);
        assert_eq!(loaded.description, None);
        assert!(ds.get_identity("email", "nobody@example.com").unwrap().is_none());
        assert!(ds.get_identity("irc", "ada@example.com").unwrap().is_none());
    }
}

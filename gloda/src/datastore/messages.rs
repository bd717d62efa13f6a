//! Messages
//!
//! Besides plain create/insert/update this covers the bulk operations the
//! indexer runs when the mail store moves, compacts or deletes messages.
//! Every bulk operation updates the cached instances in place so live
//! collections stay consistent with the rows.

use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::Datastore;
use crate::adapters::sqlite::{prepare, Pending};
use crate::query::{Constraint, Query, QueryOptions};
use crate::types::value::quote_sql_string;
use crate::types::{
    downcast_item, AttributeValue, GlodaError, GlodaMessage, ItemRef, MessageData,
    Result, NOUN_MESSAGE,
};

/// One row of a compaction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionRow {
    pub id: i64,
    pub message_key: Option<i64>,
    pub header_message_id: Option<String>,
}

fn id_list(ids: &[i64]) -> String {
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ")
}

impl Datastore {
    fn cached_message(&self, id: i64) -> Option<Arc<GlodaMessage>> {
        self.cache
            .cache_lookup_one(NOUN_MESSAGE, id, false)
            .and_then(|item| downcast_item::<GlodaMessage>(&item))
    }

    /// Allocates an id and builds the message. Nothing is written until
    /// `insert_message`.
    pub fn create_message(&self, data: MessageData) -> Result<Arc<GlodaMessage>> {
        self.check_open()?;
        Ok(Arc::new(GlodaMessage::new(self.ids.message.allocate(), data)))
    }

    /// Writes a new message. Ghosts get no full-text row.
    pub fn insert_message(&self, message: &Arc<GlodaMessage>) -> Result<Pending<()>> {
        self.check_open()?;
        let item: ItemRef = message.clone();
        let noun = self.noun(NOUN_MESSAGE)?;
        let row = item.clone();
        let pending = self.executor.execute_async(move |conn| noun.insert(conn, &row));
        self.cache.items_added(NOUN_MESSAGE, &[item]);
        Ok(pending)
    }

    /// Rewrites a message. A ghost that gained a location gets its
    /// full-text row now.
    pub fn update_message(&self, message: &Arc<GlodaMessage>) -> Result<Pending<()>> {
        self.check_open()?;
        let item: ItemRef = message.clone();
        let noun = self.noun(NOUN_MESSAGE)?;
        let row = item.clone();
        let pending = self.executor.execute_async(move |conn| noun.update(conn, &row));
        self.cache.items_modified(NOUN_MESSAGE, &[item]);
        Ok(pending)
    }

    /// Moves messages to `dest_folder_id` under new keys.
    pub fn update_message_locations(
        &self,
        ids: &[i64],
        keys: &[i64],
        dest_folder_id: i64,
        no_notify: bool,
    ) -> Result<Pending<()>> {
        self.check_open()?;
        if ids.len() != keys.len() {
            return Err(GlodaError::InvalidInput(format!(
                "{} message ids but {} keys",
                ids.len(),
                keys.len()
            )));
        }

        let moves: Vec<(i64, i64)> = ids.iter().copied().zip(keys.iter().copied()).collect();
        let rows = moves.clone();
        let pending = self.executor.execute_async(move |conn| {
            for (id, key) in &rows {
                prepare(conn, "UPDATE messages SET folderID = ?1, messageKey = ?2 WHERE id = ?3")?
                    .execute(params![dest_folder_id, key, id])?;
            }
            Ok(())
        });

        let mut modified: Vec<ItemRef> = Vec::new();
        for (id, key) in moves {
            if let Some(message) = self.cached_message(id) {
                message.set_location(Some(dest_folder_id), Some(key));
                modified.push(message);
            }
        }
        if !no_notify && !modified.is_empty() {
            self.cache.items_modified(NOUN_MESSAGE, &modified);
        }
        Ok(pending)
    }

    /// Rewrites message keys in place, without notifying collections.
    pub fn update_message_keys(&self, ids: &[i64], keys: &[i64]) -> Result<Pending<()>> {
        self.check_open()?;
        if ids.len() != keys.len() {
            return Err(GlodaError::InvalidInput(format!(
                "{} message ids but {} keys",
                ids.len(),
                keys.len()
            )));
        }

        let updates: Vec<(i64, i64)> = ids.iter().copied().zip(keys.iter().copied()).collect();
        for (id, key) in &updates {
            if let Some(message) = self.cached_message(*id) {
                message.update(|data| data.message_key = Some(*key));
            }
        }
        Ok(self.executor.execute_async(move |conn| {
            for (id, key) in &updates {
                prepare(conn, "UPDATE messages SET messageKey = ?1 WHERE id = ?2")?
                    .execute(params![key, id])?;
            }
            Ok(())
        }))
    }

    /// Moves messages to `dest_folder_id` whose keys are not known yet. The
    /// indexer fills the keys in later.
    pub fn update_message_folders_by_key_purging(
        &self,
        ids: &[i64],
        dest_folder_id: i64,
    ) -> Result<Pending<()>> {
        self.check_open()?;
        if ids.is_empty() {
            return Ok(Pending::ready(Ok(())));
        }
        for &id in ids {
            if let Some(message) = self.cached_message(id) {
                message.set_location(Some(dest_folder_id), None);
            }
        }
        let sql = format!(
            "UPDATE messages SET folderID = ?1, messageKey = NULL WHERE id IN ({})",
            id_list(ids)
        );
        Ok(self.executor.execute_async(move |conn| {
            conn.execute(&sql, params![dest_folder_id])?;
            Ok(())
        }))
    }

    /// Marks every message of a folder deleted, for folder deletion.
    pub fn mark_messages_deleted_by_folder_id(&self, folder_id: i64) -> Result<Pending<()>> {
        self.check_open()?;
        info!("Marking messages of folder {} deleted", folder_id);
        let pending = self.executor.execute_async(move |conn| {
            prepare(
                conn,
                "UPDATE messages SET folderID = NULL, messageKey = NULL, deleted = 1 \
                 WHERE folderID = ?1",
            )?
            .execute(params![folder_id])?;
            Ok(())
        });
        self.cache
            .items_deleted_by_attribute(NOUN_MESSAGE, "folderID", &AttributeValue::Int(folder_id));
        Ok(pending)
    }

    pub fn mark_messages_deleted_by_ids(&self, ids: &[i64]) -> Result<Pending<()>> {
        self.check_open()?;
        if ids.is_empty() {
            return Ok(Pending::ready(Ok(())));
        }
        for &id in ids {
            if let Some(message) = self.cached_message(id) {
                message.update(|data| {
                    data.folder_id = None;
                    data.message_key = None;
                    data.deleted = true;
                });
            }
        }
        let sql = format!(
            "UPDATE messages SET folderID = NULL, messageKey = NULL, deleted = 1 WHERE id IN ({})",
            id_list(ids)
        );
        let pending = self.executor.execute_async(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        });
        self.cache.items_deleted(NOUN_MESSAGE, ids);
        Ok(pending)
    }

    /// Messages marked deleted whose rows are still waiting for cleanup.
    pub fn count_deleted_messages(&self) -> Result<Pending<i64>> {
        self.check_open()?;
        Ok(self.executor.execute_async(|conn| {
            Ok(prepare(conn, "SELECT COUNT(*) FROM messages WHERE deleted = 1")?
                .query_row([], |row| row.get(0))?)
        }))
    }

    /// Removes a message row and its full-text row for good.
    pub fn delete_message_by_id(&self, id: i64) -> Result<Pending<()>> {
        self.check_open()?;
        debug!("Deleting message {}", id);
        let pending = self.executor.execute_async(move |conn| {
            prepare(conn, "DELETE FROM messages WHERE id = ?1")?.execute(params![id])?;
            prepare(conn, "DELETE FROM messagesText WHERE docid = ?1")?.execute(params![id])?;
            Ok(())
        });
        self.cache.items_deleted(NOUN_MESSAGE, &[id]);
        Ok(pending)
    }

    /// Removes every message row of a folder with its full-text and
    /// attribute rows.
    pub fn delete_messages_in_folder(&self, folder_id: i64) -> Result<Pending<()>> {
        self.check_open()?;
        info!("Deleting messages of folder {}", folder_id);
        let pending = self.executor.execute_async(move |conn| {
            prepare(
                conn,
                "DELETE FROM messagesText WHERE docid IN \
                 (SELECT id FROM messages WHERE folderID = ?1)",
            )?
            .execute(params![folder_id])?;
            prepare(
                conn,
                "DELETE FROM messageAttributes WHERE messageID IN \
                 (SELECT id FROM messages WHERE folderID = ?1)",
            )?
            .execute(params![folder_id])?;
            prepare(conn, "DELETE FROM messages WHERE folderID = ?1")?.execute(params![folder_id])?;
            Ok(())
        });
        self.cache
            .items_deleted_by_attribute(NOUN_MESSAGE, "folderID", &AttributeValue::Int(folder_id));
        Ok(pending)
    }

    /// Next block of live messages in a folder, by ascending key from
    /// `start_key`.
    pub fn folder_compaction_pass_block_fetch(
        &self,
        folder_id: i64,
        start_key: i64,
        limit: u32,
    ) -> Result<Pending<Vec<CompactionRow>>> {
        self.check_open()?;
        Ok(self.executor.execute_async(move |conn| {
            let mut stmt = prepare(
                conn,
                "SELECT id, messageKey, headerMessageID FROM messages \
                 WHERE folderID = ?1 AND messageKey >= ?2 AND +deleted = 0 \
                 ORDER BY messageKey LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![folder_id, start_key, limit], |row| {
                    Ok(CompactionRow {
                        id: row.get(0)?,
                        message_key: row.get(1)?,
                        header_message_id: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        }))
    }

    /// Looks a message up by location on the caller's thread. Only for code
    /// that cannot wait.
    pub fn get_message_from_location_sync(
        &self,
        folder_id: i64,
        message_key: i64,
    ) -> Result<Option<Arc<GlodaMessage>>> {
        self.check_open()?;
        let noun = self.noun(NOUN_MESSAGE)?;
        let loaded = self.executor.execute_sync(|conn| {
            Ok(
                prepare(conn, "SELECT * FROM messages WHERE folderID = ?1 AND messageKey = ?2")?
                    .query_row(params![folder_id, message_key], |row| noun.row_to_object(row))
                    .optional()?,
            )
        })?;
        Ok(loaded
            .map(|item| self.cache.item_loaded(item))
            .and_then(|item| downcast_item::<GlodaMessage>(&item)))
    }

    /// Ids of every message row per header message id, ghosts and deleted
    /// rows included. Used for threading.
    pub fn get_message_ids_by_header_ids(
        &self,
        header_ids: &[String],
    ) -> Result<Pending<HashMap<String, Vec<i64>>>> {
        self.check_open()?;
        if header_ids.is_empty() {
            return Ok(Pending::ready(Ok(HashMap::new())));
        }
        let quoted: Vec<String> = header_ids.iter().map(|h| quote_sql_string(h)).collect();
        let sql = format!(
            "SELECT id, headerMessageID FROM messages WHERE headerMessageID IN ({})",
            quoted.join(", ")
        );
        Ok(self.executor.execute_async(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut found: HashMap<String, Vec<i64>> = HashMap::new();
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (id, header) = row?;
                found.entry(header).or_default().push(id);
            }
            Ok(found)
        }))
    }

    /// Messages per requested header message id, in request order. Ghosts
    /// are included.
    pub async fn get_messages_by_message_id(
        &self,
        header_ids: &[String],
    ) -> Result<Vec<Vec<Arc<GlodaMessage>>>> {
        self.check_open()?;
        if header_ids.is_empty() {
            return Ok(Vec::new());
        }
        let attribute = self.attribute(NOUN_MESSAGE, "headerMessageID")?;
        let query = Query::new(NOUN_MESSAGE)
            .constrain(Constraint::In {
                attribute,
                values: header_ids.iter().map(|h| AttributeValue::from(h.as_str())).collect(),
            })
            .with_options(QueryOptions {
                no_validity_constraints: true,
                ..Default::default()
            });
        let items = self.load(query).await?;

        let mut by_header: HashMap<String, Vec<Arc<GlodaMessage>>> = HashMap::new();
        for item in &items {
            if let Some(message) = downcast_item::<GlodaMessage>(item) {
                if let Some(header) = message.header_message_id() {
                    by_header.entry(header).or_default().push(message);
                }
            }
        }
        Ok(header_ids
            .iter()
            .map(|h| by_header.get(h).cloned().unwrap_or_default())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatastoreConfig;
    use crate::types::GlodaItem;

    fn located(folder: i64, key: i64, header: &str) -> MessageData {
        MessageData {
            folder_id: Some(folder),
            message_key: Some(key),
            conversation_id: 1,
            header_message_id: Some(header.to_string()),
            ..Default::default()
        }
    }

    async fn seeded() -> (Arc<Datastore>, Vec<Arc<GlodaMessage>>) {
        let ds = Datastore::open_in_memory(DatastoreConfig::default()).unwrap();
        let mut messages = Vec::new();
        for (key, header) in [(10, "a@x"), (11, "b@x"), (12, "c@x")] {
            let message = ds.create_message(located(1, key, header)).unwrap();
            drop(ds.insert_message(&message).unwrap());
            messages.push(message);
        }
        ds.drain().await;
        (ds, messages)
    }

    #[tokio::test]
    async fn test_message_ids_start_at_32() {
        let (_ds, messages) = seeded().await;
        assert_eq!(messages[0].id(), 32);
        assert_eq!(messages[2].id(), 34);
    }

    #[tokio::test]
    async fn test_location_moves_update_rows_and_cached_instances() {
        let (ds, messages) = seeded().await;
        let ids: Vec<i64> = messages.iter().map(|m| m.id()).collect();
        ds.update_message_locations(&ids[..2], &[100, 101], 2, false)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(messages[0].folder_id(), Some(2));
        assert_eq!(messages[1].message_key(), Some(101));

        let found = ds.get_message_from_location_sync(2, 101).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &messages[1]));
        assert!(ds.get_message_from_location_sync(1, 10).unwrap().is_none());

        assert!(ds.update_message_keys(&ids, &[1]).is_err());
        ds.update_message_folders_by_key_purging(&ids[2..], 3)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(messages[2].folder_id(), Some(3));
        assert_eq!(messages[2].message_key(), None);
    }

    #[tokio::test]
    async fn test_compaction_block_fetch_skips_deleted() {
        let (ds, messages) = seeded().await;
        ds.mark_messages_deleted_by_ids(&[messages[1].id()])
            .unwrap()
            .await
            .unwrap();
        assert!(messages[1].is_deleted());

        let block = ds.folder_compaction_pass_block_fetch(1, 0, 10).unwrap().await.unwrap();
        let keys: Vec<Option<i64>> = block.iter().map(|r| r.message_key).collect();
        assert_eq!(keys, vec![Some(10), Some(12)]);
        assert_eq!(block[1].header_message_id.as_deref(), Some("c@x"));

        let block = ds.folder_compaction_pass_block_fetch(1, 11, 1).unwrap().await.unwrap();
        assert_eq!(block.len(), 1);
        assert_eq!(block[0].id, messages[2].id());
        assert_eq!(ds.count_deleted_messages().unwrap().await.unwrap(), 1);
    }

    fn counts(ds: &Datastore) -> (i64, i64) {
        ds.executor()
            .execute_sync(|conn| {
                Ok(conn.query_row(
                    "SELECT (SELECT COUNT(*) FROM messages), (SELECT COUNT(*) FROM messagesText)",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_folder_deletion_marks_every_message() {
        let (ds, messages) = seeded().await;
        let collection = ds.query(Query::new(NOUN_MESSAGE), None).await.unwrap();
        assert_eq!(collection.len(), 3);

        ds.mark_messages_deleted_by_folder_id(1).unwrap().await.unwrap();
        assert_eq!(ds.count_deleted_messages().unwrap().await.unwrap(), 3);
        assert!(collection.is_empty());
        assert!(ds.cached_message(messages[0].id()).is_none());
    }

    #[tokio::test]
    async fn test_delete_messages_in_folder_drops_rows() {
        let (ds, _messages) = seeded().await;
        ds.delete_messages_in_folder(2).unwrap().await.unwrap();
        assert_eq!(counts(&ds), (3, 3));
        ds.delete_messages_in_folder(1).unwrap().await.unwrap();
        assert_eq!(counts(&ds), (0, 0));
    }

    #[tokio::test]
    async fn test_header_id_lookups_include_ghosts() {
        let (ds, messages) = seeded().await;
        let ghost = ds
            .create_message(MessageData {
                conversation_id: 1,
                header_message_id: Some("a@x".to_string()),
                ..Default::default()
            })
            .unwrap();
        ds.insert_message(&ghost).unwrap().await.unwrap();

        let ids = ds
            .get_message_ids_by_header_ids(&["a@x".to_string(), "zzz".to_string()])
            .unwrap()
            .await
            .unwrap();
        let mut a = ids.get("a@x").cloned().unwrap_or_default();
        a.sort_unstable();
        assert_eq!(a, vec![messages[0].id(), ghost.id()]);
        assert!(!ids.contains_key("zzz"));

        let found = ds
            .get_messages_by_message_id(&["b@x".to_string(), "a@x".to_string(), "none".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert!(Arc::ptr_eq(&found[0][0], &messages[1]));
        assert_eq!(found[1].len(), 2);
        assert!(found[2].is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_id_removes_text_row() {
        let (ds, messages) = seeded().await;
        ds.delete_message_by_id(messages[0].id()).unwrap().await.unwrap();
        assert_eq!(counts(&ds), (2, 2));
    }
}

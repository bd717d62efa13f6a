//! Conversations

use rusqlite::params;
use std::sync::Arc;
use tracing::debug;

use super::Datastore;
use crate::adapters::sqlite::{prepare, Pending};
use crate::types::{
    AttributeValue, ConversationData, GlodaConversation, ItemRef, Result, NOUN_CONVERSATION,
    NOUN_MESSAGE,
};

impl Datastore {
    /// Allocates a conversation, writes its row and full-text row, and
    /// announces it to live collections.
    pub fn create_conversation(&self, data: ConversationData) -> Result<Arc<GlodaConversation>> {
        self.check_open()?;
        let conversation = Arc::new(GlodaConversation::new(self.ids.conversation.allocate(), data));
        let item: ItemRef = conversation.clone();

        let noun = self.noun(NOUN_CONVERSATION)?;
        let row = item.clone();
        drop(self.executor.execute_async(move |conn| noun.insert(conn, &row)));

        self.cache.items_added(NOUN_CONVERSATION, &[item]);
        Ok(conversation)
    }

    /// Deletes a conversation together with its messages.
    pub fn delete_conversation_by_id(&self, id: i64) -> Result<Pending<()>> {
        self.check_open()?;
        debug!("Deleting conversation {}", id);
        let pending = self.executor.execute_async(move |conn| {
            prepare(
                conn,
                "DELETE FROM messagesText WHERE docid IN \
                 (SELECT id FROM messages WHERE conversationID = ?1)",
            )?
            .execute(params![id])?;
            prepare(conn, "DELETE FROM messageAttributes WHERE conversationID = ?1")?
                .execute(params![id])?;
            prepare(conn, "DELETE FROM messages WHERE conversationID = ?1")?.execute(params![id])?;
            prepare(conn, "DELETE FROM conversationsText WHERE docid = ?1")?.execute(params![id])?;
            prepare(conn, "DELETE FROM conversations WHERE id = ?1")?.execute(params![id])?;
            Ok(())
        });

        self.cache
            .items_deleted_by_attribute(NOUN_MESSAGE, "conversationID", &AttributeValue::Int(id));
        self.cache.items_deleted(NOUN_CONVERSATION, &[id]);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DatastoreConfig;
    use crate::datastore::Datastore;
    use crate::query::Query;
    use crate::types::{ConversationData, GlodaItem, NOUN_CONVERSATION};

    fn count(ds: &Datastore, sql: &str) -> i64 {
        ds.executor()
            .execute_sync(|conn| Ok(conn.query_row(sql, [], |r| r.get(0))?))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_writes_row_and_text_row() {
        let ds = Datastore::open_in_memory(DatastoreConfig::default()).unwrap();
        let first = ds
            .create_conversation(ConversationData {
                subject: Some("lunch?".to_string()),
                ..Default::default()
            })
            .unwrap();
        let second = ds.create_conversation(ConversationData::default()).unwrap();
        assert_eq!(second.id(), first.id() + 1);
        ds.drain().await;

        assert_eq!(count(&ds, "SELECT COUNT(*) FROM conversations"), 2);
        assert_eq!(
            count(&ds, "SELECT COUNT(*) FROM conversationsText WHERE subject MATCH 'lunch'"),
            1
        );
    }

    #[tokio::test]
    async fn test_delete_removes_from_live_collection() {
        let ds = Datastore::open_in_memory(DatastoreConfig::default()).unwrap();
        let conversation = ds.create_conversation(ConversationData::default()).unwrap();
        ds.drain().await;

        let collection = ds.query(Query::new(NOUN_CONVERSATION), None).await.unwrap();
        assert!(collection.contains(conversation.id()));

        ds.delete_conversation_by_id(conversation.id()).unwrap().await.unwrap();
        assert!(!collection.contains(conversation.id()));
        assert_eq!(count(&ds, "SELECT COUNT(*) FROM conversations"), 0);
        assert_eq!(count(&ds, "SELECT COUNT(*) FROM conversationsText"), 0);
    }
}

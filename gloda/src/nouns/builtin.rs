//! The built-in nouns and their special attributes

use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::adapters::sqlite::schema::{
    contacts_table, conversations_table, identities_table, messages_table,
};
use crate::adapters::sqlite::TableDef;
use crate::nouns::{AttributeSpec, NounDef, SpecialKind};
use crate::types::{
    downcast_item, from_prtime, to_prtime, AttributeType, AttributeValue, ContactData,
    ConversationData, GlodaContact, GlodaConversation, GlodaError, GlodaIdentity, GlodaMessage,
    ItemRef, JsonAttributes, MessageData, MessageText, NounId, Result, NOUN_BOOLEAN, NOUN_CONTACT,
    NOUN_CONVERSATION, NOUN_DATE, NOUN_FOLDER, NOUN_FULLTEXT, NOUN_IDENTITY, NOUN_MESSAGE,
    NOUN_NUMBER, NOUN_STRING,
};

pub const CORE_EXTENSION: &str = "core";

const MESSAGE_VALIDITY: &str =
    " AND +deleted = 0 AND +folderID IS NOT NULL AND +messageKey IS NOT NULL";
const MESSAGE_JOIN: &str = " INNER JOIN messagesText ON messages.id = messagesText.rowid";
const MESSAGE_JOIN_NO_VALIDITY: &str =
    " LEFT JOIN messagesText ON messages.id = messagesText.rowid";

/// Column count of a message row joined with its full-text row.
const MESSAGE_WITH_TEXT_COLUMNS: usize = 14;

fn expect_item<T: crate::types::GlodaItem>(item: &ItemRef, noun: &str) -> Result<Arc<T>> {
    downcast_item::<T>(item)
        .ok_or_else(|| GlodaError::InvalidInput(format!("item {} is not a {}", item.id(), noun)))
}

fn json_column(text: Option<String>, owner: i64) -> JsonAttributes {
    match text.as_deref().map(JsonAttributes::parse) {
        Some(Ok(attributes)) => attributes,
        Some(Err(e)) => {
            warn!("Dropping unreadable JSON attributes of {}: {}", owner, e);
            JsonAttributes::new()
        }
        None => JsonAttributes::new(),
    }
}

fn json_text(attributes: &JsonAttributes) -> Result<Option<String>> {
    if attributes.is_empty() {
        return Ok(None);
    }
    Ok(Some(attributes.to_json()?))
}

/// Nouns without a table: attribute values of these types are stored as is.
#[derive(Debug, Clone)]
pub struct ValueNoun {
    id: NounId,
    name: String,
    parameterized: bool,
}

impl ValueNoun {
    pub fn new(id: NounId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            parameterized: false,
        }
    }

    /// A noun whose values are `[parameter, value]` pairs; every distinct
    /// parameter gets its own attribute id.
    pub fn parameterized(id: NounId, name: &str) -> Self {
        Self {
            parameterized: true,
            ..Self::new(id, name)
        }
    }
}

impl NounDef for ValueNoun {
    fn id(&self) -> NounId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn uses_parameter(&self) -> bool {
        self.parameterized
    }

    fn to_param_and_value(&self, value: &AttributeValue) -> (Option<String>, AttributeValue) {
        if !self.parameterized {
            return (None, value.clone());
        }
        match value {
            AttributeValue::List(parts) => match parts.as_slice() {
                [AttributeValue::Str(param), inner] => (Some(param.clone()), inner.clone()),
                [AttributeValue::Str(param)] => (Some(param.clone()), AttributeValue::Null),
                _ => (None, value.clone()),
            },
            AttributeValue::Str(param) => (Some(param.clone()), AttributeValue::Null),
            other => (None, other.clone()),
        }
    }
}

/// Folders are loaded at startup and handed out by the datastore; they are
/// never the target of a query.
#[derive(Debug)]
pub struct FolderNoun;

impl NounDef for FolderNoun {
    fn id(&self) -> NounId {
        NOUN_FOLDER
    }

    fn name(&self) -> &str {
        "folder"
    }
}

#[derive(Debug)]
pub struct ConversationNoun {
    table: TableDef,
}

impl ConversationNoun {
    pub fn new() -> Self {
        Self {
            table: conversations_table(),
        }
    }
}

impl NounDef for ConversationNoun {
    fn id(&self) -> NounId {
        NOUN_CONVERSATION
    }

    fn name(&self) -> &str {
        "conversation"
    }

    fn table(&self) -> Option<&TableDef> {
        Some(&self.table)
    }

    fn row_to_object(&self, row: &Row<'_>) -> rusqlite::Result<ItemRef> {
        let id: i64 = row.get(0)?;
        let data = ConversationData {
            subject: row.get(1)?,
            oldest_message_date: row.get::<_, Option<i64>>(2)?.and_then(from_prtime),
            newest_message_date: row.get::<_, Option<i64>>(3)?.and_then(from_prtime),
        };
        Ok(Arc::new(GlodaConversation::new(id, data)))
    }

    fn insert(&self, conn: &Connection, item: &ItemRef) -> Result<()> {
        let conversation = expect_item::<GlodaConversation>(item, "conversation")?;
        let data = conversation.data();
        let subject = data.subject.unwrap_or_default();
        conn.prepare_cached(
            "INSERT INTO conversations (id, subject, oldestMessageDate, newestMessageDate) \
             VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![
            item.id(),
            subject,
            data.oldest_message_date.as_ref().map(to_prtime),
            data.newest_message_date.as_ref().map(to_prtime),
        ])?;
        conn.prepare_cached("INSERT INTO conversationsText (docid, subject) VALUES (?1, ?2)")?
            .execute(params![item.id(), subject])?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct MessageNoun {
    table: TableDef,
}

impl MessageNoun {
    pub fn new() -> Self {
        Self {
            table: messages_table(),
        }
    }
}

impl NounDef for MessageNoun {
    fn id(&self) -> NounId {
        NOUN_MESSAGE
    }

    fn name(&self) -> &str {
        "message"
    }

    fn table(&self) -> Option<&TableDef> {
        Some(&self.table)
    }

    fn attribute_table(&self) -> Option<(&str, &str)> {
        Some(("messageAttributes", "messageID"))
    }

    fn validity_suffix(&self) -> Option<&str> {
        Some(MESSAGE_VALIDITY)
    }

    fn join_magic(&self) -> Option<&str> {
        Some(MESSAGE_JOIN)
    }

    fn join_magic_without_validity(&self) -> Option<&str> {
        Some(MESSAGE_JOIN_NO_VALIDITY)
    }

    fn allows_arbitrary_attrs(&self) -> bool {
        true
    }

    fn row_to_object(&self, row: &Row<'_>) -> rusqlite::Result<ItemRef> {
        let id: i64 = row.get(0)?;
        let data = MessageData {
            folder_id: row.get(1)?,
            message_key: row.get(2)?,
            conversation_id: row.get(3)?,
            date: row.get::<_, Option<i64>>(4)?.and_then(from_prtime),
            header_message_id: row.get(5)?,
            deleted: row.get::<_, i64>(6)? != 0,
            json_attributes: json_column(row.get(7)?, id),
            notability: row.get(8)?,
        };

        if row.as_ref().column_count() < MESSAGE_WITH_TEXT_COLUMNS {
            return Ok(Arc::new(GlodaMessage::from_row(id, data, None)));
        }

        let body: Option<String> = row.get(9)?;
        let has_text = data.folder_id.is_some();
        let message = GlodaMessage::from_row(id, data, body.clone());
        if has_text {
            let attachment_names: Option<String> = row.get(11)?;
            message.set_text(MessageText {
                subject: row.get(10)?,
                body,
                attachment_names: attachment_names
                    .filter(|names| !names.is_empty())
                    .map(|names| names.split('\n').map(str::to_string).collect())
                    .unwrap_or_default(),
                author: row.get(12)?,
                recipients: row.get(13)?,
            });
        }
        Ok(Arc::new(message))
    }

    fn insert(&self, conn: &Connection, item: &ItemRef) -> Result<()> {
        let message = expect_item::<GlodaMessage>(item, "message")?;
        let data = message.data();
        conn.prepare_cached(
            "INSERT INTO messages (id, folderID, messageKey, conversationID, date, \
             headerMessageID, jsonAttributes, notability) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?
        .execute(params![
            item.id(),
            data.folder_id,
            data.message_key,
            data.conversation_id,
            data.date.as_ref().map(to_prtime),
            data.header_message_id,
            json_text(&data.json_attributes)?,
            data.notability,
        ])?;

        if data.folder_id.is_some() {
            insert_message_text(conn, &message)?;
        }
        Ok(())
    }

    /// Rewrites the row. A located message gets its full-text row created
    /// if it has none yet (ghost promotion), otherwise the row is only
    /// touched when the body changed.
    fn update(&self, conn: &Connection, item: &ItemRef) -> Result<()> {
        let message = expect_item::<GlodaMessage>(item, "message")?;
        let data = message.data();
        conn.prepare_cached(
            "UPDATE messages SET folderID = ?1, messageKey = ?2, conversationID = ?3, \
             date = ?4, headerMessageID = ?5, jsonAttributes = ?6, notability = ?7, \
             deleted = ?8 WHERE id = ?9",
        )?
        .execute(params![
            data.folder_id,
            data.message_key,
            data.conversation_id,
            data.date.as_ref().map(to_prtime),
            data.header_message_id,
            json_text(&data.json_attributes)?,
            data.notability,
            data.deleted as i64,
            item.id(),
        ])?;

        if data.folder_id.is_some() {
            if message.is_new() {
                insert_message_text(conn, &message)?;
            } else {
                update_message_text(conn, &message)?;
            }
        }
        Ok(())
    }
}

fn insert_message_text(conn: &Connection, message: &GlodaMessage) -> Result<()> {
    let text = message.text().unwrap_or_default();
    conn.prepare_cached(
        "INSERT INTO messagesText (docid, subject, body, attachmentNames, author, recipients) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        message_id(message),
        text.subject,
        text.body,
        text.attachment_names_text(),
        text.author,
        text.recipients,
    ])?;
    message.set_indexed_body(text.body);
    message.set_is_new(false);
    Ok(())
}

fn update_message_text(conn: &Connection, message: &GlodaMessage) -> Result<()> {
    let text = message.text().unwrap_or_default();
    if text.body == message.indexed_body() {
        debug!("Skipping full-text update of {} because the body matches", message_id(message));
        return Ok(());
    }
    conn.prepare_cached(
        "UPDATE messagesText SET body = ?1, attachmentNames = ?2 WHERE docid = ?3",
    )?
    .execute(params![text.body, text.attachment_names_text(), message_id(message)])?;
    message.set_indexed_body(text.body);
    Ok(())
}

fn message_id(message: &GlodaMessage) -> i64 {
    crate::types::GlodaItem::id(message)
}

#[derive(Debug)]
pub struct ContactNoun {
    table: TableDef,
}

impl ContactNoun {
    pub fn new() -> Self {
        Self {
            table: contacts_table(),
        }
    }
}

impl NounDef for ContactNoun {
    fn id(&self) -> NounId {
        NOUN_CONTACT
    }

    fn name(&self) -> &str {
        "contact"
    }

    fn table(&self) -> Option<&TableDef> {
        Some(&self.table)
    }

    fn attribute_table(&self) -> Option<(&str, &str)> {
        Some(("contactAttributes", "contactID"))
    }

    fn allows_arbitrary_attrs(&self) -> bool {
        true
    }

    fn row_to_object(&self, row: &Row<'_>) -> rusqlite::Result<ItemRef> {
        let id: i64 = row.get(0)?;
        let data = ContactData {
            directory_uuid: row.get(1)?,
            contact_uuid: row.get(2)?,
            popularity: row.get::<_, Option<i64>>(3)?.unwrap_or_default(),
            frecency: row.get::<_, Option<i64>>(4)?.unwrap_or_default(),
            name: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            json_attributes: json_column(row.get(6)?, id),
        };
        Ok(Arc::new(GlodaContact::new(id, data)))
    }

    fn insert(&self, conn: &Connection, item: &ItemRef) -> Result<()> {
        let contact = expect_item::<GlodaContact>(item, "contact")?;
        let data = contact.data();
        conn.prepare_cached(
            "INSERT INTO contacts (id, directoryUUID, contactUUID, name, popularity, \
             frecency, jsonAttributes) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?
        .execute(params![
            item.id(),
            data.directory_uuid,
            data.contact_uuid,
            data.name,
            data.popularity,
            data.frecency,
            json_text(&data.json_attributes)?,
        ])?;
        Ok(())
    }

    fn update(&self, conn: &Connection, item: &ItemRef) -> Result<()> {
        let contact = expect_item::<GlodaContact>(item, "contact")?;
        let data = contact.data();
        conn.prepare_cached(
            "UPDATE contacts SET directoryUUID = ?1, contactUUID = ?2, name = ?3, \
             popularity = ?4, frecency = ?5, jsonAttributes = ?6 WHERE id = ?7",
        )?
        .execute(params![
            data.directory_uuid,
            data.contact_uuid,
            data.name,
            data.popularity,
            data.frecency,
            json_text(&data.json_attributes)?,
            item.id(),
        ])?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct IdentityNoun {
    table: TableDef,
}

impl IdentityNoun {
    pub fn new() -> Self {
        Self {
            table: identities_table(),
        }
    }
}

impl NounDef for IdentityNoun {
    fn id(&self) -> NounId {
        NOUN_IDENTITY
    }

    fn name(&self) -> &str {
        "identity"
    }

    fn table(&self) -> Option<&TableDef> {
        Some(&self.table)
    }

    fn row_to_object(&self, row: &Row<'_>) -> rusqlite::Result<ItemRef> {
        let description: Option<String> = row.get(4)?;
        Ok(Arc::new(GlodaIdentity::new(
            row.get(0)?,
            row.get(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            description.filter(|d| !d.is_empty()),
            row.get::<_, i64>(5)? != 0,
        )))
    }

    fn insert(&self, conn: &Connection, item: &ItemRef) -> Result<()> {
        let identity = expect_item::<GlodaIdentity>(item, "identity")?;
        conn.prepare_cached(
            "INSERT INTO identities (id, contactID, kind, value, description, relay) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?
        .execute(params![
            item.id(),
            identity.contact_id,
            identity.kind,
            identity.value,
            identity.description.clone().unwrap_or_default(),
            identity.relay as i64,
        ])?;
        Ok(())
    }
}

/// Every noun the datastore registers at open.
pub fn builtin_nouns() -> Vec<Arc<dyn NounDef>> {
    vec![
        Arc::new(ValueNoun::new(NOUN_BOOLEAN, "boolean")),
        Arc::new(ValueNoun::new(NOUN_NUMBER, "number")),
        Arc::new(ValueNoun::new(NOUN_FULLTEXT, "fulltext")),
        Arc::new(ValueNoun::new(NOUN_STRING, "string")),
        Arc::new(ValueNoun::new(NOUN_DATE, "date")),
        Arc::new(FolderNoun),
        Arc::new(ConversationNoun::new()),
        Arc::new(MessageNoun::new()),
        Arc::new(ContactNoun::new()),
        Arc::new(IdentityNoun::new()),
    ]
}

fn core(name: &str, subject: NounId, object: NounId) -> AttributeSpec {
    AttributeSpec::new(CORE_EXTENSION, name, subject, object)
}

/// Special attributes of the built-in nouns.
pub fn builtin_attributes() -> Vec<AttributeSpec> {
    let fulltext = |name: &str, subject: NounId, column: &str| {
        core(name, subject, NOUN_FULLTEXT)
            .of_type(AttributeType::Derived)
            .special(SpecialKind::Fulltext, column)
    };

    vec![
        // messages
        core("folder", NOUN_MESSAGE, NOUN_FOLDER).special(SpecialKind::Column, "folderID"),
        core("messageKey", NOUN_MESSAGE, NOUN_NUMBER).special(SpecialKind::Column, "messageKey"),
        core("conversation", NOUN_MESSAGE, NOUN_CONVERSATION)
            .special(SpecialKind::Parent, "conversationID"),
        core("date", NOUN_MESSAGE, NOUN_DATE).special(SpecialKind::Column, "date"),
        core("headerMessageID", NOUN_MESSAGE, NOUN_STRING)
            .special(SpecialKind::String, "headerMessageID"),
        core("deleted", NOUN_MESSAGE, NOUN_BOOLEAN).special(SpecialKind::Column, "deleted"),
        core("notability", NOUN_MESSAGE, NOUN_NUMBER).special(SpecialKind::Column, "notability"),
        fulltext("fulltextMatches", NOUN_MESSAGE, "messagesText"),
        fulltext("subjectMatches", NOUN_MESSAGE, "subject"),
        fulltext("bodyMatches", NOUN_MESSAGE, "body"),
        fulltext("attachmentNamesMatch", NOUN_MESSAGE, "attachmentNames"),
        fulltext("authorMatches", NOUN_MESSAGE, "author"),
        fulltext("recipientsMatch", NOUN_MESSAGE, "recipients"),
        // conversations
        core("subject", NOUN_CONVERSATION, NOUN_STRING).special(SpecialKind::String, "subject"),
        fulltext("conversationSubjectMatches", NOUN_CONVERSATION, "subject")
            .bound_as("subjectMatches"),
        core("oldestMessageDate", NOUN_CONVERSATION, NOUN_DATE)
            .special(SpecialKind::Column, "oldestMessageDate"),
        core("newestMessageDate", NOUN_CONVERSATION, NOUN_DATE)
            .special(SpecialKind::Column, "newestMessageDate"),
        // contacts
        core("identities", NOUN_CONTACT, NOUN_IDENTITY)
            .special(SpecialKind::Children, "contactID")
            .plural(),
        core("name", NOUN_CONTACT, NOUN_STRING).special(SpecialKind::String, "name"),
        core("popularity", NOUN_CONTACT, NOUN_NUMBER).special(SpecialKind::Column, "popularity"),
        core("frecency", NOUN_CONTACT, NOUN_NUMBER).special(SpecialKind::Column, "frecency"),
        // identities
        core("contact", NOUN_IDENTITY, NOUN_CONTACT).special(SpecialKind::Parent, "contactID"),
        core("kind", NOUN_IDENTITY, NOUN_STRING).special(SpecialKind::String, "kind"),
        core("value", NOUN_IDENTITY, NOUN_STRING).special(SpecialKind::String, "value"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_compound_names_are_unique_per_noun() {
        let mut seen = HashSet::new();
        for spec in builtin_attributes() {
            assert!(seen.insert((spec.subject_noun, spec.bound_name.clone())));
        }
        let compound: HashSet<_> = builtin_attributes().iter().map(|a| a.compound_name()).collect();
        assert_eq!(compound.len(), builtin_attributes().len());
    }

    #[test]
    fn test_parameterized_values_split() {
        let noun = ValueNoun::parameterized(900, "tag");
        let (param, value) = noun.to_param_and_value(&AttributeValue::List(vec![
            AttributeValue::from("urgent"),
            AttributeValue::Int(1),
        ]));
        assert_eq!(param.as_deref(), Some("urgent"));
        assert_eq!(value, AttributeValue::Int(1));

        let plain = ValueNoun::new(NOUN_NUMBER, "number");
        assert_eq!(plain.to_param_and_value(&AttributeValue::Int(3)), (None, AttributeValue::Int(3)));
    }

    #[test]
    fn test_message_row_without_text_is_ghost_aware() {
        let conn = Connection::open_in_memory().unwrap();
        messages_table().create(&conn).unwrap();
        conn.execute(
            "INSERT INTO messages (id, folderID, messageKey, conversationID, jsonAttributes) \
             VALUES (40, NULL, NULL, 7, '{\"33\":{\"type\":\"int\",\"value\":5}}')",
            [],
        )
        .unwrap();

        let noun = MessageNoun::new();
        let item = conn
            .query_row("SELECT * FROM messages WHERE id = 40", [], |row| noun.row_to_object(row))
            .unwrap();
        let message = downcast_item::<GlodaMessage>(&item).unwrap();
        assert!(message.is_ghost());
        assert!(message.is_new());
        assert_eq!(message.conversation_id(), 7);
        assert_eq!(
            item.json_attributes().unwrap().get(33),
            Some(&AttributeValue::Int(5))
        );
    }
}

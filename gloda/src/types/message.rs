use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::types::item::{GlodaItem, ItemRef, ItemState, Resolution};
use crate::types::value::{AttributeValue, JsonAttributes};
use crate::types::{to_prtime, NounId, NOUN_MESSAGE};

/// Persisted columns of a `messages` row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageData {
    /// `None` together with `message_key` marks a ghost message.
    pub folder_id: Option<i64>,
    pub message_key: Option<i64>,
    pub conversation_id: i64,
    pub date: Option<DateTime<Utc>>,
    pub header_message_id: Option<String>,
    pub deleted: bool,
    pub notability: i64,
    pub json_attributes: JsonAttributes,
}

/// Indexable content written to the `messagesText` full-text row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageText {
    pub subject: Option<String>,
    pub body: Option<String>,
    pub attachment_names: Vec<String>,
    pub author: Option<String>,
    pub recipients: Option<String>,
}

impl MessageText {
    pub fn attachment_names_text(&self) -> Option<String> {
        if self.attachment_names.is_empty() {
            None
        } else {
            Some(self.attachment_names.join("\n"))
        }
    }
}

#[derive(Debug)]
pub struct GlodaMessage {
    id: i64,
    data: RwLock<MessageData>,
    text: RwLock<Option<MessageText>>,
    /// Body text as last written to the full-text row.
    indexed_body: RwLock<Option<String>>,
    /// True while no full-text row exists for this message.
    is_new: AtomicBool,
    state: ItemState,
}

impl GlodaMessage {
    pub fn new(id: i64, data: MessageData) -> Self {
        Self {
            id,
            data: RwLock::new(data),
            text: RwLock::new(None),
            indexed_body: RwLock::new(None),
            is_new: AtomicBool::new(true),
            state: ItemState::new(),
        }
    }

    /// A message materialized from an existing row. Only non-ghost rows have
    /// a full-text row.
    pub fn from_row(id: i64, data: MessageData, indexed_body: Option<String>) -> Self {
        let has_text = data.folder_id.is_some();
        let message = Self::new(id, data);
        message.is_new.store(!has_text, Ordering::SeqCst);
        if let Ok(mut body) = message.indexed_body.write() {
            *body = indexed_body;
        }
        message
    }

    pub fn data(&self) -> MessageData {
        self.data.read().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn update<F: FnOnce(&mut MessageData)>(&self, f: F) {
        if let Ok(mut data) = self.data.write() {
            f(&mut data);
        }
    }

    pub fn folder_id(&self) -> Option<i64> {
        self.data.read().ok().and_then(|d| d.folder_id)
    }

    pub fn message_key(&self) -> Option<i64> {
        self.data.read().ok().and_then(|d| d.message_key)
    }

    pub fn conversation_id(&self) -> i64 {
        self.data.read().map(|d| d.conversation_id).unwrap_or_default()
    }

    pub fn header_message_id(&self) -> Option<String> {
        self.data.read().ok().and_then(|d| d.header_message_id.clone())
    }

    pub fn is_ghost(&self) -> bool {
        self.folder_id().is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.data.read().map(|d| d.deleted).unwrap_or(false)
    }

    pub fn set_location(&self, folder_id: Option<i64>, message_key: Option<i64>) {
        self.update(|d| {
            d.folder_id = folder_id;
            d.message_key = message_key;
        });
    }

    pub fn text(&self) -> Option<MessageText> {
        self.text.read().ok().and_then(|t| t.clone())
    }

    pub fn set_text(&self, text: MessageText) {
        if let Ok(mut slot) = self.text.write() {
            *slot = Some(text);
        }
    }

    pub fn indexed_body(&self) -> Option<String> {
        self.indexed_body.read().ok().and_then(|b| b.clone())
    }

    pub(crate) fn set_indexed_body(&self, body: Option<String>) {
        if let Ok(mut slot) = self.indexed_body.write() {
            *slot = body;
        }
    }

    pub fn is_new(&self) -> bool {
        self.is_new.load(Ordering::SeqCst)
    }

    pub(crate) fn set_is_new(&self, value: bool) {
        self.is_new.store(value, Ordering::SeqCst);
    }

    /// The owning conversation, once resolved.
    pub fn conversation(&self) -> Option<ItemRef> {
        match self.state.link("conversation") {
            Resolution::One(item) => Some(item),
            _ => None,
        }
    }
}

impl GlodaItem for GlodaMessage {
    fn noun_id(&self) -> NounId {
        NOUN_MESSAGE
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn column_value(&self, column: &str) -> Option<AttributeValue> {
        let data = self.data.read().ok()?;
        let value = match column {
            "id" => AttributeValue::Int(self.id),
            "folderID" => data.folder_id.into(),
            "messageKey" => data.message_key.into(),
            "conversationID" => AttributeValue::Int(data.conversation_id),
            "date" => data.date.as_ref().map(to_prtime).into(),
            "headerMessageID" => data.header_message_id.clone().into(),
            "deleted" => data.deleted.into(),
            "notability" => AttributeValue::Int(data.notability),
            _ => return None,
        };
        Some(value)
    }

    fn json_attributes(&self) -> Option<JsonAttributes> {
        self.data.read().ok().map(|d| d.json_attributes.clone())
    }

    fn set_json_attributes(&self, attributes: JsonAttributes) {
        self.update(|d| d.json_attributes = attributes);
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

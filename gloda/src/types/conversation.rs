use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::{Arc, RwLock};

use crate::types::item::{GlodaItem, ItemState};
use crate::types::value::AttributeValue;
use crate::types::{to_prtime, NounId, NOUN_CONVERSATION};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationData {
    pub subject: Option<String>,
    pub oldest_message_date: Option<DateTime<Utc>>,
    pub newest_message_date: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct GlodaConversation {
    id: i64,
    data: RwLock<ConversationData>,
    state: ItemState,
}

impl GlodaConversation {
    pub fn new(id: i64, data: ConversationData) -> Self {
        Self {
            id,
            data: RwLock::new(data),
            state: ItemState::new(),
        }
    }

    pub fn data(&self) -> ConversationData {
        self.data.read().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn subject(&self) -> Option<String> {
        self.data.read().ok().and_then(|d| d.subject.clone())
    }

    pub fn update<F: FnOnce(&mut ConversationData)>(&self, f: F) {
        if let Ok(mut data) = self.data.write() {
            f(&mut data);
        }
    }
}

impl GlodaItem for GlodaConversation {
    fn noun_id(&self) -> NounId {
        NOUN_CONVERSATION
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn column_value(&self, column: &str) -> Option<AttributeValue> {
        let data = self.data.read().ok()?;
        match column {
            "id" => Some(AttributeValue::Int(self.id)),
            "subject" => Some(data.subject.clone().into()),
            "oldestMessageDate" => Some(data.oldest_message_date.as_ref().map(to_prtime).into()),
            "newestMessageDate" => Some(data.newest_message_date.as_ref().map(to_prtime).into()),
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

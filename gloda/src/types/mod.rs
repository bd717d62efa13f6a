//! Data model shared by every layer of the datastore
//!
//! - `item`: the `GlodaItem` trait and resolved-reference slots
//! - `value`: attribute values and the JSON attribute blob codec
//! - one module per built-in noun

pub mod attribute;
pub mod contact;
pub mod conversation;
pub mod error;
pub mod folder;
pub mod item;
pub mod message;
pub mod value;

use chrono::{DateTime, TimeZone, Utc};

pub use attribute::{compound_name, AttributeDbDef, AttributeType};
pub use contact::{ContactData, GlodaContact, GlodaIdentity};
pub use conversation::{ConversationData, GlodaConversation};
pub use error::{GlodaError, Result};
pub use folder::{DirtyStatus, FolderActivity, FolderHandle, GlodaFolder, IndexingPriority};
pub use item::{downcast_item, GlodaItem, ItemRef, ItemState, Resolution};
pub use message::{GlodaMessage, MessageData, MessageText};
pub use value::{escape_like, AttributeValue, JsonAttributes};

/// Numeric identifier of a noun type
pub type NounId = u32;

pub const NOUN_BOOLEAN: NounId = 1;
pub const NOUN_NUMBER: NounId = 2;
pub const NOUN_FULLTEXT: NounId = 3;
pub const NOUN_STRING: NounId = 4;
pub const NOUN_DATE: NounId = 10;
pub const NOUN_FOLDER: NounId = 100;
pub const NOUN_CONVERSATION: NounId = 101;
pub const NOUN_MESSAGE: NounId = 102;
pub const NOUN_CONTACT: NounId = 103;
pub const NOUN_IDENTITY: NounId = 104;

/// Converts a timestamp to PRTime (microseconds since the epoch), the
/// on-disk representation of every date column.
pub fn to_prtime(date: &DateTime<Utc>) -> i64 {
    date.timestamp_micros()
}

pub fn from_prtime(prtime: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(prtime).single()
}

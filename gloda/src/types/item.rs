//! The item model
//!
//! Every noun instance is an `Arc<dyn GlodaItem>`. Rows are materialized into
//! provisional items whose dependent fields are filled in later by the query
//! resolver, through the item's `ItemState`:
//! - links: resolved parent, children and JSON references, keyed by the
//!   attribute's bound name
//! - attributes: the raw attribute values read from the row and JSON blob
//!
//! Children links are stored weakly (the child already points back at its
//! parent), so contact/identity style cycles never keep each other alive.
//! Collections and the noun caches hold the strong references.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::{Arc, RwLock, Weak};

use crate::types::value::{AttributeValue, JsonAttributes};
use crate::types::NounId;

pub type ItemRef = Arc<dyn GlodaItem>;

pub trait GlodaItem: Any + Send + Sync + Debug {
    fn noun_id(&self) -> NounId;

    fn id(&self) -> i64;

    /// Secondary cache key, for nouns that can be looked up by value.
    fn unique_value(&self) -> Option<String> {
        None
    }

    /// Current value of a denormalized column on the noun's main table.
    fn column_value(&self, column: &str) -> Option<AttributeValue>;

    fn json_attributes(&self) -> Option<JsonAttributes> {
        None
    }

    /// Replaces the JSON attribute blob after unknown attributes were dropped
    /// at load time.
    fn set_json_attributes(&self, _attributes: JsonAttributes) {}

    fn state(&self) -> &ItemState;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Recovers the concrete type of an item.
pub fn downcast_item<T: GlodaItem>(item: &ItemRef) -> Option<Arc<T>> {
    item.clone().into_any().downcast::<T>().ok()
}

/// State of one dependent field of an item.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The resolver has not run for this field, or the weakly held targets
    /// are gone.
    Unresolved,
    /// Resolution ran and found nothing.
    Absent,
    One(ItemRef),
    Many(Vec<ItemRef>),
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Resolution::Unresolved)
    }

    pub fn one(&self) -> Option<&ItemRef> {
        match self {
            Resolution::One(item) => Some(item),
            _ => None,
        }
    }

    pub fn many(&self) -> Vec<ItemRef> {
        match self {
            Resolution::One(item) => vec![item.clone()],
            Resolution::Many(items) => items.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
enum LinkSlot {
    Absent,
    One(ItemRef),
    Many(Vec<ItemRef>),
    Children(Vec<Weak<dyn GlodaItem>>),
}

#[derive(Debug, Default)]
pub struct ItemState {
    links: RwLock<HashMap<String, LinkSlot>>,
    attributes: RwLock<BTreeMap<String, AttributeValue>>,
}

impl ItemState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_link(&self, name: &str, resolution: Resolution) {
        let slot = match resolution {
            Resolution::Unresolved => {
                if let Ok(mut links) = self.links.write() {
                    links.remove(name);
                }
                return;
            }
            Resolution::Absent => LinkSlot::Absent,
            Resolution::One(item) => LinkSlot::One(item),
            Resolution::Many(items) => LinkSlot::Many(items),
        };
        if let Ok(mut links) = self.links.write() {
            links.insert(name.to_string(), slot);
        }
    }

    pub fn set_children(&self, name: &str, children: &[ItemRef]) {
        let weak = children.iter().map(Arc::downgrade).collect();
        if let Ok(mut links) = self.links.write() {
            links.insert(name.to_string(), LinkSlot::Children(weak));
        }
    }

    pub fn link(&self, name: &str) -> Resolution {
        let links = match self.links.read() {
            Ok(links) => links,
            Err(_) => return Resolution::Unresolved,
        };
        match links.get(name) {
            None => Resolution::Unresolved,
            Some(LinkSlot::Absent) => Resolution::Absent,
            Some(LinkSlot::One(item)) => Resolution::One(item.clone()),
            Some(LinkSlot::Many(items)) => Resolution::Many(items.clone()),
            Some(LinkSlot::Children(weak)) => {
                let alive: Vec<ItemRef> = weak.iter().filter_map(Weak::upgrade).collect();
                if alive.len() == weak.len() {
                    Resolution::Many(alive)
                } else {
                    Resolution::Unresolved
                }
            }
        }
    }

    pub fn is_linked(&self, name: &str) -> bool {
        self.links
            .read()
            .map(|links| links.contains_key(name))
            .unwrap_or(false)
    }

    pub fn set_attribute(&self, name: &str, value: AttributeValue) {
        if let Ok(mut attributes) = self.attributes.write() {
            attributes.insert(name.to_string(), value);
        }
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.attributes.read().ok()?.get(name).cloned()
    }

    pub fn attributes(&self) -> BTreeMap<String, AttributeValue> {
        self.attributes
            .read()
            .map(|attributes| attributes.clone())
            .unwrap_or_default()
    }
}

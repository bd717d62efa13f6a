//! Contacts and the identities they own

use std::any::Any;
use std::sync::{Arc, RwLock};

use crate::types::item::{downcast_item, GlodaItem, ItemState};
use crate::types::value::{AttributeValue, JsonAttributes};
use crate::types::{NounId, NOUN_CONTACT, NOUN_IDENTITY};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactData {
    pub directory_uuid: Option<String>,
    pub contact_uuid: Option<String>,
    pub popularity: i64,
    pub frecency: i64,
    pub name: String,
    pub json_attributes: JsonAttributes,
}

#[derive(Debug)]
pub struct GlodaContact {
    id: i64,
    data: RwLock<ContactData>,
    state: ItemState,
}

impl GlodaContact {
    pub fn new(id: i64, data: ContactData) -> Self {
        Self {
            id,
            data: RwLock::new(data),
            state: ItemState::new(),
        }
    }

    pub fn data(&self) -> ContactData {
        self.data.read().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn name(&self) -> String {
        self.data.read().map(|d| d.name.clone()).unwrap_or_default()
    }

    pub fn update<F: FnOnce(&mut ContactData)>(&self, f: F) {
        if let Ok(mut data) = self.data.write() {
            f(&mut data);
        }
    }

    /// Identities owned by this contact, once resolved.
    pub fn identities(&self) -> Vec<Arc<GlodaIdentity>> {
        self.state
            .link("identities")
            .many()
            .iter()
            .filter_map(downcast_item::<GlodaIdentity>)
            .collect()
    }
}

impl GlodaItem for GlodaContact {
    fn noun_id(&self) -> NounId {
        NOUN_CONTACT
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn column_value(&self, column: &str) -> Option<AttributeValue> {
        let data = self.data.read().ok()?;
        match column {
            "id" => Some(AttributeValue::Int(self.id)),
            "directoryUUID" => Some(data.directory_uuid.clone().into()),
            "contactUUID" => Some(data.contact_uuid.clone().into()),
            "popularity" => Some(AttributeValue::Int(data.popularity)),
            "frecency" => Some(AttributeValue::Int(data.frecency)),
            "name" => Some(AttributeValue::Str(data.name.clone())),
            _ => None,
        }
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

/// An address-like handle of a contact, such as an e-mail address. Identities
/// never change after creation.
#[derive(Debug)]
pub struct GlodaIdentity {
    id: i64,
    pub contact_id: i64,
    pub kind: String,
    pub value: String,
    pub description: Option<String>,
    /// Set when the identity is a forwarding mechanism rather than a person.
    pub relay: bool,
    state: ItemState,
}

impl GlodaIdentity {
    pub fn new(
        id: i64,
        contact_id: i64,
        kind: impl Into<String>,
        value: impl Into<String>,
        description: Option<String>,
        relay: bool,
    ) -> Self {
        Self {
            id,
            contact_id,
            kind: kind.into(),
            value: value.into(),
            description,
            relay,
            state: ItemState::new(),
        }
    }

    pub fn lookup_key(kind: &str, value: &str) -> String {
        format!("{}@{}", kind, value)
    }

    pub fn contact(&self) -> Option<Arc<GlodaContact>> {
        self.state
            .link("contact")
            .one()
            .and_then(downcast_item::<GlodaContact>)
    }
}

impl GlodaItem for GlodaIdentity {
    fn noun_id(&self) -> NounId {
        NOUN_IDENTITY
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn unique_value(&self) -> Option<String> {
        Some(Self::lookup_key(&self.kind, &self.value))
    }

    fn column_value(&self, column: &str) -> Option<AttributeValue> {
        match column {
            "id" => Some(AttributeValue::Int(self.id)),
            "contactID" => Some(AttributeValue::Int(self.contact_id)),
            "kind" => Some(AttributeValue::Str(self.kind.clone())),
            "value" => Some(AttributeValue::Str(self.value.clone())),
            "description" => Some(self.description.clone().into()),
            "relay" => Some(self.relay.into()),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_unique_value_joins_kind_and_value() {
        let identity = GlodaIdentity::new(1, 2, "email", "bob@example.com", None, false);
        assert_eq!(identity.unique_value().as_deref(), Some("email@bob@example.com"));
        assert_eq!(identity.column_value("relay"), Some(AttributeValue::Int(0)));
    }
}

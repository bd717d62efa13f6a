//! Noun registry
//!
//! A noun is a registered entity type. Each one is described by a `NounDef`
//! implementation which knows its table, how to turn a row into an item and
//! how to write an item back. Attributes are registered per subject noun and
//! are either:
//! - special: backed by a denormalized column of the noun's own table, a
//!   parent/children relationship or a full-text column
//! - generic: stored as `(owner, attributeID, value)` rows in the noun's
//!   attribute table and in the JSON attribute blob of the item

pub mod builtin;
pub mod generic;

use rusqlite::{Connection, Row};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::adapters::sqlite::TableDef;
use crate::types::{
    compound_name, AttributeDbDef, AttributeType, AttributeValue, GlodaError, ItemRef, NounId,
    Result,
};

pub use builtin::{builtin_attributes, builtin_nouns, ValueNoun};
pub use generic::{GenericItem, GenericNoun};

/// How a special attribute is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialKind {
    /// A plain column on the subject noun's table.
    Column,
    /// Items of the object noun whose parent column points at us.
    Children,
    /// A column holding the id of an item of the object noun.
    Parent,
    /// A text column; `In` values are inlined as quoted strings.
    String,
    /// A column of the noun's full-text shadow table.
    Fulltext,
}

impl SpecialKind {
    pub fn code(self) -> i64 {
        match self {
            SpecialKind::Column => 16,
            SpecialKind::Children => 17,
            SpecialKind::Parent => 18,
            SpecialKind::String => 32,
            SpecialKind::Fulltext => 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSpec {
    pub extension: String,
    pub name: String,
    /// Name the value is exposed under on the item.
    pub bound_name: String,
    pub attribute_type: AttributeType,
    pub subject_noun: NounId,
    pub object_noun: NounId,
    pub special: Option<SpecialKind>,
    pub special_column: Option<String>,
    pub singular: bool,
    /// A `null` in an `In` constraint matches items that have no value at
    /// all for this attribute.
    pub empty_set_is_significant: bool,
}

impl AttributeSpec {
    pub fn new(extension: &str, name: &str, subject_noun: NounId, object_noun: NounId) -> Self {
        Self {
            extension: extension.to_string(),
            name: name.to_string(),
            bound_name: name.to_string(),
            attribute_type: AttributeType::Fundamental,
            subject_noun,
            object_noun,
            special: None,
            special_column: None,
            singular: true,
            empty_set_is_significant: false,
        }
    }

    pub fn bound_as(mut self, bound_name: &str) -> Self {
        self.bound_name = bound_name.to_string();
        self
    }

    pub fn of_type(mut self, attribute_type: AttributeType) -> Self {
        self.attribute_type = attribute_type;
        self
    }

    pub fn special(mut self, kind: SpecialKind, column: &str) -> Self {
        self.special = Some(kind);
        self.special_column = Some(column.to_string());
        self
    }

    pub fn plural(mut self) -> Self {
        self.singular = false;
        self
    }

    pub fn empty_set_is_significant(mut self) -> Self {
        self.empty_set_is_significant = true;
        self
    }

    pub fn compound_name(&self) -> String {
        compound_name(&self.extension, &self.name)
    }
}

/// A registered attribute: its declaration plus its persistent definition.
#[derive(Debug)]
pub struct AttributeDef {
    pub spec: AttributeSpec,
    pub db: Arc<AttributeDbDef>,
    id: i64,
}

impl AttributeDef {
    pub fn new(spec: AttributeSpec, db: Arc<AttributeDbDef>, id: i64) -> Self {
        Self { spec, db, id }
    }

    /// Primary (unparameterized) attribute id.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn compound_name(&self) -> String {
        self.spec.compound_name()
    }

    pub fn bound_name(&self) -> &str {
        &self.spec.bound_name
    }

    pub fn subject_noun(&self) -> NounId {
        self.spec.subject_noun
    }

    pub fn object_noun(&self) -> NounId {
        self.spec.object_noun
    }

    pub fn special(&self) -> Option<SpecialKind> {
        self.spec.special
    }

    pub fn is_special(&self) -> bool {
        self.spec.special.is_some()
    }

    /// Column holding the value: the special column, or `value` in the
    /// attribute table.
    pub fn value_column(&self) -> &str {
        self.spec.special_column.as_deref().unwrap_or("value")
    }

    pub fn singular(&self) -> bool {
        self.spec.singular
    }

    pub fn empty_set_is_significant(&self) -> bool {
        self.spec.empty_set_is_significant
    }
}

/// Resolves an attribute plus parameter to the attribute id rows are
/// stored under, creating the definition row on first use.
pub trait AttributeBinder: Send + Sync {
    fn bind_parameter(&self, attribute: &AttributeDef, parameter: Option<&str>) -> Result<i64>;

    /// The attribute and parameter a stored attribute id stands for, or
    /// `None` when no registered attribute owns it any more.
    fn attribute_for_id(&self, _id: i64) -> Option<(Arc<AttributeDef>, Option<String>)> {
        None
    }
}

/// Behavior of one noun type.
pub trait NounDef: Send + Sync + fmt::Debug {
    fn id(&self) -> NounId;

    fn name(&self) -> &str;

    /// Main table; value nouns have none.
    fn table(&self) -> Option<&TableDef> {
        None
    }

    fn table_name(&self) -> Option<&str> {
        self.table().map(|t| t.name.as_str())
    }

    /// Attribute table and its owner id column.
    fn attribute_table(&self) -> Option<(&str, &str)> {
        None
    }

    /// Appended to every intersected block of a query unless validity
    /// constraints are suppressed.
    fn validity_suffix(&self) -> Option<&str> {
        None
    }

    fn join_magic(&self) -> Option<&str> {
        None
    }

    fn join_magic_without_validity(&self) -> Option<&str> {
        None
    }

    fn allows_arbitrary_attrs(&self) -> bool {
        false
    }

    fn uses_parameter(&self) -> bool {
        false
    }

    /// Splits an attribute value into its parameter (for parameterized
    /// nouns) and the value stored in the database.
    fn to_param_and_value(&self, value: &AttributeValue) -> (Option<String>, AttributeValue) {
        (None, value.clone())
    }

    fn row_to_object(&self, _row: &Row<'_>) -> rusqlite::Result<ItemRef> {
        Err(rusqlite::Error::InvalidQuery)
    }

    fn insert(&self, _conn: &Connection, _item: &ItemRef) -> Result<()> {
        Err(GlodaError::InvalidInput(format!("noun {} is not persisted", self.name())))
    }

    fn update(&self, _conn: &Connection, _item: &ItemRef) -> Result<()> {
        Err(GlodaError::InvalidInput(format!("noun {} is not persisted", self.name())))
    }
}

/// Typed registry of nouns and the attributes defined on them.
#[derive(Debug, Default)]
pub struct NounRegistry {
    nouns: HashMap<NounId, Arc<dyn NounDef>>,
    attributes: HashMap<String, Arc<AttributeDef>>,
    by_noun: HashMap<NounId, Vec<Arc<AttributeDef>>>,
    by_bound_name: HashMap<(NounId, String), Arc<AttributeDef>>,
}

impl NounRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_noun(&mut self, noun: Arc<dyn NounDef>) -> Result<()> {
        if self.nouns.contains_key(&noun.id()) {
            return Err(GlodaError::InvalidInput(format!(
                "noun id {} is already registered",
                noun.id()
            )));
        }
        self.nouns.insert(noun.id(), noun);
        Ok(())
    }

    pub fn noun(&self, id: NounId) -> Result<Arc<dyn NounDef>> {
        self.nouns.get(&id).cloned().ok_or(GlodaError::UnknownNoun(id))
    }

    pub fn has_noun(&self, id: NounId) -> bool {
        self.nouns.contains_key(&id)
    }

    pub fn nouns(&self) -> Vec<Arc<dyn NounDef>> {
        let mut nouns: Vec<_> = self.nouns.values().cloned().collect();
        nouns.sort_by_key(|n| n.id());
        nouns
    }

    pub fn add_attribute(&mut self, attribute: Arc<AttributeDef>) {
        let subject = attribute.subject_noun();
        if let Some(list) = self.by_noun.get_mut(&subject) {
            list.retain(|a| a.compound_name() != attribute.compound_name());
        }
        self.by_noun.entry(subject).or_default().push(attribute.clone());
        self.by_bound_name
            .insert((subject, attribute.bound_name().to_string()), attribute.clone());
        self.attributes.insert(attribute.compound_name(), attribute);
    }

    /// Attribute by compound name (`extension:name`).
    pub fn attribute(&self, compound_name: &str) -> Option<Arc<AttributeDef>> {
        self.attributes.get(compound_name).cloned()
    }

    pub fn attribute_by_bound_name(&self, noun: NounId, bound_name: &str) -> Result<Arc<AttributeDef>> {
        self.by_bound_name
            .get(&(noun, bound_name.to_string()))
            .cloned()
            .ok_or_else(|| GlodaError::UnknownAttribute(format!("{}.{}", noun, bound_name)))
    }

    pub fn attributes_for(&self, noun: NounId) -> Vec<Arc<AttributeDef>> {
        self.by_noun.get(&noun).cloned().unwrap_or_default()
    }

    /// Parent and children attributes, resolved whenever an item of `noun`
    /// is loaded.
    pub fn load_attributes(&self, noun: NounId) -> Vec<Arc<AttributeDef>> {
        self.attributes_for(noun)
            .into_iter()
            .filter(|a| matches!(a.special(), Some(SpecialKind::Parent | SpecialKind::Children)))
            .collect()
    }

    /// The parent attribute of `noun` that some other noun's children
    /// attribute is the inverse of. Items of such nouns are grouped by their
    /// parent id while loading.
    pub fn parent_column_attr(&self, noun: NounId) -> Option<Arc<AttributeDef>> {
        self.attributes_for(noun).into_iter().find(|parent| {
            parent.special() == Some(SpecialKind::Parent)
                && self.attributes_for(parent.object_noun()).iter().any(|children| {
                    children.special() == Some(SpecialKind::Children)
                        && children.object_noun() == noun
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NOUN_CONTACT, NOUN_CONVERSATION, NOUN_IDENTITY, NOUN_MESSAGE};

    fn define(registry: &mut NounRegistry, spec: AttributeSpec, id: i64) -> Arc<AttributeDef> {
        let db = Arc::new(AttributeDbDef::new(spec.attribute_type, &spec.extension, &spec.name));
        db.set_primary_id(id);
        let def = Arc::new(AttributeDef::new(spec, db, id));
        registry.add_attribute(def.clone());
        def
    }

    #[test]
    fn test_special_codes() {
        assert_eq!(SpecialKind::Children.code(), 16 | 1);
        assert_eq!(SpecialKind::Parent.code(), 16 | 2);
        assert_eq!(SpecialKind::Fulltext.code(), 64);
    }

    #[test]
    fn test_parent_column_attr_requires_inverse_children() {
        let mut registry = NounRegistry::new();
        define(
            &mut registry,
            AttributeSpec::new("core", "identities", NOUN_CONTACT, NOUN_IDENTITY)
                .special(SpecialKind::Children, "contactID")
                .plural(),
            40,
        );
        define(
            &mut registry,
            AttributeSpec::new("core", "contact", NOUN_IDENTITY, NOUN_CONTACT)
                .special(SpecialKind::Parent, "contactID"),
            41,
        );
        define(
            &mut registry,
            AttributeSpec::new("core", "conversation", NOUN_MESSAGE, NOUN_CONVERSATION)
                .special(SpecialKind::Parent, "conversationID"),
            42,
        );

        assert_eq!(registry.parent_column_attr(NOUN_IDENTITY).map(|a| a.id()), Some(41));
        assert!(registry.parent_column_attr(NOUN_MESSAGE).is_none());
        assert_eq!(registry.load_attributes(NOUN_CONTACT).len(), 1);
        assert_eq!(
            registry.attribute_by_bound_name(NOUN_MESSAGE, "conversation").unwrap().id(),
            42
        );
        assert!(registry.attribute_by_bound_name(NOUN_MESSAGE, "nope").is_err());
    }

    #[test]
    fn test_redefining_replaces_attribute() {
        let mut registry = NounRegistry::new();
        define(&mut registry, AttributeSpec::new("ext", "tag", NOUN_MESSAGE, 4), 50);
        define(&mut registry, AttributeSpec::new("ext", "tag", NOUN_MESSAGE, 4), 51);
        assert_eq!(registry.attributes_for(NOUN_MESSAGE).len(), 1);
        assert_eq!(registry.attribute("ext:tag").unwrap().id(), 51);
    }
}

//! Nouns registered at runtime
//!
//! A generic noun owns a table whose columns are declared by the caller.
//! Rows are read by column name into a `GenericItem`; a `jsonAttributes`
//! column, when present, holds the item's attribute blob.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::adapters::sqlite::TableDef;
use crate::nouns::NounDef;
use crate::types::{
    downcast_item, AttributeValue, GlodaError, GlodaItem, ItemRef, ItemState, JsonAttributes,
    NounId, Result,
};

const JSON_COLUMN: &str = "jsonAttributes";

#[derive(Debug)]
pub struct GenericNoun {
    id: NounId,
    name: String,
    table: TableDef,
    attribute_table: String,
}

impl GenericNoun {
    /// `table` must have an integer `id` primary key as its first column.
    pub fn new(id: NounId, name: &str, table: TableDef) -> Self {
        let table = table.with_generic_attributes();
        Self {
            id,
            name: name.to_string(),
            attribute_table: format!("{}Attributes", table.name),
            table,
        }
    }

    pub fn attribute_table_name(&self) -> &str {
        &self.attribute_table
    }
}

impl NounDef for GenericNoun {
    fn id(&self) -> NounId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> Option<&TableDef> {
        Some(&self.table)
    }

    fn attribute_table(&self) -> Option<(&str, &str)> {
        Some((&self.attribute_table, "nounID"))
    }

    fn allows_arbitrary_attrs(&self) -> bool {
        true
    }

    fn row_to_object(&self, row: &Row<'_>) -> rusqlite::Result<ItemRef> {
        let statement = row.as_ref();
        let mut id = None;
        let mut columns = BTreeMap::new();
        let mut json = JsonAttributes::new();
        for index in 0..statement.column_count() {
            let name = statement.column_name(index)?.to_string();
            let value = row.get_ref(index)?;
            if name == "id" {
                id = Some(row.get::<_, i64>(index)?);
            } else if name == JSON_COLUMN {
                if let Some(text) = row.get::<_, Option<String>>(index)? {
                    json = JsonAttributes::parse(&text).unwrap_or_else(|e| {
                        warn!("Dropping unreadable JSON attributes on {}: {}", self.name, e);
                        JsonAttributes::new()
                    });
                }
            } else {
                columns.insert(name, AttributeValue::from_db(value));
            }
        }
        let id = id.ok_or(rusqlite::Error::InvalidColumnName("id".to_string()))?;
        Ok(Arc::new(GenericItem::new(self.id, id, columns, json)))
    }

    fn insert(&self, conn: &Connection, item: &ItemRef) -> Result<()> {
        let generic = downcast_item::<GenericItem>(item).ok_or_else(|| {
            GlodaError::InvalidInput(format!("item {} is not a {}", item.id(), self.name))
        })?;

        let mut names = Vec::with_capacity(self.table.columns.len());
        let mut values: Vec<Value> = Vec::with_capacity(self.table.columns.len());
        for column in &self.table.columns {
            let value = if column.name == "id" {
                Value::Integer(item.id())
            } else if column.name == JSON_COLUMN {
                let json = generic.json_attributes().unwrap_or_default();
                if json.is_empty() {
                    Value::Null
                } else {
                    Value::Text(json.to_json()?)
                }
            } else {
                match generic.column_value(&column.name) {
                    Some(AttributeValue::Null) | None => Value::Null,
                    Some(value) => value.to_db_value()?,
                }
            };
            names.push(column.name.as_str());
            values.push(value);
        }

        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table.name,
            names.join(", "),
            placeholders.join(", ")
        );
        conn.prepare_cached(&sql)?.execute(params_from_iter(values))?;
        Ok(())
    }
}

/// An instance of a runtime-registered noun.
#[derive(Debug)]
pub struct GenericItem {
    noun: NounId,
    id: i64,
    columns: RwLock<BTreeMap<String, AttributeValue>>,
    json: RwLock<JsonAttributes>,
    state: ItemState,
}

impl GenericItem {
    pub fn new(
        noun: NounId,
        id: i64,
        columns: BTreeMap<String, AttributeValue>,
        json: JsonAttributes,
    ) -> Self {
        Self {
            noun,
            id,
            columns: RwLock::new(columns),
            json: RwLock::new(json),
            state: ItemState::new(),
        }
    }

    pub fn set_column(&self, column: &str, value: AttributeValue) {
        if let Ok(mut columns) = self.columns.write() {
            columns.insert(column.to_string(), value);
        }
    }

    pub fn set_json_attribute(&self, attribute_id: i64, value: AttributeValue) {
        if let Ok(mut json) = self.json.write() {
            json.insert(attribute_id, value);
        }
    }
}

impl GlodaItem for GenericItem {
    fn noun_id(&self) -> NounId {
        self.noun
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn column_value(&self, column: &str) -> Option<AttributeValue> {
        if column == "id" {
            return Some(AttributeValue::Int(self.id));
        }
        self.columns.read().ok()?.get(column).cloned()
    }

    fn json_attributes(&self) -> Option<JsonAttributes> {
        self.json.read().ok().map(|json| json.clone())
    }

    fn set_json_attributes(&self, attributes: JsonAttributes) {
        if let Ok(mut json) = self.json.write() {
            *json = attributes;
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

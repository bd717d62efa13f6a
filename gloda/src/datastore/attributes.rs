//! Attribute definitions and attribute rows

use rusqlite::params;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::adapters::sqlite::{prepare, ManagedId, Pending, SqlExecutor};
use crate::datastore::Datastore;
use crate::nouns::{AttributeBinder, AttributeDef, AttributeSpec, NounRegistry};
use crate::types::{
    AttributeDbDef, AttributeType, AttributeValue, GlodaError, NounId, Result,
};

/// One `(owner, attribute, value)` tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRow {
    pub attribute_id: i64,
    pub value: AttributeValue,
}

impl AttributeRow {
    pub fn new(attribute_id: i64, value: impl Into<AttributeValue>) -> Self {
        Self {
            attribute_id,
            value: value.into(),
        }
    }
}

/// Definition rows by compound name, and every id handed out for them.
pub struct AttributeStore {
    executor: Arc<SqlExecutor>,
    registry: Arc<RwLock<NounRegistry>>,
    ids: ManagedId,
    by_compound: RwLock<HashMap<String, Arc<AttributeDbDef>>>,
    by_id: RwLock<HashMap<i64, (Arc<AttributeDbDef>, Option<String>)>>,
}

impl AttributeStore {
    /// Reads every definition row synchronously.
    pub fn load(
        executor: Arc<SqlExecutor>,
        registry: Arc<RwLock<NounRegistry>>,
        ids: ManagedId,
    ) -> Result<Self> {
        let rows = executor.execute_sync(|conn| {
            let mut stmt = prepare(
                conn,
                "SELECT id, attributeType, extensionName, name, parameter FROM attributeDefinitions",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut by_compound: HashMap<String, Arc<AttributeDbDef>> = HashMap::new();
        let mut by_id = HashMap::new();
        for (id, attribute_type, extension, name, parameter) in rows {
            let db = by_compound
                .entry(crate::types::compound_name(&extension, &name))
                .or_insert_with(|| {
                    Arc::new(AttributeDbDef::new(
                        AttributeType::from_db(attribute_type),
                        &extension,
                        &name,
                    ))
                })
                .clone();
            match &parameter {
                None => db.set_primary_id(id),
                Some(parameter) => db.add_binding(parameter, id),
            }
            by_id.insert(id, (db, parameter));
        }
        debug!("Loaded {} attribute definition rows", by_id.len());

        Ok(Self {
            executor,
            registry,
            ids,
            by_compound: RwLock::new(by_compound),
            by_id: RwLock::new(by_id),
        })
    }

    fn insert_definition(&self, db: &AttributeDbDef, id: i64, parameter: Option<&str>) {
        let attribute_type = db.attribute_type.to_db();
        let extension = db.extension.clone();
        let name = db.name.clone();
        let parameter = parameter.map(str::to_string);
        drop(self.executor.execute_async(move |conn| {
            prepare(
                conn,
                "INSERT INTO attributeDefinitions (id, attributeType, extensionName, name, parameter) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![id, attribute_type, extension, name, parameter])?;
            Ok(())
        }));
    }

    /// Registers an attribute, creating its definition row on first use.
    pub fn define(&self, spec: AttributeSpec) -> Result<Arc<AttributeDef>> {
        let compound = spec.compound_name();
        let db = {
            let mut by_compound = self
                .by_compound
                .write()
                .map_err(|_| GlodaError::Other("attribute map lock poisoned".into()))?;
            by_compound
                .entry(compound.clone())
                .or_insert_with(|| {
                    Arc::new(AttributeDbDef::new(spec.attribute_type, &spec.extension, &spec.name))
                })
                .clone()
        };

        let id = match db.primary_id() {
            Some(id) => id,
            None => {
                let id = self.ids.allocate();
                db.set_primary_id(id);
                self.insert_definition(&db, id, None);
                if let Ok(mut by_id) = self.by_id.write() {
                    by_id.insert(id, (db.clone(), None));
                }
                debug!("Created attribute definition {} as {}", compound, id);
                id
            }
        };

        let attribute = Arc::new(AttributeDef::new(spec, db, id));
        self.registry
            .write()
            .map_err(|_| GlodaError::Other("noun registry lock poisoned".into()))?
            .add_attribute(attribute.clone());
        Ok(attribute)
    }

    pub fn db_def(&self, compound_name: &str) -> Option<Arc<AttributeDbDef>> {
        self.by_compound.read().ok()?.get(compound_name).cloned()
    }

    /// Number of definition rows, bindings included.
    pub fn len(&self) -> usize {
        self.by_id.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttributeBinder for AttributeStore {
    fn bind_parameter(&self, attribute: &AttributeDef, parameter: Option<&str>) -> Result<i64> {
        let Some(parameter) = parameter else {
            return Ok(attribute.id());
        };
        if let Some(id) = attribute.db.binding(parameter) {
            return Ok(id);
        }
        let id = self.ids.allocate();
        attribute.db.add_binding(parameter, id);
        if let Ok(mut by_id) = self.by_id.write() {
            by_id.insert(id, (attribute.db.clone(), Some(parameter.to_string())));
        }
        self.insert_definition(&attribute.db, id, Some(parameter));
        debug!(
            "Bound {} parameter {} to {}",
            attribute.compound_name(),
            parameter,
            id
        );
        Ok(id)
    }

    fn attribute_for_id(&self, id: i64) -> Option<(Arc<AttributeDef>, Option<String>)> {
        let (db, parameter) = self.by_id.read().ok()?.get(&id).cloned()?;
        let attribute = self.registry.read().ok()?.attribute(&db.compound_name())?;
        Some((attribute, parameter))
    }
}

fn bind_rows(rows: &[AttributeRow]) -> Result<Vec<(i64, rusqlite::types::Value)>> {
    rows.iter()
        .map(|row| Ok((row.attribute_id, row.value.to_db_value()?)))
        .collect()
}

impl Datastore {
    /// Registers an attribute on a noun.
    pub fn define_attribute(&self, spec: AttributeSpec) -> Result<Arc<AttributeDef>> {
        self.check_open()?;
        if !self.registry()?.has_noun(spec.subject_noun) {
            return Err(GlodaError::UnknownNoun(spec.subject_noun));
        }
        self.attributes.define(spec)
    }

    pub fn attribute(&self, noun: NounId, bound_name: &str) -> Result<Arc<AttributeDef>> {
        self.registry()?.attribute_by_bound_name(noun, bound_name)
    }

    /// Attribute id rows of `attribute` are stored under for `parameter`.
    pub fn bind_parameter(&self, attribute: &AttributeDef, parameter: Option<&str>) -> Result<i64> {
        self.attributes.bind_parameter(attribute, parameter)
    }

    /// Adds and removes message attribute rows in one transaction. Null
    /// values are stored as the sentinel 0.
    pub fn adjust_message_attributes(
        &self,
        message_id: i64,
        conversation_id: i64,
        add: &[AttributeRow],
        remove: &[AttributeRow],
    ) -> Result<Pending<()>> {
        self.check_open()?;
        let add = bind_rows(add)?;
        let remove = bind_rows(remove)?;

        self.begin_transaction();
        drop(self.executor.execute_async(move |conn| {
            for (attribute_id, value) in &add {
                prepare(
                    conn,
                    "INSERT INTO messageAttributes (conversationID, messageID, attributeID, value) \
                     VALUES (?1, ?2, ?3, ?4)",
                )?
                .execute(params![conversation_id, message_id, attribute_id, value])?;
            }
            for (attribute_id, value) in &remove {
                prepare(
                    conn,
                    "DELETE FROM messageAttributes WHERE attributeID = ?1 AND value = ?2 \
                     AND conversationID = ?3 AND messageID = ?4",
                )?
                .execute(params![attribute_id, value, conversation_id, message_id])?;
            }
            Ok(())
        }));
        Ok(self.commit_transaction())
    }

    pub fn clear_message_attributes(&self, message_id: i64) -> Result<Pending<()>> {
        self.check_open()?;
        Ok(self.executor.execute_async(move |conn| {
            prepare(conn, "DELETE FROM messageAttributes WHERE messageID = ?1")?
                .execute(params![message_id])?;
            Ok(())
        }))
    }

    /// Adds and removes attribute rows of any noun with an attribute table.
    pub fn adjust_attributes(
        &self,
        noun: NounId,
        owner_id: i64,
        add: &[AttributeRow],
        remove: &[AttributeRow],
    ) -> Result<Pending<()>> {
        self.check_open()?;
        let (table, column) = self.attribute_table(noun)?;
        let add = bind_rows(add)?;
        let remove = bind_rows(remove)?;
        let insert_sql = format!(
            "INSERT INTO {} ({}, attributeID, value) VALUES (?1, ?2, ?3)",
            table, column
        );
        let delete_sql = format!(
            "DELETE FROM {} WHERE attributeID = ?1 AND value = ?2 AND {} = ?3",
            table, column
        );

        self.begin_transaction();
        drop(self.executor.execute_async(move |conn| {
            for (attribute_id, value) in &add {
                prepare(conn, &insert_sql)?.execute(params![owner_id, attribute_id, value])?;
            }
            for (attribute_id, value) in &remove {
                prepare(conn, &delete_sql)?.execute(params![attribute_id, value, owner_id])?;
            }
            Ok(())
        }));
        Ok(self.commit_transaction())
    }

    pub fn clear_attributes(&self, noun: NounId, owner_id: i64) -> Result<Pending<()>> {
        self.check_open()?;
        let (table, column) = self.attribute_table(noun)?;
        let sql = format!("DELETE FROM {} WHERE {} = ?1", table, column);
        Ok(self.executor.execute_async(move |conn| {
            prepare(conn, &sql)?.execute(params![owner_id])?;
            Ok(())
        }))
    }

    fn attribute_table(&self, noun: NounId) -> Result<(String, String)> {
        let noun_def = self.registry()?.noun(noun)?;
        match noun_def.attribute_table() {
            Some((table, column)) => Ok((table.to_string(), column.to_string())),
            None => {
                warn!("Noun {} has no attribute table", noun_def.name());
                Err(GlodaError::InvalidInput(format!(
                    "noun {} has no attribute table",
                    noun_def.name()
                )))
            }
        }
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    Fundamental,
    Optimization,
    Derived,
    Explicit,
}

impl AttributeType {
    pub fn to_db(self) -> i64 {
        match self {
            AttributeType::Fundamental => 0,
            AttributeType::Optimization => 1,
            AttributeType::Derived => 2,
            AttributeType::Explicit => 3,
        }
    }

    pub fn from_db(value: i64) -> Self {
        match value {
            1 => AttributeType::Optimization,
            2 => AttributeType::Derived,
            3 => AttributeType::Explicit,
            _ => AttributeType::Fundamental,
        }
    }
}

/// Persistent side of an attribute: the `attributeDefinitions` rows sharing
/// one compound name. The unparameterized row is the primary id; every
/// distinct parameter gets its own row and id.
#[derive(Debug)]
pub struct AttributeDbDef {
    pub attribute_type: AttributeType,
    pub extension: String,
    pub name: String,
    primary_id: Mutex<Option<i64>>,
    bindings: Mutex<HashMap<String, i64>>,
}

impl AttributeDbDef {
    pub fn new(attribute_type: AttributeType, extension: &str, name: &str) -> Self {
        Self {
            attribute_type,
            extension: extension.to_string(),
            name: name.to_string(),
            primary_id: Mutex::new(None),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn compound_name(&self) -> String {
        compound_name(&self.extension, &self.name)
    }

    pub fn primary_id(&self) -> Option<i64> {
        self.primary_id.lock().ok().and_then(|id| *id)
    }

    pub(crate) fn set_primary_id(&self, id: i64) {
        if let Ok(mut slot) = self.primary_id.lock() {
            *slot = Some(id);
        }
    }

    /// Attribute id already bound to `parameter`, if any.
    pub fn binding(&self, parameter: &str) -> Option<i64> {
        self.bindings.lock().ok()?.get(parameter).copied()
    }

    pub(crate) fn add_binding(&self, parameter: &str, id: i64) {
        if let Ok(mut bindings) = self.bindings.lock() {
            bindings.insert(parameter.to_string(), id);
        }
    }

    pub fn bindings(&self) -> HashMap<String, i64> {
        self.bindings
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }
}

pub fn compound_name(extension: &str, name: &str) -> String {
    format!("{}:{}", extension, name)
}

//! Attribute values
//!
//! Every attribute value, whether stored in an attribute table row or in a
//! noun's JSON attribute blob, goes through `AttributeValue`. The JSON blob is
//! keyed by attribute definition id and serialized by `JsonAttributes`, the
//! one place that knows its layout.

use rusqlite::types::{Value, ValueRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::types::error::{GlodaError, Result};
use crate::types::NounId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AttributeValue {
    Null,
    Int(i64),
    Double(f64),
    Str(String),
    Ref { noun: NounId, id: i64 },
    List(Vec<AttributeValue>),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Integer view of the value. References yield their target id and
    /// integral doubles are narrowed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            AttributeValue::Ref { id, .. } => Some(*id),
            AttributeValue::Double(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(v) => Some(*v as f64),
            AttributeValue::Double(v) => Some(*v),
            AttributeValue::Ref { id, .. } => Some(*id as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Ids this value points at when interpreted as a reference (or list of
    /// references) to rows of another noun.
    pub fn referenced_ids(&self) -> Vec<i64> {
        match self {
            AttributeValue::List(values) => values.iter().flat_map(|v| v.referenced_ids()).collect(),
            other => other.as_i64().into_iter().collect(),
        }
    }

    /// Value bound into an attribute table row.
    ///
    /// `Null` is stored as the sentinel `0`; attribute tables never hold SQL
    /// NULL. The encoding is lossy for attributes whose domain includes 0.
    pub fn to_db_value(&self) -> Result<Value> {
        match self {
            AttributeValue::Null => Ok(Value::Integer(0)),
            AttributeValue::Int(v) => Ok(Value::Integer(*v)),
            AttributeValue::Double(v) => match self.as_i64() {
                Some(i) => Ok(Value::Integer(i)),
                None => Ok(Value::Real(*v)),
            },
            AttributeValue::Str(s) => Ok(Value::Text(s.clone())),
            AttributeValue::Ref { id, .. } => Ok(Value::Integer(*id)),
            AttributeValue::List(_) => Err(GlodaError::InvalidInput(
                "list values must be expanded into one attribute row per element".into(),
            )),
        }
    }

    /// Literal form used when a value is inlined into generated SQL.
    /// Returns `None` for values that have no literal form.
    pub fn to_sql_literal(&self) -> Option<String> {
        match self {
            AttributeValue::Null | AttributeValue::List(_) => None,
            AttributeValue::Int(v) => Some(v.to_string()),
            AttributeValue::Double(v) => Some(match self.as_i64() {
                Some(i) => i.to_string(),
                None => v.to_string(),
            }),
            AttributeValue::Str(s) => Some(quote_sql_string(s)),
            AttributeValue::Ref { id, .. } => Some(id.to_string()),
        }
    }

    pub fn from_db(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => AttributeValue::Null,
            ValueRef::Integer(v) => AttributeValue::Int(v),
            ValueRef::Real(v) => AttributeValue::Double(v),
            ValueRef::Text(t) => AttributeValue::Str(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => AttributeValue::Str(String::from_utf8_lossy(b).into_owned()),
        }
    }

    /// Ordering used by in-memory query tests: numbers compare numerically
    /// (references by id), strings lexically, anything else is unordered.
    pub fn compare(&self, other: &AttributeValue) -> Option<Ordering> {
        match (self, other) {
            (AttributeValue::Str(a), AttributeValue::Str(b)) => Some(a.cmp(b)),
            (AttributeValue::Null, AttributeValue::Null) => Some(Ordering::Equal),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    pub fn matches(&self, other: &AttributeValue) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Double(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Str(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Str(v)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(AttributeValue::Null)
    }
}

/// Quotes a string for inlining into SQL by doubling embedded quotes.
pub fn quote_sql_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Escapes `%`, `_` and the escape character itself for a LIKE pattern
/// evaluated with `ESCAPE '<escape>'`.
pub fn escape_like(s: &str, escape: char) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '%' || c == '_' || c == escape {
            out.push(escape);
        }
        out.push(c);
    }
    out
}

/// The `jsonAttributes` blob of a noun row: attribute definition id to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonAttributes(BTreeMap<i64, AttributeValue>);

impl JsonAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn insert(&mut self, attribute_id: i64, value: AttributeValue) {
        self.0.insert(attribute_id, value);
    }

    pub fn get(&self, attribute_id: i64) -> Option<&AttributeValue> {
        self.0.get(&attribute_id)
    }

    pub fn remove(&mut self, attribute_id: i64) -> Option<AttributeValue> {
        self.0.remove(&attribute_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &AttributeValue)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_binds_as_zero_sentinel() {
        assert_eq!(AttributeValue::Null.to_db_value().unwrap(), Value::Integer(0));
        assert_eq!(AttributeValue::Int(0).to_db_value().unwrap(), Value::Integer(0));
    }

    #[test]
    fn test_integral_doubles_bind_as_integers() {
        assert_eq!(AttributeValue::Double(3.0).to_db_value().unwrap(), Value::Integer(3));
        assert_eq!(AttributeValue::Double(3.5).to_db_value().unwrap(), Value::Real(3.5));
        assert!(AttributeValue::List(vec![]).to_db_value().is_err());
    }

    #[test]
    fn test_sql_literals() {
        assert_eq!(AttributeValue::from("O'Brien").to_sql_literal().unwrap(), "'O''Brien'");
        assert_eq!(AttributeValue::Ref { noun: 104, id: 9 }.to_sql_literal().unwrap(), "9");
        assert_eq!(AttributeValue::Null.to_sql_literal(), None);
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("100%_a/b", '/'), "100/%/_a//b");
    }

    #[test]
    fn test_referenced_ids_flatten_lists() {
        let value = AttributeValue::List(vec![
            AttributeValue::Ref { noun: 104, id: 3 },
            AttributeValue::Int(5),
            AttributeValue::Str("x".into()),
        ]);
        assert_eq!(value.referenced_ids(), vec![3, 5]);
    }

    #[test]
    fn test_json_attributes_keyed_by_attribute_id() {
        let mut attrs = JsonAttributes::new();
        attrs.insert(33, AttributeValue::Int(1));
        attrs.insert(40, AttributeValue::Ref { noun: 104, id: 2 });
        let json = attrs.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"33":{"type":"int","value":1},"40":{"type":"ref","value":{"noun":104,"id":2}}}"#
        );
        assert_eq!(JsonAttributes::parse(&json).unwrap(), attrs);
    }

    #[test]
    fn test_compare_mixes_numeric_kinds() {
        assert!(AttributeValue::Int(2).matches(&AttributeValue::Double(2.0)));
        assert!(AttributeValue::Ref { noun: 101, id: 7 }.matches(&AttributeValue::Int(7)));
        assert_eq!(
            AttributeValue::from("a").compare(&AttributeValue::from("b")),
            Some(Ordering::Less)
        );
        assert_eq!(AttributeValue::from("a").compare(&AttributeValue::Int(1)), None);
    }
}

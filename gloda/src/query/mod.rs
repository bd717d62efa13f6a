//! Query model
//!
//! A query targets one noun and holds OR-ed unions of AND-ed constraints.
//! `translator` turns it into SQL, `resolver` runs it and dereferences the
//! results. `Query::test` evaluates the same constraints against an item in
//! memory so live collections can pick up new and modified items.

pub mod resolver;
pub mod translator;

use std::sync::Arc;

use crate::nouns::{AttributeDef, SpecialKind};
use crate::types::{AttributeValue, ItemRef, NounId};

pub use resolver::{QueryResolver, ResolveContext};
pub use translator::{translate, TranslatedQuery};

/// One piece of a LIKE pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum LikePart {
    Literal(String),
    Wildcard,
}

#[derive(Debug, Clone)]
pub enum Constraint {
    IdIn(Vec<i64>),
    In {
        attribute: Arc<AttributeDef>,
        values: Vec<AttributeValue>,
    },
    /// Each range is `(lower, upper)`; a missing bound is open.
    Ranges {
        attribute: Arc<AttributeDef>,
        ranges: Vec<(Option<AttributeValue>, Option<AttributeValue>)>,
    },
    Equals {
        attribute: Arc<AttributeDef>,
        values: Vec<AttributeValue>,
    },
    StringLike {
        attribute: Arc<AttributeDef>,
        parts: Vec<LikePart>,
    },
    Fulltext {
        attribute: Arc<AttributeDef>,
        text: String,
    },
}

impl Constraint {
    pub fn attribute(&self) -> Option<&Arc<AttributeDef>> {
        match self {
            Constraint::IdIn(_) => None,
            Constraint::In { attribute, .. }
            | Constraint::Ranges { attribute, .. }
            | Constraint::Equals { attribute, .. }
            | Constraint::StringLike { attribute, .. }
            | Constraint::Fulltext { attribute, .. } => Some(attribute),
        }
    }

    /// Whether the constraint reads a column of the noun's own table.
    pub fn is_special(&self) -> bool {
        self.attribute().map(|a| a.is_special()).unwrap_or(false)
    }

    pub fn matches(&self, item: &ItemRef) -> bool {
        match self {
            Constraint::IdIn(ids) => ids.contains(&item.id()),
            Constraint::In { attribute, values } => {
                let actual = item_values(item, attribute);
                if values.iter().any(AttributeValue::is_null)
                    && attribute.empty_set_is_significant()
                    && actual.is_empty()
                {
                    return true;
                }
                values
                    .iter()
                    .any(|wanted| actual.iter().any(|value| value.matches(wanted)))
            }
            Constraint::Equals { attribute, values } => {
                let actual = item_values(item, attribute);
                values
                    .iter()
                    .any(|wanted| actual.iter().any(|value| value.matches(wanted)))
            }
            Constraint::Ranges { attribute, ranges } => {
                let actual = item_values(item, attribute);
                actual.iter().any(|value| {
                    ranges
                        .iter()
                        .any(|(lower, upper)| in_range(value, lower.as_ref(), upper.as_ref()))
                })
            }
            Constraint::StringLike { attribute, parts } => item_values(item, attribute)
                .iter()
                .filter_map(AttributeValue::as_str)
                .any(|value| like_matches(value, parts)),
            // full-text matching needs the index
            Constraint::Fulltext { .. } => false,
        }
    }
}

fn in_range(
    value: &AttributeValue,
    lower: Option<&AttributeValue>,
    upper: Option<&AttributeValue>,
) -> bool {
    use std::cmp::Ordering;
    let above = lower.map_or(true, |l| {
        matches!(value.compare(l), Some(Ordering::Greater | Ordering::Equal))
    });
    let below = upper.map_or(true, |u| {
        matches!(value.compare(u), Some(Ordering::Less | Ordering::Equal))
    });
    above && below
}

/// Case-insensitive LIKE evaluation over literal and wildcard parts.
fn like_matches(value: &str, parts: &[LikePart]) -> bool {
    fn go(value: &str, parts: &[LikePart]) -> bool {
        match parts.split_first() {
            None => value.is_empty(),
            Some((LikePart::Literal(literal), rest)) => value
                .strip_prefix(literal.as_str())
                .map_or(false, |remaining| go(remaining, rest)),
            Some((LikePart::Wildcard, rest)) => value
                .char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(value.len()))
                .any(|i| go(&value[i..], rest)),
        }
    }
    let lowered: Vec<LikePart> = parts
        .iter()
        .map(|part| match part {
            LikePart::Literal(s) => LikePart::Literal(s.to_lowercase()),
            LikePart::Wildcard => LikePart::Wildcard,
        })
        .collect();
    go(&value.to_lowercase(), &lowered)
}

/// Values an item currently has for an attribute: the backing column for
/// special attributes, the JSON blob entry otherwise.
fn item_values(item: &ItemRef, attribute: &AttributeDef) -> Vec<AttributeValue> {
    let value = match attribute.special() {
        Some(SpecialKind::Column | SpecialKind::String | SpecialKind::Parent) => {
            item.column_value(attribute.value_column())
        }
        Some(SpecialKind::Children | SpecialKind::Fulltext) => None,
        None => item
            .json_attributes()
            .and_then(|json| json.get(attribute.id()).cloned()),
    };
    match value {
        None | Some(AttributeValue::Null) => Vec::new(),
        Some(AttributeValue::List(values)) if !attribute.singular() => values,
        Some(value) => vec![value],
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub no_validity_constraints: bool,
    /// Skip the noun's join magic; only the main table's columns are
    /// selected.
    pub no_magic: bool,
    /// Replaces the generated SQL entirely.
    pub explicit_sql: Option<String>,
    /// Extra expressions selected around the generated SQL.
    pub outer_wrap_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Normal,
    /// Built from explicit SQL; its constraints cannot be tested in memory.
    Explicit,
    /// Matches nothing and never runs.
    Null,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub noun: NounId,
    pub unions: Vec<Vec<Constraint>>,
    /// Column names, a leading `-` sorts descending.
    pub order: Vec<String>,
    pub limit: Option<u32>,
    pub options: QueryOptions,
    pub kind: QueryKind,
}

impl Query {
    pub fn new(noun: NounId) -> Self {
        Self {
            noun,
            unions: vec![Vec::new()],
            order: Vec::new(),
            limit: None,
            options: QueryOptions::default(),
            kind: QueryKind::Normal,
        }
    }

    pub fn null(noun: NounId) -> Self {
        Self {
            kind: QueryKind::Null,
            ..Self::new(noun)
        }
    }

    pub fn explicit(noun: NounId, sql: &str) -> Self {
        let mut query = Self::new(noun);
        query.kind = QueryKind::Explicit;
        query.options.explicit_sql = Some(sql.to_string());
        query
    }

    pub fn id_in(noun: NounId, ids: Vec<i64>) -> Self {
        Self::new(noun).constrain(Constraint::IdIn(ids))
    }

    /// Adds a constraint to the current union.
    pub fn constrain(mut self, constraint: Constraint) -> Self {
        if let Some(current) = self.unions.last_mut() {
            current.push(constraint);
        } else {
            self.unions.push(vec![constraint]);
        }
        self
    }

    /// Starts a new union; later constraints are OR-ed with earlier ones.
    pub fn or(mut self) -> Self {
        self.unions.push(Vec::new());
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order.push(column.to_string());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Unions that carry at least one constraint.
    pub fn constrained_unions(&self) -> impl Iterator<Item = &Vec<Constraint>> {
        self.unions.iter().filter(|u| !u.is_empty())
    }

    /// Whether the query is frozen: its result set never changes after it
    /// completes.
    pub fn is_frozen(&self) -> bool {
        self.kind != QueryKind::Normal
    }

    pub fn test(&self, item: &ItemRef) -> bool {
        if self.kind != QueryKind::Normal || item.noun_id() != self.noun {
            return false;
        }
        let mut unions = self.constrained_unions().peekable();
        if unions.peek().is_none() {
            return true;
        }
        unions.any(|union| union.iter().all(|c| c.matches(item)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nouns::AttributeSpec;
    use crate::types::{
        AttributeDbDef, ContactData, GlodaContact, JsonAttributes, NOUN_CONTACT, NOUN_NUMBER,
        NOUN_STRING,
    };

    fn attribute(spec: AttributeSpec, id: i64) -> Arc<AttributeDef> {
        let db = Arc::new(AttributeDbDef::new(spec.attribute_type, &spec.extension, &spec.name));
        Arc::new(AttributeDef::new(spec, db, id))
    }

    fn contact(id: i64, name: &str, popularity: i64, json: JsonAttributes) -> ItemRef {
        Arc::new(GlodaContact::new(
            id,
            ContactData {
                name: name.to_string(),
                popularity,
                json_attributes: json,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_special_column_constraints() {
        let popularity = attribute(
            AttributeSpec::new("core", "popularity", NOUN_CONTACT, NOUN_NUMBER)
                .special(SpecialKind::Column, "popularity"),
            40,
        );
        let item = contact(3, "Ada", 12, JsonAttributes::new());

        let ranged = Query::new(NOUN_CONTACT).constrain(Constraint::Ranges {
            attribute: popularity.clone(),
            ranges: vec![(Some(AttributeValue::Int(10)), None)],
        });
        assert!(ranged.test(&item));

        let equals = Query::new(NOUN_CONTACT).constrain(Constraint::Equals {
            attribute: popularity,
            values: vec![AttributeValue::Int(11)],
        });
        assert!(!equals.test(&item));
    }

    #[test]
    fn test_unions_are_ored() {
        let query = Query::id_in(NOUN_CONTACT, vec![1]).or().constrain(Constraint::IdIn(vec![3]));
        assert!(query.test(&contact(3, "Ada", 0, JsonAttributes::new())));
        assert!(!query.test(&contact(4, "Bob", 0, JsonAttributes::new())));
    }

    #[test]
    fn test_json_attributes_and_like() {
        let nickname = attribute(
            AttributeSpec::new("ext", "nickname", NOUN_CONTACT, NOUN_STRING),
            50,
        );
        let mut json = JsonAttributes::new();
        json.insert(50, AttributeValue::from("Countess Lovelace"));
        let item = contact(3, "Ada", 0, json);

        let like = Query::new(NOUN_CONTACT).constrain(Constraint::StringLike {
            attribute: nickname.clone(),
            parts: vec![LikePart::Wildcard, LikePart::Literal("love".into()), LikePart::Wildcard],
        });
        assert!(like.test(&item));

        let within = Query::new(NOUN_CONTACT).constrain(Constraint::In {
            attribute: nickname,
            values: vec!["Someone else".into()],
        });
        assert!(!within.test(&item));
    }

    #[test]
    fn test_explicit_and_null_queries_never_match() {
        let item = contact(1, "Ada", 0, JsonAttributes::new());
        assert!(Query::new(NOUN_CONTACT).test(&item));
        assert!(!Query::null(NOUN_CONTACT).test(&item));
        assert!(!Query::explicit(NOUN_CONTACT, "SELECT * FROM contacts").test(&item));
        assert!(Query::null(NOUN_CONTACT).is_frozen());
    }
}

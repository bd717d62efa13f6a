//! Query to SQL translation
//!
//! Each union becomes `id IN (s1 INTERSECT s2 ...)` followed by the noun's
//! validity suffix, and the unions are OR-ed in the outer WHERE. Adjacent
//! constraints on the noun's own columns share one sub-select; constraints
//! on the attribute table each get their own.

use rusqlite::types::Value;
use tracing::{debug, warn};

use crate::nouns::{AttributeBinder, AttributeDef, NounRegistry};
use crate::query::{Constraint, LikePart, Query};
use crate::types::{escape_like, AttributeValue, GlodaError, Result};

/// Attribute id the empty-set marker rows are stored under.
pub const EMPTY_SET_ATTR_ID: i64 = 1;

const LIKE_ESCAPE: char = '/';

#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedQuery {
    pub sql: String,
    pub args: Vec<Value>,
}

/// Output of a single constraint.
enum Piece {
    /// A complete sub-select that nothing may be merged into.
    Select(String),
    /// A WHERE test against the main table (`special`) or the attribute
    /// table.
    Test { test: String, special: bool },
    Nothing,
}

pub fn translate(
    query: &Query,
    registry: &NounRegistry,
    binder: &dyn AttributeBinder,
) -> Result<TranslatedQuery> {
    let noun = registry.noun(query.noun)?;
    let table = noun
        .table_name()
        .ok_or_else(|| GlodaError::InvalidQuery(format!("noun {} has no table", noun.name())))?
        .to_string();

    let validity = if query.options.no_validity_constraints {
        ""
    } else {
        noun.validity_suffix().unwrap_or("")
    };

    let mut args = Vec::new();
    let mut where_clauses = Vec::new();
    for union in query.constrained_unions() {
        let mut selects: Vec<String> = Vec::new();
        let mut last_mergeable = false;

        for constraint in union {
            let piece = match constraint {
                Constraint::IdIn(ids) => {
                    let list = join_ids(ids);
                    if union.len() == 1 {
                        Piece::Select(list)
                    } else {
                        Piece::Select(format!("SELECT id FROM {} WHERE id IN ({})", table, list))
                    }
                }
                Constraint::In { attribute, values } => {
                    translate_in(registry, binder, attribute, values)?
                }
                Constraint::Ranges { attribute, ranges } => {
                    translate_ranges(registry, binder, attribute, ranges)?
                }
                Constraint::Equals { attribute, values } => {
                    translate_equals(registry, binder, attribute, values, &mut args)?
                }
                Constraint::StringLike { attribute, parts } => {
                    translate_like(attribute, parts, &mut args)
                }
                Constraint::Fulltext { attribute, text } => {
                    args.push(Value::Text(text.clone()));
                    Piece::Select(format!(
                        "SELECT docid FROM {}Text WHERE {} MATCH ?",
                        table,
                        attribute.value_column()
                    ))
                }
            };

            match piece {
                Piece::Select(select) => {
                    selects.push(select);
                    last_mergeable = false;
                }
                Piece::Test { test, special: true } => {
                    if last_mergeable {
                        if let Some(last) = selects.last_mut() {
                            last.push_str(" AND ");
                            last.push_str(&test);
                        }
                    } else {
                        selects.push(format!("SELECT id FROM {} WHERE {}", table, test));
                        last_mergeable = true;
                    }
                }
                Piece::Test { test, special: false } => {
                    let (attribute_table, id_column) =
                        noun.attribute_table().ok_or_else(|| {
                            GlodaError::InvalidQuery(format!(
                                "noun {} has no attribute table",
                                noun.name()
                            ))
                        })?;
                    selects.push(format!(
                        "SELECT {} FROM {} WHERE {}",
                        id_column, attribute_table, test
                    ));
                    last_mergeable = false;
                }
                Piece::Nothing => {
                    warn!("Unable to translate constraint: {:?}", constraint);
                }
            }
        }

        if !selects.is_empty() {
            where_clauses.push(format!("id IN ({}){}", selects.join(" INTERSECT "), validity));
        }
    }

    let mut sql = match &query.options.explicit_sql {
        Some(explicit) => {
            args.clear();
            explicit.clone()
        }
        None => {
            let magic = if query.options.no_magic {
                ""
            } else if query.options.no_validity_constraints {
                noun.join_magic_without_validity()
                    .or_else(|| noun.join_magic())
                    .unwrap_or("")
            } else {
                noun.join_magic().unwrap_or("")
            };
            let mut sql = format!("SELECT * FROM {}{}", table, magic);
            if !where_clauses.is_empty() {
                sql.push_str(&format!(" WHERE ({})", where_clauses.join(") OR (")));
            }
            sql
        }
    };

    if !query.options.outer_wrap_columns.is_empty() {
        sql = format!(
            "SELECT *, {} FROM ({})",
            query.options.outer_wrap_columns.join(", "),
            sql
        );
    }

    if !query.order.is_empty() {
        let order: Vec<String> = query
            .order
            .iter()
            .map(|key| match key.strip_prefix('-') {
                Some(column) => format!("{} DESC", column),
                None => format!("{} ASC", key),
            })
            .collect();
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }

    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        args.push(Value::Integer(i64::from(limit)));
    }

    debug!("Translated query: {} with args {:?}", sql, args);
    Ok(TranslatedQuery { sql, args })
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
}

/// Groups values by the attribute id they are stored under. Special
/// attributes have no attribute id.
fn group_values(
    registry: &NounRegistry,
    binder: &dyn AttributeBinder,
    attribute: &AttributeDef,
    values: &[AttributeValue],
) -> Result<Vec<(Option<i64>, Vec<AttributeValue>)>> {
    let mut groups: Vec<(Option<i64>, Vec<AttributeValue>)> = Vec::new();

    let special = attribute.is_special();
    let mut remaining: Vec<&AttributeValue> = values.iter().collect();
    if !special && attribute.empty_set_is_significant() && values.iter().any(|v| v.is_null()) {
        groups.push((Some(EMPTY_SET_ATTR_ID), vec![AttributeValue::Int(attribute.id())]));
        remaining.retain(|v| !v.is_null());
        if remaining.is_empty() {
            return Ok(groups);
        }
    }

    let object_noun = registry.noun(attribute.object_noun()).ok();
    let parameterized = object_noun.as_ref().map_or(false, |n| n.uses_parameter());
    if !parameterized {
        let id = if special { None } else { Some(attribute.id()) };
        groups.push((id, remaining.into_iter().cloned().collect()));
        return Ok(groups);
    }

    let mut current_param: Option<Option<String>> = None;
    for value in remaining {
        let (param, stored) = match &object_noun {
            Some(noun) => noun.to_param_and_value(value),
            None => (None, value.clone()),
        };
        if current_param.as_ref() != Some(&param) {
            let id = binder.bind_parameter(attribute, param.as_deref())?;
            groups.push((Some(id), Vec::new()));
            current_param = Some(param);
        }
        if let Some((_, group)) = groups.last_mut() {
            if !stored.is_null() {
                group.push(stored);
            }
        }
    }
    Ok(groups)
}

/// Inlined literal; attribute tables store null as 0.
fn literal(value: &AttributeValue, special: bool) -> Option<String> {
    match value {
        AttributeValue::Null if !special => Some("0".to_string()),
        other => other.to_sql_literal(),
    }
}

fn bound(value: &AttributeValue, special: bool) -> Result<Value> {
    match value {
        AttributeValue::Null if special => Ok(Value::Null),
        other => other.to_db_value(),
    }
}

fn translate_in(
    registry: &NounRegistry,
    binder: &dyn AttributeBinder,
    attribute: &AttributeDef,
    values: &[AttributeValue],
) -> Result<Piece> {
    let special = attribute.is_special();
    let column = attribute.value_column();
    let mut clauses = Vec::new();
    for (attribute_id, group) in group_values(registry, binder, attribute, values)? {
        let literals: Vec<String> = group.iter().filter_map(|v| literal(v, special)).collect();
        match attribute_id {
            Some(id) if !special => {
                if literals.is_empty() {
                    clauses.push(format!("(attributeID = {})", id));
                } else {
                    clauses.push(format!(
                        "(attributeID = {} AND {} IN ({}))",
                        id,
                        column,
                        literals.join(",")
                    ));
                }
            }
            _ => {
                if !literals.is_empty() {
                    clauses.push(format!("({} IN ({}))", column, literals.join(",")));
                }
            }
        }
    }
    Ok(test_piece(clauses, special))
}

fn translate_ranges(
    registry: &NounRegistry,
    binder: &dyn AttributeBinder,
    attribute: &AttributeDef,
    ranges: &[(Option<AttributeValue>, Option<AttributeValue>)],
) -> Result<Piece> {
    let special = attribute.is_special();
    let column = attribute.value_column();
    let object_noun = registry.noun(attribute.object_noun()).ok();
    let parameterized = object_noun.as_ref().map_or(false, |n| n.uses_parameter());

    // (attribute id, range tests) in the order first seen
    let mut groups: Vec<(Option<i64>, Vec<String>)> = Vec::new();
    for (lower, upper) in ranges {
        let split = |value: &Option<AttributeValue>| -> (Option<String>, Option<AttributeValue>) {
            match (value, &object_noun) {
                (Some(v), Some(noun)) if parameterized => {
                    let (param, stored) = noun.to_param_and_value(v);
                    (param, Some(stored))
                }
                (v, _) => (None, v.clone()),
            }
        };
        let (lower_param, lower) = split(lower);
        let (upper_param, upper) = split(upper);

        let attribute_id = if special {
            None
        } else if parameterized {
            let param = lower_param.or(upper_param);
            Some(binder.bind_parameter(attribute, param.as_deref())?)
        } else {
            Some(attribute.id())
        };

        let lower = lower.as_ref().and_then(|v| literal(v, special));
        let upper = upper.as_ref().and_then(|v| literal(v, special));
        let test = match (lower, upper) {
            (None, None) => continue,
            (None, Some(u)) => format!("{} <= {}", column, u),
            (Some(l), None) => format!("{} >= {}", column, l),
            (Some(l), Some(u)) => format!("{} BETWEEN {} AND {}", column, l, u),
        };

        match groups.last_mut() {
            Some((id, tests)) if *id == attribute_id => tests.push(test),
            _ => groups.push((attribute_id, vec![test])),
        }
    }

    let clauses = groups
        .into_iter()
        .map(|(attribute_id, tests)| match attribute_id {
            Some(id) => format!("(attributeID = {} AND ({}))", id, tests.join(" OR ")),
            None => format!("({})", tests.join(" OR ")),
        })
        .collect();
    Ok(test_piece(clauses, special))
}

fn translate_equals(
    registry: &NounRegistry,
    binder: &dyn AttributeBinder,
    attribute: &AttributeDef,
    values: &[AttributeValue],
    args: &mut Vec<Value>,
) -> Result<Piece> {
    let special = attribute.is_special();
    let column = attribute.value_column();
    let mut clauses = Vec::new();
    for (attribute_id, group) in group_values(registry, binder, attribute, values)? {
        let mut tests = Vec::with_capacity(group.len());
        for value in &group {
            args.push(bound(value, special)?);
            tests.push(format!("{} = ?", column));
        }
        match attribute_id {
            Some(id) if !special => {
                if tests.is_empty() {
                    clauses.push(format!("(attributeID = {})", id));
                } else {
                    clauses.push(format!("(attributeID = {} AND ({}))", id, tests.join(" OR ")));
                }
            }
            _ if !tests.is_empty() => clauses.push(format!("({})", tests.join(" OR "))),
            _ => {}
        }
    }
    Ok(test_piece(clauses, special))
}

fn translate_like(attribute: &AttributeDef, parts: &[LikePart], args: &mut Vec<Value>) -> Piece {
    let pattern: String = parts
        .iter()
        .map(|part| match part {
            LikePart::Literal(text) => escape_like(text, LIKE_ESCAPE),
            LikePart::Wildcard => "%".to_string(),
        })
        .collect();
    args.push(Value::Text(pattern));

    let test = format!("{} LIKE ? ESCAPE '{}'", attribute.value_column(), LIKE_ESCAPE);
    if attribute.is_special() {
        Piece::Test { test, special: true }
    } else {
        Piece::Test {
            test: format!("(attributeID = {} AND {})", attribute.id(), test),
            special: false,
        }
    }
}

fn test_piece(clauses: Vec<String>, special: bool) -> Piece {
    if clauses.is_empty() {
        Piece::Nothing
    } else {
        Piece::Test {
            test: clauses.join(" OR "),
            special,
        }
    }
}

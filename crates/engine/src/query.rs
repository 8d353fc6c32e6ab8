//! Structural predicates over firework specs, used by workers to select
//! which READY fireworks they accept.
//!
//! The language is the Mongo-style subset FireWorks queries use:
//!
//! - `{}` matches everything;
//! - `{"path": value}` is implicit equality (an array field also matches
//!   when it contains `value`);
//! - `{"path": {"$op": operand, ...}}` with `$eq $ne $in $nin $exists $gt
//!   $gte $lt $lte`;
//! - top-level `$and` / `$or` over lists of sub-queries.
//!
//! Paths are dotted; a leading `spec.` is accepted and ignored so that
//! queries written against whole firework documents keep working.

use std::cmp::Ordering;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use tasks::Spec;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("unknown query operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{op}' expects {expected}")]
    BadOperand { op: String, expected: &'static str },

    #[error("query is not valid JSON: {0}")]
    InvalidJson(String),
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Cmp(Ordering, bool, Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Field { path: Vec<String>, ops: Vec<Op> },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// A parsed worker query. Keeps its source document for persistence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    raw: Spec,
    predicates: Vec<Predicate>,
}

impl Query {
    /// The match-anything query.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn parse(raw: Spec) -> Result<Self, QueryError> {
        let predicates = parse_document(&raw)?;
        Ok(Self { raw, predicates })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, QueryError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::any());
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => Self::parse(map),
            Ok(other) => Err(QueryError::InvalidJson(format!("expected an object, got {other}"))),
            Err(err) => Err(QueryError::InvalidJson(err.to_string())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn raw(&self) -> &Spec {
        &self.raw
    }

    /// Whether `spec` satisfies every top-level clause.
    pub fn matches(&self, spec: &Spec) -> bool {
        self.predicates.iter().all(|p| p.matches(spec))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.raw.clone()))
    }
}

// Persisted as a JSON-encoded string; accepted inline too.
impl Serialize for Query {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Query {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(Query::any()),
            Value::String(raw) => Query::from_json_str(&raw).map_err(de::Error::custom),
            Value::Object(map) => Query::parse(map).map_err(de::Error::custom),
            other => Err(de::Error::custom(format!("invalid query {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_document(doc: &Map<String, Value>) -> Result<Vec<Predicate>, QueryError> {
    doc.iter().map(|(key, value)| parse_clause(key, value)).collect()
}

fn parse_clause(key: &str, value: &Value) -> Result<Predicate, QueryError> {
    match key {
        "$and" | "$or" => {
            let items = value.as_array().ok_or_else(|| QueryError::BadOperand {
                op: key.to_owned(),
                expected: "a list of queries",
            })?;
            let mut subs = Vec::with_capacity(items.len());
            for item in items {
                let doc = item.as_object().ok_or_else(|| QueryError::BadOperand {
                    op: key.to_owned(),
                    expected: "a list of queries",
                })?;
                subs.push(Predicate::And(parse_document(doc)?));
            }
            Ok(if key == "$and" { Predicate::And(subs) } else { Predicate::Or(subs) })
        }
        op if op.starts_with('$') => Err(QueryError::UnknownOperator(op.to_owned())),
        path => Ok(Predicate::Field {
            path: split_path(path),
            ops: parse_ops(value)?,
        }),
    }
}

fn split_path(path: &str) -> Vec<String> {
    let path = path.strip_prefix("spec.").unwrap_or(path);
    path.split('.').map(str::to_owned).collect()
}

fn is_operator_doc(value: &Value) -> bool {
    match value.as_object() {
        Some(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        None => false,
    }
}

fn parse_ops(value: &Value) -> Result<Vec<Op>, QueryError> {
    if !is_operator_doc(value) {
        return Ok(vec![Op::Eq(value.clone())]);
    }
    let mut ops = Vec::new();
    for (op, operand) in value.as_object().into_iter().flatten() {
        let list = || {
            operand.as_array().cloned().ok_or_else(|| QueryError::BadOperand {
                op: op.clone(),
                expected: "a list",
            })
        };
        ops.push(match op.as_str() {
            "$eq" => Op::Eq(operand.clone()),
            "$ne" => Op::Ne(operand.clone()),
            "$in" => Op::In(list()?),
            "$nin" => Op::Nin(list()?),
            "$exists" => Op::Exists(operand.as_bool().ok_or_else(|| QueryError::BadOperand {
                op: op.clone(),
                expected: "a boolean",
            })?),
            "$gt" => Op::Cmp(Ordering::Greater, false, operand.clone()),
            "$gte" => Op::Cmp(Ordering::Greater, true, operand.clone()),
            "$lt" => Op::Cmp(Ordering::Less, false, operand.clone()),
            "$lte" => Op::Cmp(Ordering::Less, true, operand.clone()),
            other => return Err(QueryError::UnknownOperator(other.to_owned())),
        });
    }
    Ok(ops)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn lookup<'a>(spec: &'a Spec, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = spec.get(first)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        Some(value) if value == expected => true,
        Some(Value::Array(items)) => items.contains(expected),
        // `{"path": null}` also matches a missing field.
        None => expected.is_null(),
        _ => false,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

impl Op {
    fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Op::Eq(expected) => equals(field, expected),
            Op::Ne(expected) => !equals(field, expected),
            Op::In(options) => options.iter().any(|o| equals(field, o)),
            Op::Nin(options) => !options.iter().any(|o| equals(field, o)),
            Op::Exists(wanted) => field.is_some() == *wanted,
            Op::Cmp(direction, inclusive, operand) => match field.and_then(|f| compare(f, operand)) {
                Some(Ordering::Equal) => *inclusive,
                Some(ord) => ord == *direction,
                None => false,
            },
        }
    }
}

impl Predicate {
    fn matches(&self, spec: &Spec) -> bool {
        match self {
            Predicate::Field { path, ops } => {
                let field = lookup(spec, path);
                ops.iter().all(|op| op.matches(field))
            }
            Predicate::And(subs) => subs.iter().all(|p| p.matches(spec)),
            Predicate::Or(subs) => subs.iter().any(|p| p.matches(spec)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(value: Value) -> Query {
        Query::parse(value.as_object().unwrap().clone()).unwrap()
    }

    fn spec(value: Value) -> Spec {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn empty_query_matches_anything() {
        assert!(Query::any().matches(&Spec::new()));
        assert!(Query::from_json_str("  ").unwrap().is_empty());
    }

    #[test]
    fn implicit_equality_with_dotted_and_prefixed_paths() {
        let q = query(json!({ "spec.structure.formula": "Fe2O3", "nsites": 5 }));
        assert!(q.matches(&spec(json!({ "structure": { "formula": "Fe2O3" }, "nsites": 5 }))));
        assert!(!q.matches(&spec(json!({ "structure": { "formula": "FeO" }, "nsites": 5 }))));
    }

    #[test]
    fn equality_against_array_means_contains() {
        let q = query(json!({ "tags": "magnetic" }));
        assert!(q.matches(&spec(json!({ "tags": ["bulk", "magnetic"] }))));
        assert!(!q.matches(&spec(json!({ "tags": ["bulk"] }))));
    }

    #[test]
    fn comparison_and_membership_operators() {
        let q = query(json!({ "nsites": { "$gte": 2, "$lt": 10 }, "kind": { "$in": ["a", "b"] } }));
        assert!(q.matches(&spec(json!({ "nsites": 2, "kind": "b" }))));
        assert!(!q.matches(&spec(json!({ "nsites": 10, "kind": "b" }))));
        assert!(!q.matches(&spec(json!({ "nsites": 3, "kind": "c" }))));
        assert!(!q.matches(&spec(json!({ "kind": "a" }))));
    }

    #[test]
    fn exists_and_ne() {
        let q = query(json!({ "gpu": { "$exists": false }, "queue": { "$ne": "debug" } }));
        assert!(q.matches(&spec(json!({ "queue": "normal" }))));
        assert!(q.matches(&spec(json!({}))));
        assert!(!q.matches(&spec(json!({ "gpu": true }))));
        assert!(!q.matches(&spec(json!({ "queue": "debug" }))));
    }

    #[test]
    fn and_or_combinators() {
        let q = query(json!({ "$or": [ { "a": 1 }, { "b": { "$gt": 5 } } ] }));
        assert!(q.matches(&spec(json!({ "a": 1 }))));
        assert!(q.matches(&spec(json!({ "b": 6 }))));
        assert!(!q.matches(&spec(json!({ "a": 2, "b": 5 }))));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = Query::parse(spec(json!({ "a": { "$regex": "x" } }))).unwrap_err();
        assert_eq!(err, QueryError::UnknownOperator("$regex".into()));
    }

    #[test]
    fn persisted_as_string_and_read_back_from_either_form() {
        let q = query(json!({ "a": 1 }));
        let encoded = serde_json::to_value(&q).unwrap();
        assert_eq!(encoded, json!("{\"a\":1}"));

        let from_string: Query = serde_json::from_value(encoded).unwrap();
        let from_object: Query = serde_json::from_value(json!({ "a": 1 })).unwrap();
        assert_eq!(from_string, q);
        assert_eq!(from_object, q);
    }
}

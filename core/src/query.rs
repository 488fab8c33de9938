//! Filter/sort/projection query evaluator.
//!
//! The filter grammar is the subset of Mongo-style query operators named in
//! the operator table below. `sort` and the inclusion/exclusion list for
//! `projection` are plain ordered `Vec`s rather than JSON objects: an
//! object's key order is not part of `serde_json::Value`'s contract (this
//! crate does not enable `serde_json`'s `preserve_order` feature), so
//! left-to-right sort/projection ordering is expressed with a type that
//! actually preserves it.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::document::{get_path, validate_name};
use crate::error::{Result, StoreError};
use crate::serializer::json_equal;

#[derive(Debug, Clone)]
pub enum Operator {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Exists(bool),
    Type(String),
}

#[derive(Debug, Clone)]
pub enum Node {
    Field { path: String, ops: Vec<Operator> },
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

const TYPE_NAMES: &[&str] = &["string", "number", "boolean", "null", "array", "object"];

/// Parse a filter mapping into a predicate tree. Multiple entries at the
/// same object level are implicitly ANDed.
pub fn compile(filter: &Value) -> Result<Node> {
    let obj = filter
        .as_object()
        .ok_or_else(|| StoreError::Validation("filter must be a mapping".into()))?;
    let mut nodes = Vec::with_capacity(obj.len());
    for (key, value) in obj {
        nodes.push(compile_entry(key, value)?);
    }
    Ok(Node::And(nodes))
}

fn compile_entry(key: &str, value: &Value) -> Result<Node> {
    match key {
        "$and" => Ok(Node::And(compile_sub_filters(value)?)),
        "$or" => Ok(Node::Or(compile_sub_filters(value)?)),
        "$not" => Ok(Node::Not(Box::new(compile(value)?))),
        path => {
            let ops = compile_operators(value)?;
            Ok(Node::Field {
                path: path.to_string(),
                ops,
            })
        }
    }
}

fn compile_sub_filters(value: &Value) -> Result<Vec<Node>> {
    let items = value
        .as_array()
        .ok_or_else(|| StoreError::Validation("$and/$or require an array of filters".into()))?;
    items.iter().map(compile).collect()
}

fn is_operator_record(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn compile_operators(value: &Value) -> Result<Vec<Operator>> {
    let Some(map) = value.as_object().filter(|m| is_operator_record(m)) else {
        return Ok(vec![Operator::Eq(value.clone())]);
    };
    let mut ops = Vec::with_capacity(map.len());
    for (op, operand) in map {
        ops.push(match op.as_str() {
            "$eq" => Operator::Eq(operand.clone()),
            "$ne" => Operator::Ne(operand.clone()),
            "$in" => Operator::In(expect_array(operand, "$in")?),
            "$nin" => Operator::Nin(expect_array(operand, "$nin")?),
            "$gt" => Operator::Gt(operand.clone()),
            "$gte" => Operator::Gte(operand.clone()),
            "$lt" => Operator::Lt(operand.clone()),
            "$lte" => Operator::Lte(operand.clone()),
            "$exists" => Operator::Exists(
                operand
                    .as_bool()
                    .ok_or_else(|| StoreError::Validation("$exists requires a boolean".into()))?,
            ),
            "$type" => {
                let name = operand
                    .as_str()
                    .ok_or_else(|| StoreError::Validation("$type requires a string".into()))?;
                if !TYPE_NAMES.contains(&name) {
                    return Err(StoreError::Validation(format!("unknown $type name: {name:?}")));
                }
                Operator::Type(name.to_string())
            }
            other => return Err(StoreError::Validation(format!("unknown operator: {other:?}"))),
        });
    }
    Ok(ops)
}

fn expect_array(value: &Value, op: &str) -> Result<Vec<Value>> {
    value
        .as_array()
        .cloned()
        .ok_or_else(|| StoreError::Validation(format!("{op} requires an array")))
}

pub fn matches(doc: &Value, node: &Node) -> bool {
    match node {
        Node::And(nodes) => nodes.iter().all(|n| matches(doc, n)),
        Node::Or(nodes) => nodes.iter().any(|n| matches(doc, n)),
        Node::Not(inner) => !matches(doc, inner),
        Node::Field { path, ops } => {
            let value = get_path(doc, path);
            ops.iter().all(|op| field_matches(value, op))
        }
    }
}

fn field_matches(value: Option<&Value>, op: &Operator) -> bool {
    match op {
        Operator::Eq(v) => value_eq_match(value, v),
        Operator::Ne(v) => !value_eq_match(value, v),
        Operator::In(list) => list.iter().any(|v| value_eq_match(value, v)),
        Operator::Nin(list) => !list.iter().any(|v| value_eq_match(value, v)),
        Operator::Gt(v) => compare_ranked(value, Some(v)) == Ordering::Greater,
        Operator::Gte(v) => compare_ranked(value, Some(v)) != Ordering::Less,
        Operator::Lt(v) => compare_ranked(value, Some(v)) == Ordering::Less,
        Operator::Lte(v) => compare_ranked(value, Some(v)) != Ordering::Greater,
        Operator::Exists(want) => value.is_some() == *want,
        Operator::Type(name) => value.map(type_name).as_deref() == Some(name.as_str()),
    }
}

/// A missing field is distinct from an explicit `null`; neither ever equals
/// a literal via `$eq`/`$in`, array-valued fields match if any element does.
fn value_eq_match(value: Option<&Value>, operand: &Value) -> bool {
    match value {
        None => false,
        Some(Value::Array(items)) => items.iter().any(|item| json_equal(item, operand)),
        Some(v) => json_equal(v, operand),
    }
}

fn rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Object(_)) | Some(Value::Array(_)) => 5,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Order two optional values per the cross-type precedence ladder:
/// not-present < null < boolean < number < string < object/array.
fn compare_ranked(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::String(x)), Some(Value::String(y))) => x.as_str().cmp(y.as_str()),
        _ => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Default)]
pub enum Projection {
    #[default]
    None,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

fn apply_projection(doc: &Value, projection: &Projection) -> Value {
    match projection {
        Projection::None => doc.clone(),
        Projection::Include(paths) => {
            let mut out = Map::new();
            for path in paths {
                if let Some(v) = get_path(doc, path) {
                    out.insert(path.clone(), v.clone());
                }
            }
            Value::Object(out)
        }
        Projection::Exclude(paths) => {
            let mut out = doc.clone();
            for path in paths {
                remove_path(&mut out, path);
            }
            out
        }
    }
}

fn remove_path(doc: &mut Value, path: &str) {
    let mut segments = path.split('.').peekable();
    let mut cur = doc;
    while let Some(seg) = segments.next() {
        let Some(map) = cur.as_object_mut() else { return };
        if segments.peek().is_none() {
            map.remove(seg);
            return;
        }
        let Some(next) = map.get_mut(seg) else { return };
        cur = next;
    }
}

#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub r#type: Option<String>,
    pub filter: Value,
    pub sort: Vec<(String, i32)>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub projection: Projection,
}

impl QuerySpec {
    pub fn validate(&self) -> Result<()> {
        if !self.filter.is_object() {
            return Err(StoreError::Validation("filter must be a mapping".into()));
        }
        for (path, dir) in &self.sort {
            if *dir != 1 && *dir != -1 {
                return Err(StoreError::Validation(format!(
                    "sort direction for {path:?} must be 1 or -1, got {dir}"
                )));
            }
        }
        if let Some(0) = self.limit {
            return Err(StoreError::Validation("limit must be > 0".into()));
        }
        if let Some(t) = &self.r#type {
            validate_name(t)?;
        }
        Ok(())
    }
}

/// Id-only fast path: `{ id: { $eq: v } }` or `{ id: { $in: [...] } }`,
/// extracted when the caller has confirmed no sort/projection are set.
pub enum IdFastPath {
    Eq(String),
    In(Vec<String>),
}

pub fn id_fast_path(filter: &Value) -> Option<IdFastPath> {
    let obj = filter.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let value = obj.get("id")?;
    match value {
        Value::String(s) => Some(IdFastPath::Eq(s.clone())),
        Value::Object(ops) if ops.len() == 1 => {
            if let Some(Value::String(s)) = ops.get("$eq") {
                return Some(IdFastPath::Eq(s.clone()));
            }
            if let Some(Value::Array(items)) = ops.get("$in") {
                let ids: Option<Vec<String>> = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect();
                return ids.map(IdFastPath::In);
            }
            None
        }
        _ => None,
    }
}

/// Single-field equality fast path: `{ field: v }` or `{ field: { $eq: v } }`.
pub fn index_fast_path(filter: &Value) -> Option<(String, Value)> {
    let obj = filter.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let (field, value) = obj.iter().next()?;
    if field.starts_with('$') {
        return None;
    }
    match value {
        Value::Object(ops) if ops.len() == 1 => ops.get("$eq").map(|v| (field.clone(), v.clone())),
        Value::Object(_) => None,
        literal => Some((field.clone(), literal.clone())),
    }
}

/// Run the general-path pipeline: filter, sort, skip, limit, project.
pub fn evaluate(docs: Vec<Value>, spec: &QuerySpec) -> Result<Vec<Value>> {
    spec.validate()?;
    let node = compile(&spec.filter)?;
    let mut matched: Vec<Value> = docs.into_iter().filter(|d| matches(d, &node)).collect();

    if !spec.sort.is_empty() {
        matched.sort_by(|a, b| {
            for (path, dir) in &spec.sort {
                let ord = compare_ranked(get_path(a, path), get_path(b, path));
                let ord = if *dir < 0 { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    let skipped: Vec<Value> = matched.into_iter().skip(spec.skip).collect();
    let limited: Vec<Value> = match spec.limit {
        Some(n) => skipped.into_iter().take(n).collect(),
        None => skipped,
    };

    Ok(limited.into_iter().map(|d| apply_projection(&d, &spec.projection)).collect())
}

//! Aggregation pipeline evaluation.
//!
//! Supported stages: `$match`, `$sort`, `$limit`, `$skip`, `$project`,
//! `$count`, `$unwind` and `$group` with `$sum`, `$avg`, `$min`, `$max`,
//! `$first`, `$last` and `$push`.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::DataStoreError;
use crate::matcher::{self, get_path, set_path, sort_order};

/// Run `pipeline` over `docs`.
pub fn run(docs: Vec<Value>, pipeline: &[Value]) -> Result<Vec<Value>, DataStoreError> {
    pipeline.iter().try_fold(docs, |docs, stage| apply_stage(docs, stage))
}

fn apply_stage(docs: Vec<Value>, stage: &Value) -> Result<Vec<Value>, DataStoreError> {
    let (name, spec) = match stage.as_object() {
        Some(map) if map.len() == 1 => map
            .iter()
            .next()
            .ok_or_else(|| DataStoreError::InvalidQuery("empty pipeline stage".into()))?,
        _ => {
            return Err(DataStoreError::InvalidQuery(
                "each pipeline stage must be an object with one operator".into(),
            ))
        }
    };

    match name.as_str() {
        "$match" => {
            let mut kept = Vec::with_capacity(docs.len());
            for doc in docs {
                if matcher::matches(&doc, spec)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        "$sort" => {
            let mut docs = docs;
            matcher::sort_documents(&mut docs, spec)?;
            Ok(docs)
        }
        "$limit" => Ok(docs.into_iter().take(count_arg(name, spec)?).collect()),
        "$skip" => Ok(docs.into_iter().skip(count_arg(name, spec)?).collect()),
        "$project" => docs.iter().map(|doc| project_stage(doc, spec)).collect(),
        "$count" => {
            let field = spec
                .as_str()
                .filter(|f| !f.is_empty() && !f.starts_with('$'))
                .ok_or_else(|| DataStoreError::InvalidQuery("$count takes a field name".into()))?;
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = Map::new();
            out.insert(field.to_string(), Value::from(docs.len()));
            Ok(vec![Value::Object(out)])
        }
        "$unwind" => unwind(docs, spec),
        "$group" => group(docs, spec),
        other => Err(DataStoreError::Unsupported(format!(
            "aggregation stage {}",
            other
        ))),
    }
}

fn count_arg(stage: &str, spec: &Value) -> Result<usize, DataStoreError> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| DataStoreError::InvalidQuery(format!("{} takes a non-negative integer", stage)))
}

// =============================================================================
// Expressions
// =============================================================================

/// Evaluate an aggregation expression against a document.
///
/// `"$path"` reads a field; objects are evaluated member-wise; a small set
/// of arithmetic operators is supported; anything else is a literal.
fn eval(doc: &Value, expr: &Value) -> Result<Value, DataStoreError> {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            Ok(get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null))
        }
        Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
            let (op, args) = map
                .iter()
                .next()
                .ok_or_else(|| DataStoreError::InvalidQuery("empty expression".into()))?;
            eval_operator(doc, op, args)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(key.clone(), eval(doc, value)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| eval(doc, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        literal => Ok(literal.clone()),
    }
}

fn eval_operator(doc: &Value, op: &str, args: &Value) -> Result<Value, DataStoreError> {
    if op == "$date" {
        let mut out = Map::new();
        out.insert(op.to_string(), args.clone());
        return Ok(Value::Object(out));
    }
    let operands: Vec<f64> = match args {
        Value::Array(items) => items
            .iter()
            .map(|item| eval(doc, item).map(|v| v.as_f64()))
            .collect::<Result<Option<Vec<f64>>, _>>()?
            .unwrap_or_default(),
        other => eval(doc, other)?.as_f64().into_iter().collect(),
    };
    let number = |f: f64| serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number);
    match op {
        "$add" => Ok(number(operands.iter().sum())),
        "$multiply" => Ok(number(operands.iter().product())),
        "$subtract" if operands.len() == 2 => Ok(number(operands[0] - operands[1])),
        "$divide" if operands.len() == 2 && operands[1] != 0.0 => {
            Ok(number(operands[0] / operands[1]))
        }
        "$divide" => Ok(Value::Null),
        other => Err(DataStoreError::Unsupported(format!(
            "expression operator {}",
            other
        ))),
    }
}

fn project_stage(doc: &Value, spec: &Value) -> Result<Value, DataStoreError> {
    let map = spec
        .as_object()
        .ok_or_else(|| DataStoreError::InvalidQuery("$project takes an object".into()))?;
    let is_flag = |v: &Value| matches!(v, Value::Number(_) | Value::Bool(_));
    if map.values().all(is_flag) {
        return matcher::project(doc, spec);
    }

    let included = |v: &Value| v.as_bool().unwrap_or_else(|| v.as_f64() != Some(0.0));
    let mut out = Map::new();
    let exclude_id = map.get("_id").is_some_and(|v| is_flag(v) && !included(v));
    if !exclude_id {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    for (path, value) in map {
        if is_flag(value) {
            if path != "_id" && included(value) {
                if let Some(v) = get_path(doc, path) {
                    set_path(&mut out, path, v.clone());
                }
            }
            continue;
        }
        set_path(&mut out, path, eval(doc, value)?);
    }
    Ok(Value::Object(out))
}

fn unwind(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, DataStoreError> {
    let path = spec
        .as_str()
        .or_else(|| spec.get("path").and_then(Value::as_str))
        .and_then(|p| p.strip_prefix('$'))
        .ok_or_else(|| DataStoreError::InvalidQuery("$unwind takes a \"$field\" path".into()))?;

    let mut out = Vec::new();
    for doc in docs {
        let items = match get_path(&doc, path) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => continue,
            Some(_) => {
                out.push(doc);
                continue;
            }
        };
        for item in items {
            let mut copy = doc.clone();
            if let Value::Object(map) = &mut copy {
                set_path(map, path, item);
            }
            out.push(copy);
        }
    }
    Ok(out)
}

// =============================================================================
// $group
// =============================================================================

enum Accumulator {
    Sum(f64, bool),
    Avg(f64, usize),
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self, DataStoreError> {
        Ok(match op {
            "$sum" => Accumulator::Sum(0.0, true),
            "$avg" => Accumulator::Avg(0.0, 0),
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(None),
            "$push" => Accumulator::Push(Vec::new()),
            other => {
                return Err(DataStoreError::Unsupported(format!(
                    "group accumulator {}",
                    other
                )))
            }
        })
    }

    fn add(&mut self, value: Value) {
        match self {
            Accumulator::Sum(total, integral) => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *integral &= value.is_i64() || value.is_u64();
                }
            }
            Accumulator::Avg(total, count) => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => keep_extreme(current, value, Ordering::Less),
            Accumulator::Max(current) => keep_extreme(current, value, Ordering::Greater),
            Accumulator::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Accumulator::Last(current) => *current = Some(value),
            Accumulator::Push(items) => items.push(value),
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Sum(total, true) if total.fract() == 0.0 && total.abs() < 9.0e15 => {
                Value::from(total as i64)
            }
            Accumulator::Sum(total, _) => {
                serde_json::Number::from_f64(total).map_or(Value::Null, Value::Number)
            }
            Accumulator::Avg(_, 0) => Value::Null,
            Accumulator::Avg(total, count) => serde_json::Number::from_f64(total / count as f64)
                .map_or(Value::Null, Value::Number),
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::First(v) | Accumulator::Last(v) => {
                v.unwrap_or(Value::Null)
            }
            Accumulator::Push(items) => Value::Array(items),
        }
    }
}

fn keep_extreme(current: &mut Option<Value>, value: Value, wanted: Ordering) {
    if value.is_null() {
        return;
    }
    let replace = match current {
        None => true,
        Some(existing) => sort_order(Some(&value), Some(existing)) == wanted,
    };
    if replace {
        *current = Some(value);
    }
}

struct Group {
    key: Value,
    accumulators: Vec<(String, Value, Accumulator)>,
}

fn group(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, DataStoreError> {
    let map = spec
        .as_object()
        .ok_or_else(|| DataStoreError::InvalidQuery("$group takes an object".into()))?;
    let id_expr = map
        .get("_id")
        .ok_or_else(|| DataStoreError::InvalidQuery("$group requires an _id".into()))?;

    let mut fields = Vec::new();
    for (name, acc) in map.iter().filter(|(k, _)| k.as_str() != "_id") {
        let (op, expr) = acc
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
            .ok_or_else(|| {
                DataStoreError::InvalidQuery(format!("group field '{}' needs one accumulator", name))
            })?;
        Accumulator::new(op)?;
        fields.push((name.clone(), op.clone(), expr.clone()));
    }

    // Groups keep first-seen order.
    let mut groups: Vec<Group> = Vec::new();
    for doc in &docs {
        let key = eval(doc, id_expr)?;
        let index = match groups.iter().position(|g| matcher::values_equal(&g.key, &key)) {
            Some(i) => i,
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(name, op, expr)| Ok((name.clone(), expr.clone(), Accumulator::new(op)?)))
                    .collect::<Result<Vec<_>, DataStoreError>>()?;
                groups.push(Group { key, accumulators });
                groups.len() - 1
            }
        };
        for (_, expr, acc) in &mut groups[index].accumulators {
            acc.add(eval(doc, expr)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|g| {
            let mut out = Map::new();
            out.insert("_id".to_string(), g.key);
            for (name, _, acc) in g.accumulators {
                out.insert(name, acc.finish());
            }
            Value::Object(out)
        })
        .collect())
}

//! Document matching, comparison and projection.
//!
//! Values follow the extended-JSON convention used by resolved queries:
//! a date is `{"$date": "<RFC 3339>"}`. Plain RFC 3339 strings in stored
//! documents compare as dates when the other side is a date.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde_json::{Map, Value};

use crate::error::DataStoreError;

// =============================================================================
// Paths
// =============================================================================

/// Resolve a dotted path such as `customer.address.city`.
///
/// Numeric segments index into arrays.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Set a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                set_path(map, rest, value);
            }
        }
    }
}

// =============================================================================
// Comparison
// =============================================================================

/// Extract a date from `{"$date": ...}` or an RFC 3339 string.
pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Object(map) if map.len() == 1 => match map.get("$date")? {
            Value::String(s) => parse_rfc3339(s),
            Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
            _ => None,
        },
        Value::String(s) => parse_rfc3339(s),
        _ => None,
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn is_date_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.len() == 1 && map.contains_key("$date"))
}

/// Compare two values of the same kind. `None` when they are not
/// comparable (different types), which makes range operators fail.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if is_date_object(a) || is_date_object(b) {
        return as_date(a)?.partial_cmp(&as_date(b)?);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Equality with numeric and date normalisation.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match compare(a, b) {
        Some(ord) => ord == Ordering::Equal,
        None => a == b,
    }
}

/// Rank used to order values of different types when sorting.
fn type_rank(value: &Value) -> u8 {
    if is_date_object(value) {
        return 7;
    }
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order for sorting; missing fields sort as null.
pub fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    compare(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string()))
}

/// Sort documents in place by a `{field: 1 | -1, ...}` specification.
pub fn sort_documents(docs: &mut [Value], spec: &Value) -> Result<(), DataStoreError> {
    let keys = sort_keys(spec)?;
    docs.sort_by(|a, b| {
        for (path, descending) in &keys {
            let ord = sort_order(get_path(a, path), get_path(b, path));
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn sort_keys(spec: &Value) -> Result<Vec<(String, bool)>, DataStoreError> {
    let map = spec
        .as_object()
        .ok_or_else(|| DataStoreError::InvalidQuery("sort specification must be an object".into()))?;
    map.iter()
        .map(|(path, direction)| match direction.as_f64() {
            Some(d) if d == 1.0 => Ok((path.clone(), false)),
            Some(d) if d == -1.0 => Ok((path.clone(), true)),
            _ => Err(DataStoreError::InvalidQuery(format!(
                "sort direction for '{}' must be 1 or -1",
                path
            ))),
        })
        .collect()
}

// =============================================================================
// Filters
// =============================================================================

/// Whether `doc` satisfies `filter`.
pub fn matches(doc: &Value, filter: &Value) -> Result<bool, DataStoreError> {
    let map = match filter {
        Value::Object(map) => map,
        Value::Null => return Ok(true),
        _ => {
            return Err(DataStoreError::InvalidQuery(
                "filter must be an object".into(),
            ))
        }
    };

    for (key, condition) in map {
        let ok = match key.as_str() {
            "$and" => all_of(doc, condition)?,
            "$or" => any_of(doc, condition)?,
            "$nor" => !any_of(doc, condition)?,
            op if op.starts_with('$') => {
                return Err(DataStoreError::Unsupported(format!(
                    "top-level operator {}",
                    op
                )))
            }
            path => field_matches(get_path(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses(condition: &Value) -> Result<&Vec<Value>, DataStoreError> {
    condition
        .as_array()
        .ok_or_else(|| DataStoreError::InvalidQuery("logical operators take an array".into()))
}

fn all_of(doc: &Value, condition: &Value) -> Result<bool, DataStoreError> {
    for clause in clauses(condition)? {
        if !matches(doc, clause)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_of(doc: &Value, condition: &Value) -> Result<bool, DataStoreError> {
    for clause in clauses(condition)? {
        if matches(doc, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_object(condition: &Value) -> bool {
    match condition {
        Value::Object(map) => {
            !map.is_empty()
                && !is_date_object(condition)
                && map.keys().all(|k| k.starts_with('$'))
        }
        _ => false,
    }
}

/// Match one field value against a literal or an operator object.
fn field_matches(value: Option<&Value>, condition: &Value) -> Result<bool, DataStoreError> {
    if !is_operator_object(condition) {
        return Ok(equals_or_contains(value, condition));
    }

    let ops = condition.as_object().map(|m| m.iter()).into_iter().flatten();
    let options = condition.get("$options").and_then(Value::as_str).unwrap_or("");
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_or_contains(value, operand),
            "$ne" => !equals_or_contains(value, operand),
            "$gt" => range(value, operand, |o| o == Ordering::Greater),
            "$gte" => range(value, operand, |o| o != Ordering::Less),
            "$lt" => range(value, operand, |o| o == Ordering::Less),
            "$lte" => range(value, operand, |o| o != Ordering::Greater),
            "$in" => in_list(value, operand)?,
            "$nin" => !in_list(value, operand)?,
            "$exists" => value.is_some() == operand.as_bool().unwrap_or(true),
            "$regex" => regex_matches(value, operand, options)?,
            "$options" => true,
            "$not" => !field_matches(value, operand)?,
            "$size" => match (value, operand.as_u64()) {
                (Some(Value::Array(items)), Some(n)) => items.len() as u64 == n,
                _ => false,
            },
            other => {
                return Err(DataStoreError::Unsupported(format!(
                    "query operator {}",
                    other
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality where an array field matches if any element matches.
fn equals_or_contains(value: Option<&Value>, target: &Value) -> bool {
    match value {
        None => target.is_null(),
        Some(v) if values_equal(v, target) => true,
        Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, target)),
        Some(_) => false,
    }
}

fn range(value: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let check = |v: &Value| compare(v, operand).is_some_and(&accept);
    match value {
        Some(Value::Array(items)) => items.iter().any(check),
        Some(v) => check(v),
        None => false,
    }
}

fn in_list(value: Option<&Value>, operand: &Value) -> Result<bool, DataStoreError> {
    let candidates = operand
        .as_array()
        .ok_or_else(|| DataStoreError::InvalidQuery("$in / $nin take an array".into()))?;
    Ok(candidates.iter().any(|c| equals_or_contains(value, c)))
}

fn regex_matches(value: Option<&Value>, pattern: &Value, options: &str) -> Result<bool, DataStoreError> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| DataStoreError::InvalidQuery("$regex takes a string".into()))?;
    let re = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .build()
        .map_err(|e| DataStoreError::InvalidQuery(format!("invalid $regex: {}", e)))?;
    Ok(match value {
        Some(Value::String(s)) => re.is_match(s),
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| item.as_str().is_some_and(|s| re.is_match(s))),
        _ => false,
    })
}

// =============================================================================
// Projection
// =============================================================================

/// Apply an inclusion or exclusion projection.
///
/// `_id` is kept unless explicitly excluded. Mixing inclusion and exclusion
/// (other than `_id`) is an error.
pub fn project(doc: &Value, projection: &Value) -> Result<Value, DataStoreError> {
    let spec = match projection {
        Value::Object(map) if !map.is_empty() => map,
        _ => return Ok(doc.clone()),
    };

    let flag = |v: &Value| match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    };
    let inclusive: Vec<bool> = spec
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .map(|(_, v)| flag(v))
        .collect();
    if inclusive.iter().any(|b| *b) && inclusive.iter().any(|b| !*b) {
        return Err(DataStoreError::InvalidQuery(
            "projection cannot mix inclusion and exclusion".into(),
        ));
    }
    let keep_id = spec.get("_id").map_or(true, flag);
    let exclusion = inclusive.iter().all(|b| !*b);

    let source = match doc {
        Value::Object(map) => map,
        other => return Ok(other.clone()),
    };

    if exclusion {
        let mut out = source.clone();
        for (path, _) in spec.iter().filter(|(_, v)| !flag(*v)) {
            remove_path(&mut out, path);
        }
        if !keep_id {
            out.remove("_id");
        }
        return Ok(Value::Object(out));
    }

    let mut out = Map::new();
    if keep_id {
        if let Some(id) = source.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    for (path, _) in spec.iter().filter(|(k, v)| k.as_str() != "_id" && flag(*v)) {
        if let Some(value) = get_path(doc, path) {
            set_path(&mut out, path, value.clone());
        }
    }
    Ok(Value::Object(out))
}

fn remove_path(doc: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

//! Applies an [`UpdateDocument`] to a JSON document tree.
//!
//! This mirrors what the backing store does with the rendered update
//! message: the in-memory store uses it to execute conditional updates, and
//! the diff tests use it to verify the diff/apply round trip.
//!
//! Path semantics follow the store's update language: dotted segments
//! address object keys, numeric segments address array indexes (padding
//! with nulls when a creating operator writes past the end), and
//! `$[identifier]` segments address every array element matched by the
//! corresponding [`ArrayFilter`](crate::update::ArrayFilter) predicate.
//! Unsetting an array element nulls it rather than shifting its siblings.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::update::UpdateDocument;

/// Errors from applying an update descriptor.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// A path addressed a container of the wrong shape.
    #[error("path {path:?} expects {expected} at segment {segment:?}")]
    TypeMismatch {
        /// Full dotted path of the failing operation.
        path: String,
        /// Container kind the segment requires.
        expected: &'static str,
        /// Segment that failed to resolve.
        segment: String,
    },
    /// A `$[identifier]` segment has no matching array filter.
    #[error("no array filter declares identifier {identifier:?}")]
    UnknownIdentifier {
        /// The unresolved identifier.
        identifier: String,
    },
    /// An operator received an operand it cannot use.
    #[error("operator {operator} at {path:?} cannot use operand {operand}")]
    InvalidOperand {
        /// Operator name (`$inc`, `$pullAll`, ...).
        operator: &'static str,
        /// Full dotted path of the failing operation.
        path: String,
        /// Rendering of the rejected operand.
        operand: String,
    },
}

/// Applies every operation in `update` to `doc`.
///
/// `doc` must be a JSON object (a serialized document root).
///
/// # Errors
///
/// [`ApplyError`] when a path or operand is incompatible with the current
/// document shape. The document may be partially modified on error.
pub fn apply_update(doc: &mut Value, update: &UpdateDocument) -> Result<(), ApplyError> {
    let filters: HashMap<&str, &Map<String, Value>> = update
        .array_filters
        .iter()
        .map(|f| (f.identifier.as_str(), &f.predicate))
        .collect();

    for (path, value) in &update.set {
        apply_one(doc, path, &filters, &LeafOp::Set(value))?;
    }
    for path in update.unset.keys() {
        apply_one(doc, path, &filters, &LeafOp::Unset)?;
    }
    for (path, delta) in &update.inc {
        apply_one(doc, path, &filters, &LeafOp::Inc(delta))?;
    }
    for (path, operand) in &update.push {
        apply_one(doc, path, &filters, &LeafOp::Push(operand))?;
    }
    for (path, value) in &update.pull {
        apply_one(doc, path, &filters, &LeafOp::Pull(value))?;
    }
    for (path, operand) in &update.add_to_set {
        apply_one(doc, path, &filters, &LeafOp::AddToSet(operand))?;
    }
    for (path, values) in &update.pull_all {
        apply_one(doc, path, &filters, &LeafOp::PullAll(values))?;
    }
    Ok(())
}

enum LeafOp<'a> {
    Set(&'a Value),
    Unset,
    Inc(&'a Value),
    Push(&'a Value),
    Pull(&'a Value),
    AddToSet(&'a Value),
    PullAll(&'a Value),
}

impl LeafOp<'_> {
    /// Creating operators materialize missing intermediate containers;
    /// removing operators treat missing paths as a no-op.
    fn creates(&self) -> bool {
        matches!(
            self,
            LeafOp::Set(_) | LeafOp::Inc(_) | LeafOp::Push(_) | LeafOp::AddToSet(_)
        )
    }
}

#[derive(Debug)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
    Positional(&'a str),
}

fn parse_segment(raw: &str) -> Segment<'_> {
    if let Some(identifier) = raw.strip_prefix("$[").and_then(|s| s.strip_suffix(']')) {
        return Segment::Positional(identifier);
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(index) = raw.parse::<usize>() {
            return Segment::Index(index);
        }
    }
    Segment::Key(raw)
}

fn apply_one(
    doc: &mut Value,
    path: &str,
    filters: &HashMap<&str, &Map<String, Value>>,
    op: &LeafOp<'_>,
) -> Result<(), ApplyError> {
    let segments: Vec<Segment<'_>> = path.split('.').map(parse_segment).collect();
    descend(doc, &segments, path, filters, op)
}

fn type_mismatch(path: &str, expected: &'static str, segment: &Segment<'_>) -> ApplyError {
    ApplyError::TypeMismatch {
        path: path.to_string(),
        expected,
        segment: format!("{segment:?}"),
    }
}

/// Default container for a missing intermediate: an array when the next
/// segment is an index, an object otherwise.
fn default_container(next: &Segment<'_>) -> Value {
    match next {
        Segment::Index(_) | Segment::Positional(_) => Value::Array(Vec::new()),
        Segment::Key(_) => Value::Object(Map::new()),
    }
}

fn element_matches(element: &Value, identifier: &str, predicate: &Map<String, Value>) -> bool {
    let prefix = format!("{identifier}.");
    predicate.iter().all(|(key, expected)| {
        let Some(sub_path) = key.strip_prefix(&prefix) else {
            return false;
        };
        lookup_path(element, sub_path) == Some(expected)
    })
}

fn lookup_path<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in dotted.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn descend(
    target: &mut Value,
    segments: &[Segment<'_>],
    path: &str,
    filters: &HashMap<&str, &Map<String, Value>>,
    op: &LeafOp<'_>,
) -> Result<(), ApplyError> {
    let (segment, rest) = segments
        .split_first()
        .expect("paths always have at least one segment");

    if rest.is_empty() {
        return apply_leaf(target, segment, path, filters, op);
    }

    match segment {
        Segment::Key(key) => match target {
            Value::Object(map) => {
                let child = map.get_mut(*key);
                let missing = child.as_ref().is_none_or(|v| v.is_null());
                if missing {
                    if !op.creates() {
                        return Ok(());
                    }
                    map.insert((*key).to_string(), default_container(&rest[0]));
                }
                let child = map.get_mut(*key).expect("inserted above when missing");
                descend(child, rest, path, filters, op)
            }
            _ => Err(type_mismatch(path, "object", segment)),
        },
        Segment::Index(index) => match target {
            // Numeric segments address object keys when the container is an
            // object (dot-path semantics of the store's update language).
            Value::Object(map) => {
                let key = index.to_string();
                let missing = map.get(&key).is_none_or(Value::is_null);
                if missing {
                    if !op.creates() {
                        return Ok(());
                    }
                    map.insert(key.clone(), default_container(&rest[0]));
                }
                let child = map.get_mut(&key).expect("inserted above when missing");
                descend(child, rest, path, filters, op)
            }
            Value::Array(items) => {
                if *index >= items.len() {
                    if !op.creates() {
                        return Ok(());
                    }
                    items.resize(*index + 1, Value::Null);
                }
                if items[*index].is_null() {
                    if !op.creates() {
                        return Ok(());
                    }
                    items[*index] = default_container(&rest[0]);
                }
                descend(&mut items[*index], rest, path, filters, op)
            }
            _ => Err(type_mismatch(path, "array", segment)),
        },
        Segment::Positional(identifier) => {
            let predicate =
                filters
                    .get(identifier)
                    .copied()
                    .ok_or_else(|| ApplyError::UnknownIdentifier {
                        identifier: (*identifier).to_string(),
                    })?;
            match target {
                Value::Array(items) => {
                    for element in items.iter_mut() {
                        if element_matches(element, identifier, predicate) {
                            descend(element, rest, path, filters, op)?;
                        }
                    }
                    Ok(())
                }
                _ => Err(type_mismatch(path, "array", segment)),
            }
        }
    }
}

fn apply_leaf(
    target: &mut Value,
    segment: &Segment<'_>,
    path: &str,
    filters: &HashMap<&str, &Map<String, Value>>,
    op: &LeafOp<'_>,
) -> Result<(), ApplyError> {
    match segment {
        Segment::Key(key) => match target {
            Value::Object(map) => apply_to_object(map, key, path, op),
            _ => Err(type_mismatch(path, "object", segment)),
        },
        Segment::Index(index) => match target {
            Value::Object(map) => apply_to_object(map, &index.to_string(), path, op),
            Value::Array(items) => apply_to_array(items, *index, path, op),
            _ => Err(type_mismatch(path, "array", segment)),
        },
        Segment::Positional(identifier) => {
            let predicate =
                filters
                    .get(identifier)
                    .copied()
                    .ok_or_else(|| ApplyError::UnknownIdentifier {
                        identifier: (*identifier).to_string(),
                    })?;
            match target {
                Value::Array(items) => {
                    for index in 0..items.len() {
                        if element_matches(&items[index], identifier, predicate) {
                            apply_to_array(items, index, path, op)?;
                        }
                    }
                    Ok(())
                }
                _ => Err(type_mismatch(path, "array", segment)),
            }
        }
    }
}

fn apply_to_object(
    map: &mut Map<String, Value>,
    key: &str,
    path: &str,
    op: &LeafOp<'_>,
) -> Result<(), ApplyError> {
    match op {
        LeafOp::Set(value) => {
            map.insert(key.to_string(), (*value).clone());
            Ok(())
        }
        LeafOp::Unset => {
            map.remove(key);
            Ok(())
        }
        _ => {
            // Removing operators leave missing keys alone rather than
            // materializing a null entry.
            if !op.creates() && !map.contains_key(key) {
                return Ok(());
            }
            let slot = map.entry(key.to_string()).or_insert(Value::Null);
            apply_in_place(slot, path, op)
        }
    }
}

fn apply_to_array(
    items: &mut Vec<Value>,
    index: usize,
    path: &str,
    op: &LeafOp<'_>,
) -> Result<(), ApplyError> {
    if index >= items.len() {
        if !op.creates() {
            return Ok(());
        }
        items.resize(index + 1, Value::Null);
    }
    match op {
        LeafOp::Set(value) => {
            items[index] = (*value).clone();
            Ok(())
        }
        // Unsetting an array element nulls it; siblings keep their positions.
        LeafOp::Unset => {
            items[index] = Value::Null;
            Ok(())
        }
        _ => apply_in_place(&mut items[index], path, op),
    }
}

/// Applies a value-level operator (`$inc` and the array operators) to the
/// slot it addresses. `Set`/`Unset` are handled by the callers because they
/// need the parent container.
fn apply_in_place(slot: &mut Value, path: &str, op: &LeafOp<'_>) -> Result<(), ApplyError> {
    match op {
        LeafOp::Set(_) | LeafOp::Unset => unreachable!("handled by parent-container paths"),
        LeafOp::Inc(delta) => {
            let current = match slot {
                Value::Null => 0.0,
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                _ => {
                    return Err(ApplyError::InvalidOperand {
                        operator: "$inc",
                        path: path.to_string(),
                        operand: slot.to_string(),
                    })
                }
            };
            let delta_num = delta.as_f64().ok_or_else(|| ApplyError::InvalidOperand {
                operator: "$inc",
                path: path.to_string(),
                operand: delta.to_string(),
            })?;

            // Keep integer arithmetic exact when both sides are integral.
            let both_integral = matches!(slot, Value::Null)
                || slot.as_i64().is_some() && delta.as_i64().is_some();
            *slot = if both_integral && delta.as_i64().is_some() {
                let base = slot.as_i64().unwrap_or(0);
                Value::from(base + delta.as_i64().expect("checked above"))
            } else {
                Value::from(current + delta_num)
            };
            Ok(())
        }
        LeafOp::Push(operand) => {
            let array = slot_as_array(slot, path, "$push")?;
            array.extend(each_values(operand));
            Ok(())
        }
        LeafOp::AddToSet(operand) => {
            let array = slot_as_array(slot, path, "$addToSet")?;
            for value in each_values(operand) {
                if !array.contains(&value) {
                    array.push(value);
                }
            }
            Ok(())
        }
        LeafOp::Pull(value) => {
            if let Value::Array(items) = slot {
                items.retain(|item| item != *value);
                Ok(())
            } else if slot.is_null() {
                Ok(())
            } else {
                Err(ApplyError::InvalidOperand {
                    operator: "$pull",
                    path: path.to_string(),
                    operand: slot.to_string(),
                })
            }
        }
        LeafOp::PullAll(values) => {
            let Value::Array(to_remove) = *values else {
                return Err(ApplyError::InvalidOperand {
                    operator: "$pullAll",
                    path: path.to_string(),
                    operand: values.to_string(),
                });
            };
            if let Value::Array(items) = slot {
                items.retain(|item| !to_remove.contains(item));
                Ok(())
            } else if slot.is_null() {
                Ok(())
            } else {
                Err(ApplyError::InvalidOperand {
                    operator: "$pullAll",
                    path: path.to_string(),
                    operand: slot.to_string(),
                })
            }
        }
    }
}

fn slot_as_array<'a>(
    slot: &'a mut Value,
    path: &str,
    operator: &'static str,
) -> Result<&'a mut Vec<Value>, ApplyError> {
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(items) => Ok(items),
        _ => Err(ApplyError::InvalidOperand {
            operator,
            path: path.to_string(),
            operand: slot.to_string(),
        }),
    }
}

/// Unwraps a `{"$each": [...]}` operand, or yields the operand itself.
fn each_values(operand: &Value) -> Vec<Value> {
    if let Value::Object(map) = operand {
        if map.len() == 1 {
            if let Some(Value::Array(values)) = map.get("$each") {
                return values.clone();
            }
        }
    }
    vec![operand.clone()]
}

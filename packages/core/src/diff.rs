//! Structural diff builder.
//!
//! [`build_diff`] compares two values of the same document type through
//! their serde_json serialization and produces the minimal
//! [`UpdateDocument`] that transforms the old state into the new one.
//!
//! Field rules, walked from the root object:
//!
//! - Primitive leaves: unequal values emit `$set`; a new value that is a
//!   zero value stays `$set` when it is boolean or numeric (`false` and `0`
//!   are meaningful states) and becomes `$unset` otherwise (null, empty
//!   string).
//! - Objects recurse over the key union with dotted sub-paths: only-old
//!   keys are `$unset`, only-new keys are `$set`, shared keys recurse.
//! - Equal-length sequences recurse per index; an element object with a
//!   stable identifier field (`_id`/`id`/`ID`/`Id`) present and unchanged
//!   on both sides is addressed through a positional `$[elemN]` filter
//!   instead of its index, so the update stays correct under concurrent
//!   reordering.
//! - Sequences of differing length are replaced wholesale when short
//!   (fewer than ten elements) or when elements are not plain scalars;
//!   otherwise scalar multiset additions become `$push` (with `$each` for
//!   several) and removals become `$pullAll`. A sequence with both
//!   additions and removals is replaced wholesale: one update message
//!   cannot carry `$push` and `$pullAll` for the same path.
//! - Optional fields follow the null rules: both null is a no-op, null to
//!   value is `$set`, value to null is `$unset`, value to value recurses.
//!
//! The diff is empty iff the two serializations are observationally equal
//! (null-valued and absent fields are not distinguished).

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::update::{ArrayFilter, UpdateDocument};

/// Sequences shorter than this are replaced wholesale when lengths differ.
const SHORT_SEQUENCE_LEN: usize = 10;

/// Field names recognized as a stable element identifier, probed in order.
const ID_FIELDS: [&str; 4] = ["_id", "id", "ID", "Id"];

/// Errors from the diff builder.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// One of the inputs serialized to JSON null.
    #[error("cannot diff null input")]
    NilInput,
    /// The two inputs are of incompatible shapes (roots are not both objects).
    #[error("cannot diff values of differing shapes")]
    TypesDiffer,
    /// A document failed to serialize.
    #[error("document serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Diffs two documents of the same type into an update descriptor.
///
/// # Errors
///
/// [`DiffError::NilInput`] when either value serializes to JSON null,
/// [`DiffError::TypesDiffer`] when the serialized roots are not both
/// objects, [`DiffError::Serialize`] when serde fails.
pub fn build_diff<D: Serialize>(old: &D, new: &D) -> Result<UpdateDocument, DiffError> {
    let old_value = serde_json::to_value(old)?;
    let new_value = serde_json::to_value(new)?;
    diff_values(&old_value, &new_value)
}

/// Diffs two already-serialized document trees.
///
/// # Errors
///
/// Same contract as [`build_diff`].
pub fn diff_values(old: &Value, new: &Value) -> Result<UpdateDocument, DiffError> {
    if old.is_null() || new.is_null() {
        return Err(DiffError::NilInput);
    }
    let (Some(old_obj), Some(new_obj)) = (old.as_object(), new.as_object()) else {
        return Err(DiffError::TypesDiffer);
    };

    let mut update = UpdateDocument::new();
    diff_object(old_obj, new_obj, "", &mut update);
    Ok(update)
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// A zero value that means "absent" rather than "explicitly zero".
///
/// Booleans and numbers are excluded: `false` and `0` are meaningful states
/// and must survive as `$set`.
fn is_absent_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn diff_object(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    prefix: &str,
    update: &mut UpdateDocument,
) {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for key in keys {
        let path = join_path(prefix, key);
        match (old.get(key.as_str()), new.get(key.as_str())) {
            (Some(old_value), Some(new_value)) => {
                diff_field(old_value, new_value, &path, update);
            }
            (Some(old_value), None) => {
                // Removed key. A null was already indistinguishable from absent.
                if !old_value.is_null() {
                    update.unset(path);
                }
            }
            (None, Some(new_value)) => {
                // Added key. Adding a null carries no information.
                if !new_value.is_null() {
                    update.set(path, new_value.clone());
                }
            }
            (None, None) => unreachable!("key taken from the union of both maps"),
        }
    }
}

fn diff_field(old: &Value, new: &Value, path: &str, update: &mut UpdateDocument) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_obj), Value::Object(new_obj)) => {
            diff_object(old_obj, new_obj, path, update);
        }
        (Value::Array(old_arr), Value::Array(new_arr)) => {
            diff_array(old_arr, new_arr, path, update);
        }
        (Value::Null, _) => {
            update.set(path, new.clone());
        }
        (_, Value::Null) => {
            update.unset(path);
        }
        _ => {
            if is_absent_zero(new) {
                update.unset(path);
            } else {
                update.set(path, new.clone());
            }
        }
    }
}

/// The stable identifier value shared by both element objects, if any.
fn shared_element_id<'a>(
    old: &'a Map<String, Value>,
    new: &Map<String, Value>,
) -> Option<(&'static str, &'a Value)> {
    for field in ID_FIELDS {
        if let (Some(old_id), Some(new_id)) = (old.get(field), new.get(field)) {
            if old_id == new_id && !old_id.is_null() {
                return Some((field, old_id));
            }
        }
    }
    None
}

fn diff_array(old: &[Value], new: &[Value], path: &str, update: &mut UpdateDocument) {
    if old.len() == new.len() {
        diff_array_per_index(old, new, path, update);
        return;
    }

    let longest = old.len().max(new.len());
    if longest < SHORT_SEQUENCE_LEN || !all_scalars(old) || !all_scalars(new) {
        update.set(path, Value::Array(new.to_vec()));
        return;
    }

    let (added, removed) = multiset_delta(old, new);
    // pullAll removes every occurrence of a value; a removal of only some
    // duplicates cannot be expressed and forces wholesale replacement.
    if removed.iter().any(|value| new.contains(value)) {
        update.set(path, Value::Array(new.to_vec()));
        return;
    }
    match (added.is_empty(), removed.is_empty()) {
        // Both directions changed: a single message cannot push and pullAll
        // the same path, so replace the whole sequence.
        (false, false) => {
            update.set(path, Value::Array(new.to_vec()));
        }
        (false, true) => {
            let mut added = added;
            if added.len() == 1 {
                update.push(path, added.remove(0));
            } else {
                update.push_each(path, added);
            }
        }
        (true, false) => {
            update.pull_all(path, removed);
        }
        (true, true) => unreachable!("lengths differ, so the multisets differ"),
    }
}

fn diff_array_per_index(old: &[Value], new: &[Value], path: &str, update: &mut UpdateDocument) {
    for (index, (old_elem, new_elem)) in old.iter().zip(new.iter()).enumerate() {
        if old_elem == new_elem {
            continue;
        }
        if let (Value::Object(old_obj), Value::Object(new_obj)) = (old_elem, new_elem) {
            if let Some((id_field, id_value)) = shared_element_id(old_obj, new_obj) {
                diff_positional_element(old_obj, new_obj, path, id_field, id_value, update);
                continue;
            }
        }
        diff_field(old_elem, new_elem, &join_path(path, &index.to_string()), update);
    }
}

/// Diffs one identifier-stable array element through a `$[elemN]` filter.
fn diff_positional_element(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    path: &str,
    id_field: &str,
    id_value: &Value,
    update: &mut UpdateDocument,
) {
    let ops_before = update.len();
    let filters_before = update.array_filters.len();

    let identifier = update.next_identifier();
    update.add_array_filter(ArrayFilter::equals(
        identifier.clone(),
        id_field,
        id_value.clone(),
    ));
    diff_object(old, new, &join_path(path, &format!("$[{identifier}]")), update);

    // The elements differed only in null-vs-absent noise: drop the filter
    // that no operation ended up referencing.
    if update.len() == ops_before {
        update.array_filters.truncate(filters_before);
    }
}

fn all_scalars(values: &[Value]) -> bool {
    values
        .iter()
        .all(|v| matches!(v, Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)))
}

/// Multiset difference of two scalar sequences: values to add and values to
/// remove, each repeated per occurrence count.
fn multiset_delta(old: &[Value], new: &[Value]) -> (Vec<Value>, Vec<Value>) {
    let mut counts: HashMap<String, (Value, i64)> = HashMap::new();
    for value in new {
        let entry = counts
            .entry(value.to_string())
            .or_insert_with(|| (value.clone(), 0));
        entry.1 += 1;
    }
    for value in old {
        let entry = counts
            .entry(value.to_string())
            .or_insert_with(|| (value.clone(), 0));
        entry.1 -= 1;
    }

    let mut added = Vec::new();
    let mut removed = Vec::new();
    // Deterministic output order regardless of hash seeding.
    let mut deltas: Vec<(String, (Value, i64))> = counts.into_iter().collect();
    deltas.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, (value, count)) in deltas {
        match count {
            c if c > 0 => {
                for _ in 0..c {
                    added.push(value.clone());
                }
            }
            c if c < 0 => {
                // pullAll removes every occurrence; one entry is enough.
                removed.push(value);
            }
            _ => {}
        }
    }
    (added, removed)
}

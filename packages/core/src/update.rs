//! Update descriptors in the backing store's update language.
//!
//! An [`UpdateDocument`] collects field-path operations (`$set`, `$unset`,
//! `$inc`, `$push`, `$pull`, `$addToSet`, `$pullAll`) keyed by dotted path,
//! together with the positional [`ArrayFilter`] predicates referenced by
//! `$[identifier]` path segments. [`UpdateDocument::to_value`] renders the
//! whole descriptor as the single multi-operator message sent to the store.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

/// A positional-element predicate for paths of the form
/// `field.$[identifier].subfield`.
///
/// The predicate is a flat equality document whose keys are prefixed with
/// the identifier, e.g. `{"elem0._id": 42}` selects the array elements whose
/// `_id` equals 42.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayFilter {
    /// Synthetic identifier used in update paths (`elem0`, `elem1`, ...).
    pub identifier: String,
    /// Equality predicate keyed by `identifier.subpath`.
    pub predicate: Map<String, Value>,
}

impl ArrayFilter {
    /// Creates a filter matching elements whose `field` equals `value`.
    #[must_use]
    pub fn equals(identifier: impl Into<String>, field: &str, value: Value) -> Self {
        let identifier = identifier.into();
        let mut predicate = Map::new();
        predicate.insert(format!("{identifier}.{field}"), value);
        Self {
            identifier,
            predicate,
        }
    }

    /// Renders the predicate as a JSON document.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.predicate.clone())
    }
}

/// A multi-operator update message.
///
/// Paths are dotted (`profile.address.city`), may contain numeric index
/// segments (`tags.3`), and may contain positional segments
/// (`items.$[elem0].qty`) resolved through [`UpdateDocument::array_filters`].
///
/// Operator maps are `BTreeMap`s so rendering is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDocument {
    /// `$set`: path -> replacement value.
    pub set: BTreeMap<String, Value>,
    /// `$unset`: paths to remove.
    pub unset: BTreeMap<String, Value>,
    /// `$inc`: path -> numeric delta.
    pub inc: BTreeMap<String, Value>,
    /// `$push`: path -> value, or `{"$each": [...]}` for several.
    pub push: BTreeMap<String, Value>,
    /// `$pull`: path -> value to remove (all occurrences).
    pub pull: BTreeMap<String, Value>,
    /// `$addToSet`: path -> value, or `{"$each": [...]}`.
    pub add_to_set: BTreeMap<String, Value>,
    /// `$pullAll`: path -> list of values to remove.
    pub pull_all: BTreeMap<String, Value>,
    /// Positional predicates referenced by `$[identifier]` path segments.
    pub array_filters: Vec<ArrayFilter>,
}

impl UpdateDocument {
    /// Creates an empty update descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff no operator carries any entry.
    ///
    /// Array filters alone do not make a descriptor non-empty; a filter is
    /// meaningless without an operation referencing its identifier.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.unset.is_empty()
            && self.inc.is_empty()
            && self.push.is_empty()
            && self.pull.is_empty()
            && self.add_to_set.is_empty()
            && self.pull_all.is_empty()
    }

    /// Total number of path operations across all operators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
            + self.unset.len()
            + self.inc.len()
            + self.push.len()
            + self.pull.len()
            + self.add_to_set.len()
            + self.pull_all.len()
    }

    /// Records `$set path = value`.
    pub fn set(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.set.insert(path.into(), value);
        self
    }

    /// Records `$unset path`.
    pub fn unset(&mut self, path: impl Into<String>) -> &mut Self {
        // The store ignores the operand; the conventional placeholder is "".
        self.unset.insert(path.into(), Value::String(String::new()));
        self
    }

    /// Records `$inc path += delta`.
    pub fn inc(&mut self, path: impl Into<String>, delta: Value) -> &mut Self {
        self.inc.insert(path.into(), delta);
        self
    }

    /// Records `$push path value`.
    pub fn push(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.push.insert(path.into(), value);
        self
    }

    /// Records `$push path {"$each": values}`.
    pub fn push_each(&mut self, path: impl Into<String>, values: Vec<Value>) -> &mut Self {
        self.push.insert(path.into(), json!({ "$each": values }));
        self
    }

    /// Records `$pull path value`.
    pub fn pull(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.pull.insert(path.into(), value);
        self
    }

    /// Records `$addToSet path value`.
    pub fn add_to_set(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.add_to_set.insert(path.into(), value);
        self
    }

    /// Records `$pullAll path values`.
    pub fn pull_all(&mut self, path: impl Into<String>, values: Vec<Value>) -> &mut Self {
        self.pull_all.insert(path.into(), Value::Array(values));
        self
    }

    /// Registers a positional predicate for a `$[identifier]` segment.
    pub fn add_array_filter(&mut self, filter: ArrayFilter) -> &mut Self {
        self.array_filters.push(filter);
        self
    }

    /// Allocates the next synthetic array-filter identifier for this
    /// descriptor (`elem0`, `elem1`, ...).
    #[must_use]
    pub fn next_identifier(&self) -> String {
        format!("elem{}", self.array_filters.len())
    }

    /// Merges another descriptor into this one.
    ///
    /// Later entries win on path collisions within the same operator.
    /// The other descriptor's array filters are appended; callers are
    /// responsible for identifier uniqueness across merged descriptors.
    pub fn merge(&mut self, other: UpdateDocument) {
        self.set.extend(other.set);
        self.unset.extend(other.unset);
        self.inc.extend(other.inc);
        self.push.extend(other.push);
        self.pull.extend(other.pull);
        self.add_to_set.extend(other.add_to_set);
        self.pull_all.extend(other.pull_all);
        self.array_filters.extend(other.array_filters);
    }

    /// Renders the descriptor as a single multi-operator update message.
    ///
    /// Only non-empty operators appear in the output. An empty descriptor
    /// renders as `{}`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        for (operator, entries) in [
            ("$set", &self.set),
            ("$unset", &self.unset),
            ("$inc", &self.inc),
            ("$push", &self.push),
            ("$pull", &self.pull),
            ("$addToSet", &self.add_to_set),
            ("$pullAll", &self.pull_all),
        ] {
            if !entries.is_empty() {
                let doc: Map<String, Value> =
                    entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                out.insert(operator.to_string(), Value::Object(doc));
            }
        }
        Value::Object(out)
    }
}

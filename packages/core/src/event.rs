//! Change-feed event types.
//!
//! [`ChangeEvent`] is the raw shape a backing store's change feed emits:
//! operation kind, document key, and (with full-document lookup enabled)
//! the post-image. [`WatchEvent`] is the decoded, subscriber-facing form
//! carrying a typed document and, for engine-synthesized updates, the diff
//! that produced the new state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::update::UpdateDocument;

/// Kind of mutation observed on the change feed.
///
/// Stores that report raw `insert` events map them to [`Create`] at the
/// feed boundary; `update`, `replace`, and `delete` pass through unchanged.
///
/// [`Create`]: OperationType::Create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A document was inserted.
    Create,
    /// A document was partially updated.
    Update,
    /// A document was replaced wholesale.
    Replace,
    /// A document was deleted.
    Delete,
}

impl OperationType {
    /// All operation kinds, in feed order.
    pub const ALL: [Self; 4] = [Self::Create, Self::Update, Self::Replace, Self::Delete];
}

/// A raw change-feed event.
///
/// The id is kept in serialized form; consumers decode it against their
/// document type's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Mutation kind.
    pub operation: OperationType,
    /// Serialized document key.
    pub id: Value,
    /// Post-image of the document, when full-document lookup is enabled.
    /// Absent for deletes.
    pub full_document: Option<Value>,
}

/// A decoded change event delivered to watch subscribers.
#[derive(Debug, Clone)]
pub struct WatchEvent<D: Document> {
    /// Identity of the mutated document.
    pub id: D::Id,
    /// Mutation kind.
    pub operation: OperationType,
    /// Decoded post-image, when available.
    pub document: Option<D>,
    /// The update that produced the new state. Present on every update the
    /// engine synthesizes for its own mutations; optional when the event
    /// was derived from the raw feed.
    pub diff: Option<UpdateDocument>,
}

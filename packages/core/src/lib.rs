//! Vellum core: document capability traits, update descriptors, and
//! structural diffing.
//!
//! This crate is runtime-agnostic (no async, no I/O). It defines the shapes
//! shared between the engine, its cache backends, and its backing stores:
//!
//! - [`Document`] / [`DocumentId`]: the capability a user record type must
//!   satisfy to be stored (identity, version accessor pair, serde).
//! - [`UpdateDocument`] / [`ArrayFilter`]: a multi-operator update message
//!   in the backing store's update language.
//! - [`build_diff`]: structural diff of two documents, rendered as an
//!   [`UpdateDocument`].
//! - [`apply_update`]: the inverse operation, applying an update message to
//!   a JSON document tree.
//! - [`ChangeEvent`] / [`WatchEvent`]: raw change-feed events and their
//!   decoded, subscriber-facing form.

pub mod apply;
pub mod clock;
pub mod diff;
pub mod document;
pub mod event;
pub mod update;

pub use apply::{apply_update, ApplyError};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use diff::{build_diff, DiffError};
pub use document::{Document, DocumentId};
pub use event::{ChangeEvent, OperationType, WatchEvent};
pub use update::{ArrayFilter, UpdateDocument};

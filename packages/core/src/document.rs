//! Document capability traits.
//!
//! A record type becomes storable by implementing [`Document`]: it exposes an
//! identity, a monotonically increasing integer version through a paired
//! read/write accessor, and serde support for the serialized field shape the
//! diff builder and backing stores operate on. Deep copy is `Clone` --
//! documents own their data, so a clone is an independent value.
//!
//! Version semantics: 0 is reserved for "uninitialized / not present", a
//! freshly created document carries version 1, and every successful mutation
//! increments the stored version by exactly 1.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Version value of a document that has never been persisted.
pub const VERSION_UNINITIALIZED: i64 = 0;

/// Version assigned to a freshly inserted document.
pub const VERSION_INITIAL: i64 = 1;

/// Bound alias for document identity values.
///
/// Identities are opaque to the engine: they only need to be totally
/// ordered, hashable, printable (cache backends derive string keys from
/// them), and serializable (the change feed carries them as JSON).
///
/// Blanket-implemented for every type satisfying the bounds; `String`,
/// integers, and newtype ids all qualify.
pub trait DocumentId:
    Clone + Eq + Ord + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> DocumentId for T where
    T: Clone
        + Eq
        + Ord
        + Hash
        + Debug
        + Display
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Capability a user record type must satisfy to be stored by the engine.
///
/// The version accessor pair is the engine's sole token for optimistic
/// concurrency: [`Document::version`] reads it, [`Document::set_version`]
/// writes it. The serialized form must expose the version under the field
/// name configured as the engine's `version_field`, so the conditional
/// update predicate and the version bump address the same attribute.
pub trait Document: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identity attribute type.
    type Id: DocumentId;

    /// Returns this document's identity.
    fn id(&self) -> Self::Id;

    /// Reads the optimistic-concurrency version.
    fn version(&self) -> i64;

    /// Writes the optimistic-concurrency version.
    fn set_version(&mut self, version: i64);
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Account {
        id: String,
        balance: i64,
        version: i64,
    }

    impl Document for Account {
        type Id = String;

        fn id(&self) -> String {
            self.id.clone()
        }

        fn version(&self) -> i64 {
            self.version
        }

        fn set_version(&mut self, version: i64) {
            self.version = version;
        }
    }

    #[test]
    fn version_accessor_pair_round_trips() {
        let mut doc = Account {
            id: "a-1".to_string(),
            balance: 10,
            version: VERSION_UNINITIALIZED,
        };
        assert_eq!(doc.version(), 0);

        doc.set_version(VERSION_INITIAL);
        assert_eq!(doc.version(), 1);
    }

    #[test]
    fn clone_is_an_independent_deep_copy() {
        let original = Account {
            id: "a-1".to_string(),
            balance: 10,
            version: 1,
        };
        let mut copy = original.clone();
        copy.balance = 99;
        copy.set_version(2);

        assert_eq!(original.balance, 10);
        assert_eq!(original.version(), 1);
    }

    #[test]
    fn string_and_integer_ids_satisfy_the_bound() {
        fn assert_id<T: DocumentId>() {}
        assert_id::<String>();
        assert_id::<u64>();
        assert_id::<i32>();
    }
}

//! Object model for the mink resource store
//!
//! This crate defines the `Object` trait which every storable resource type
//! implements, together with the shared metadata shapes, the label/field
//! selector grammar, list plumbing, and the typed watch event enum. The
//! storage engine itself lives in `mink-store`; nothing in this crate touches
//! a database.

pub mod event;
pub mod fields;
pub mod list;
pub mod meta;
pub mod scheme;
pub mod selector;

pub use event::WatchEvent;
pub use fields::{FieldRequirement, FieldSelector};
pub use list::{ListOptions, ObjectList};
pub use meta::{GroupKind, GroupVersionKind, ObjectMeta};
pub use scheme::Scheme;
pub use selector::{LabelSelector, Operator, Requirement, SelectorParseError};

use serde::{de::DeserializeOwned, Serialize};

/// A storable API object.
///
/// Implementations are plain serde types shaped like a Kubernetes resource:
/// a `metadata` block plus arbitrary spec fields and an optional `status`
/// block. The serialized form is what the store persists, minus the
/// server-managed metadata keys which live in typed columns.
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The group/version/kind this type is stored under.
    fn group_version_kind() -> GroupVersionKind;

    /// Table the records of this type are persisted in.
    ///
    /// Defaults to the lowercased kind.
    fn table_name() -> String {
        Self::group_version_kind().kind.to_lowercase()
    }

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

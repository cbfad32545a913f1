//! Type registry.

use crate::meta::GroupVersionKind;
use crate::Object;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Registry of the object types a store factory serves.
///
/// Kinds register themselves when a strategy is built for them; the registry
/// is what the API layer consults to route incoming group/version/kind
/// triples to tables.
#[derive(Debug, Default)]
pub struct Scheme {
    types: RwLock<BTreeMap<GroupVersionKind, String>>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<O: Object>(&self) {
        self.types
            .write()
            .insert(O::group_version_kind(), O::table_name());
    }

    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.types.read().contains_key(gvk)
    }

    /// Table a registered kind is stored in.
    pub fn table_name(&self, gvk: &GroupVersionKind) -> Option<String> {
        self.types.read().get(gvk).cloned()
    }

    pub fn group_version_kinds(&self) -> Vec<GroupVersionKind> {
        self.types.read().keys().cloned().collect()
    }
}

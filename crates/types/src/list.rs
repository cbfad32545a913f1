//! List options and the list envelope.

use crate::fields::FieldSelector;
use crate::selector::LabelSelector;
use serde::{Deserialize, Serialize};

/// Options accepted by list and watch calls.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<FieldSelector>,
    /// Maximum number of items per page; zero means unbounded.
    pub limit: i64,
    /// Opaque continuation token from a previous page.
    pub continue_token: String,
    /// For watch: resume after this resource version. For list: ignored,
    /// the store always serves from a fresh snapshot.
    pub resource_version: String,
    /// Accepted for interface compatibility; lists are always served from
    /// a fresh snapshot, so no match strategy changes the result.
    pub resource_version_match: String,
    /// Opt in to periodic bookmark events on watch.
    pub allow_watch_bookmarks: bool,
}

/// A page of objects together with the collection's resource version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "O: serde::de::DeserializeOwned"))]
pub struct ObjectList<O> {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(
        rename = "continue",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub continue_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_item_count: Option<i64>,
    pub items: Vec<O>,
}

impl<O> Default for ObjectList<O> {
    fn default() -> Self {
        Self {
            resource_version: String::new(),
            continue_token: String::new(),
            remaining_item_count: None,
            items: Vec::new(),
        }
    }
}

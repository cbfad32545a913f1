//! Error types surfaced by the store.

use mink_types::GroupVersionKind;
use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Message attached to conflicts caused by a stale resource version.
pub const OPTIMISTIC_LOCK_MESSAGE: &str =
    "the object has been modified; please apply your changes to the latest version and try again";

/// Errors surfaced to the API layer. Each variant maps onto one HTTP-level
/// failure kind; everything else is an internal error carried transparently.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{} {name:?} not found", .gvk.kind)]
    NotFound { gvk: GroupVersionKind, name: String },

    #[error("{} {name:?} already exists", .gvk.kind)]
    AlreadyExists { gvk: GroupVersionKind, name: String },

    #[error("conflict on {} {name:?}: {message}", .gvk.kind)]
    Conflict {
        gvk: GroupVersionKind,
        name: String,
        message: String,
    },

    #[error("resource version {requested} is before current compaction {compaction}")]
    ResourceExpired { requested: i64, compaction: i64 },

    #[error("partition ID required")]
    PartitionRequired,

    #[error("invalid continue token: {0}")]
    InvalidContinueToken(String),

    #[error("invalid resource version {0:?}")]
    InvalidResourceVersion(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Database(#[from] DbErr),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(gvk: &GroupVersionKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            gvk: gvk.clone(),
            name: name.into(),
        }
    }

    pub fn already_exists(gvk: &GroupVersionKind, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            gvk: gvk.clone(),
            name: name.into(),
        }
    }

    pub fn conflict(
        gvk: &GroupVersionKind,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            gvk: gvk.clone(),
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_resource_expired(&self) -> bool {
        matches!(self, Self::ResourceExpired { .. })
    }
}

/// Whether a database error is a unique-constraint violation.
///
/// `sql_err` covers the common path; the code probes below catch drivers
/// that only surface the dialect error code (MySQL 1062, SQLite 19/2067,
/// PostgreSQL 23505).
pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }
    let text = err.to_string();
    text.contains("1062")
        || text.contains("2067")
        || text.contains("code: 19")
        || text.contains("23505")
        || text.contains("UNIQUE constraint failed")
        || text.contains("Duplicate entry")
}

/// Convert a duplicate-`previous` insert failure into the user-visible
/// optimistic-lock conflict; pass every other error through unchanged.
pub(crate) fn translate_unique_violation(
    err: StoreError,
    gvk: &GroupVersionKind,
    name: &str,
) -> StoreError {
    match err {
        StoreError::Database(db) if is_unique_violation(&db) => {
            StoreError::conflict(gvk, name, OPTIMISTIC_LOCK_MESSAGE)
        }
        other => other,
    }
}

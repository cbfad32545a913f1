//! The record row and query criteria.

use chrono::{DateTime, Utc};
use mink_types::{FieldSelector, LabelSelector};
use sea_orm::{DeriveIden, FromQueryResult};
use serde_json::Value;

/// One immutable version of one object.
///
/// Rows are only ever appended; after insert the sole mutations are the
/// `latest` flip on the predecessor row and the `garbage` flip during
/// compaction. A row with an empty `name` is a sentinel: a fill marker
/// (empty `namespace`) closing an id gap, or a compaction marker
/// (`namespace` holding the new horizon id in decimal).
#[derive(Debug, Clone, PartialEq, FromQueryResult)]
pub struct Record {
    pub id: i64,
    pub partition_id: String,
    pub api_group: String,
    pub kind: String,
    pub version: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub generation: i64,
    /// Id of the immediately prior row for this key; unique, which is what
    /// turns concurrent successors into exactly one winner.
    pub previous: Option<i64>,
    /// True iff this row is the initial creation of its key.
    pub create: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Set when deletion was requested but finalizers remained.
    pub deleted: Option<DateTime<Utc>>,
    /// Set once no finalizers remain; the key is then free for re-creation.
    pub removed: Option<DateTime<Utc>>,
    pub garbage: bool,
    pub latest: bool,
    pub metadata: Option<Value>,
    pub data: Option<Value>,
    pub status: Option<Value>,
}

impl Record {
    /// A blank record; callers fill in what they need.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            partition_id: String::new(),
            api_group: String::new(),
            kind: String::new(),
            version: String::new(),
            namespace: String::new(),
            name: String::new(),
            uid: String::new(),
            generation: 0,
            previous: None,
            create: false,
            created: now,
            updated: now,
            deleted: None,
            removed: None,
            garbage: false,
            latest: false,
            metadata: None,
            data: None,
            status: None,
        }
    }

    /// Fill sentinel closing the id gap at `id`.
    pub fn fill(id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            ..Self::empty(now)
        }
    }

    /// Compaction marker declaring everything at or below `horizon`
    /// compacted.
    pub fn compaction_marker(horizon: i64, now: DateTime<Utc>) -> Self {
        Self {
            namespace: horizon.to_string(),
            ..Self::empty(now)
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.name.is_empty()
    }

    /// The horizon a compaction marker carries, if this row is one.
    pub fn compaction_horizon(&self) -> Option<i64> {
        if self.name.is_empty() && !self.namespace.is_empty() {
            self.namespace.parse().ok()
        } else {
            None
        }
    }
}

/// Predicates for a point-in-time query against the log.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    pub name: String,
    pub namespace: Option<String>,
    /// Exclusive lower id bound.
    pub after: i64,
    /// Inclusive upper id bound; zero resolves to the current tip snapshot.
    pub before: i64,
    /// Skip the tip snapshot entirely; used by write paths that do not
    /// need a consistent collection version.
    pub no_resource_version: bool,
    pub limit: i64,
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<FieldSelector>,
    pub include_deleted: bool,
    pub include_gc: bool,
    pub partition_id: String,
    /// Only set on the catch-up phase of a watch, which already holds the
    /// compaction read lock.
    pub(crate) ignore_compaction_check: bool,
}

/// Predicates for a watch subscription.
#[derive(Debug, Clone, Default)]
pub struct WatchCriteria {
    pub name: String,
    pub namespace: Option<String>,
    /// Exclusive resume point.
    pub after: i64,
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<FieldSelector>,
    pub partition_id: String,
}

/// Column identifiers for the per-kind record tables. The table itself is
/// named at runtime, so every statement pairs these with a dynamic alias.
#[derive(DeriveIden, Debug, Clone, Copy)]
pub(crate) enum RecordCol {
    Id,
    PartitionId,
    ApiGroup,
    Kind,
    Version,
    Namespace,
    Name,
    Uid,
    Generation,
    Previous,
    Create,
    Created,
    Updated,
    Deleted,
    Removed,
    Garbage,
    Latest,
    Metadata,
    Data,
    Status,
}

/// Narrow projection used by the compaction scan.
#[derive(Debug, Clone, FromQueryResult)]
pub(crate) struct GcRow {
    pub id: i64,
    pub name: String,
    pub removed: Option<DateTime<Utc>>,
    pub previous: Option<i64>,
}

#[derive(Debug, Clone, FromQueryResult)]
pub(crate) struct IdRow {
    pub id: i64,
}

#[derive(Debug, Clone, FromQueryResult)]
pub(crate) struct MaxIdRow {
    pub id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compaction_marker_round_trip() {
        let marker = Record::compaction_marker(42, Utc::now());
        assert!(marker.is_sentinel());
        assert_eq!(marker.compaction_horizon(), Some(42));
    }

    #[test]
    fn fill_sentinel_carries_no_horizon() {
        let fill = Record::fill(7, Utc::now());
        assert!(fill.is_sentinel());
        assert_eq!(fill.compaction_horizon(), None);
    }
}

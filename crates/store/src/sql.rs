//! SQL statement builders for the per-kind record tables.
//!
//! Tables are named at runtime (one per kind), so everything here is built
//! with the query builders against a dynamic table alias rather than a
//! static entity. Label and field selectors compile to JSON path probes
//! whose syntax differs per dialect; `json_probe` is the single place that
//! knows the three spellings.

use crate::errors::StoreError;
use crate::record::{Criteria, Record, RecordCol};
use chrono::{DateTime, Utc};
use mink_types::{FieldSelector, LabelSelector, Operator, Requirement};
use sea_orm::sea_query::{
    Alias, Asterisk, ColumnDef, Expr, Index, IndexCreateStatement, InsertStatement, JoinType,
    Order, Query, SelectStatement, SimpleExpr, Table, TableCreateStatement, UpdateStatement,
    DeleteStatement,
};
use sea_orm::{DatabaseBackend, DbErr};

fn tbl(table: &str) -> Alias {
    Alias::new(table)
}

pub(crate) fn create_table_stmt(table: &str) -> TableCreateStatement {
    Table::create()
        .table(tbl(table))
        .if_not_exists()
        .col(
            ColumnDef::new(RecordCol::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new(RecordCol::PartitionId)
                .string()
                .not_null()
                .default(""),
        )
        .col(ColumnDef::new(RecordCol::ApiGroup).string().not_null().default(""))
        .col(ColumnDef::new(RecordCol::Kind).string().not_null().default(""))
        .col(ColumnDef::new(RecordCol::Version).string().not_null().default(""))
        .col(ColumnDef::new(RecordCol::Namespace).string().not_null().default(""))
        .col(ColumnDef::new(RecordCol::Name).string().not_null().default(""))
        .col(ColumnDef::new(RecordCol::Uid).string().not_null().default(""))
        .col(
            ColumnDef::new(RecordCol::Generation)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(RecordCol::Previous).big_integer().null())
        .col(
            ColumnDef::new(RecordCol::Create)
                .boolean()
                .not_null()
                .default(false),
        )
        .col(
            ColumnDef::new(RecordCol::Created)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(RecordCol::Updated)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(RecordCol::Deleted)
                .timestamp_with_time_zone()
                .null(),
        )
        .col(
            ColumnDef::new(RecordCol::Removed)
                .timestamp_with_time_zone()
                .null(),
        )
        .col(
            ColumnDef::new(RecordCol::Garbage)
                .boolean()
                .not_null()
                .default(false),
        )
        .col(
            ColumnDef::new(RecordCol::Latest)
                .boolean()
                .not_null()
                .default(false),
        )
        .col(ColumnDef::new(RecordCol::Metadata).json_binary().null())
        .col(ColumnDef::new(RecordCol::Data).json_binary().null())
        .col(ColumnDef::new(RecordCol::Status).json_binary().null())
        .to_owned()
}

/// Composite key index, the unique `previous` anchor, and the two flag
/// indices. Executed best-effort: duplicates from an earlier boot are
/// ignored by the caller.
pub(crate) fn index_stmts(table: &str) -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .name(format!("idx_{}_key_id", table))
            .table(tbl(table))
            .col(RecordCol::PartitionId)
            .col(RecordCol::Namespace)
            .col(RecordCol::Name)
            .col(RecordCol::Id)
            .to_owned(),
        Index::create()
            .name(format!("idx_{}_previous", table))
            .table(tbl(table))
            .col(RecordCol::Previous)
            .unique()
            .to_owned(),
        Index::create()
            .name(format!("idx_{}_garbage", table))
            .table(tbl(table))
            .col(RecordCol::Garbage)
            .to_owned(),
        Index::create()
            .name(format!("idx_{}_latest", table))
            .table(tbl(table))
            .col(RecordCol::Latest)
            .to_owned(),
    ]
}

/// JSON path probe on a blob column, yielding the unquoted text value at
/// the path or SQL NULL when the path is absent.
fn json_probe(backend: DatabaseBackend, column: &str, path: &[&str]) -> SimpleExpr {
    match backend {
        DatabaseBackend::MySql => Expr::cust_with_values(
            format!("JSON_UNQUOTE(JSON_EXTRACT({}, ?))", column),
            [dotted_json_path(path)],
        ),
        DatabaseBackend::Sqlite => Expr::cust_with_values(
            format!("json_extract({}, ?)", column),
            [dotted_json_path(path)],
        ),
        DatabaseBackend::Postgres => Expr::cust_with_values(
            format!("CAST({} AS jsonb) #>> CAST($1 AS text[])", column),
            [pg_text_array_path(path)],
        ),
    }
}

/// `$."a"."b"`, understood by both MySQL and SQLite.
fn dotted_json_path(path: &[&str]) -> String {
    let mut out = String::from("$");
    for part in path {
        out.push_str(&format!(
            ".\"{}\"",
            part.replace('\\', "\\\\").replace('"', "\\\"")
        ));
    }
    out
}

/// `{"a","b"}`, a PostgreSQL text[] literal for the `#>>` operator.
fn pg_text_array_path(path: &[&str]) -> String {
    let parts: Vec<String> = path
        .iter()
        .map(|p| format!("\"{}\"", p.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", parts.join(","))
}

fn label_condition(backend: DatabaseBackend, req: &Requirement) -> SimpleExpr {
    let probe = Expr::expr(json_probe(backend, "metadata", &["labels", &req.key]));
    let value = || req.values.first().cloned().unwrap_or_default();
    match req.operator {
        Operator::Equals => probe.eq(value()),
        Operator::NotEquals => probe.ne(value()),
        Operator::In => probe.is_in(req.values.clone()),
        Operator::NotIn => probe.is_not_in(req.values.clone()),
        Operator::Exists => probe.is_not_null(),
        Operator::DoesNotExist => probe.is_null(),
    }
}

fn apply_selectors(
    query: &mut SelectStatement,
    backend: DatabaseBackend,
    labels: Option<&LabelSelector>,
    fields: Option<&FieldSelector>,
) {
    if let Some(selector) = labels {
        for req in selector.requirements() {
            if req.key.is_empty() {
                continue;
            }
            query.and_where(label_condition(backend, req));
        }
    }
    if let Some(selector) = fields {
        for req in selector.requirements() {
            // metadata.name and metadata.namespace were already rewritten
            // into primary predicates; other metadata fields are not
            // queryable and are skipped. Only equality can be pushed down.
            let parts: Vec<&str> = req.field.split('.').collect();
            if parts.first() == Some(&"metadata") || req.operator != Operator::Equals {
                continue;
            }
            let probe = Expr::expr(json_probe(backend, "data", &parts));
            query.and_where(probe.eq(req.value.clone()));
        }
    }
}

/// Inner stage of the two-stage plan: latest id per key under the
/// criteria's predicates.
fn possible_ids(table: &str, criteria: &Criteria, before: i64) -> SelectStatement {
    let mut query = Query::select();
    query
        .from(tbl(table))
        .column(RecordCol::Namespace)
        .column(RecordCol::Name)
        .expr_as(Expr::col(RecordCol::Id).max(), Alias::new("id"))
        .group_by_col(RecordCol::Namespace)
        .group_by_col(RecordCol::Name);

    if !criteria.partition_id.is_empty() {
        query.and_where(Expr::col(RecordCol::PartitionId).eq(criteria.partition_id.clone()));
    }
    if let Some(namespace) = &criteria.namespace {
        query.and_where(Expr::col(RecordCol::Namespace).eq(namespace.clone()));
    }
    if !criteria.name.is_empty() {
        query.and_where(Expr::col(RecordCol::Name).eq(criteria.name.clone()));
    } else {
        // keep fill and compaction sentinels out of list results
        query.and_where(Expr::col(RecordCol::Name).ne(""));
    }
    if criteria.after != 0 {
        query.and_where(Expr::col(RecordCol::Id).gt(criteria.after));
    }
    if before > 0 {
        query.and_where(Expr::col(RecordCol::Id).lte(before));
    }
    if !criteria.include_gc {
        query.and_where(Expr::col(RecordCol::Garbage).eq(false));
    }
    query
}

/// The full two-stage read: latest-per-key ids joined back to the table,
/// with row-level predicates and selectors applied on the joined rows.
pub(crate) fn select_records(
    backend: DatabaseBackend,
    table: &str,
    criteria: &Criteria,
    before: i64,
) -> SelectStatement {
    let t = tbl(table);
    let j = Alias::new("j");

    let mut query = Query::select();
    query
        .column((t.clone(), Asterisk))
        .from(t.clone())
        .join_subquery(
            JoinType::InnerJoin,
            possible_ids(table, criteria, before),
            j.clone(),
            Expr::col((j, Alias::new("id"))).equals((t.clone(), RecordCol::Id)),
        );

    if !criteria.include_deleted {
        query.and_where(Expr::col((t.clone(), RecordCol::Removed)).is_null());
    }
    apply_selectors(
        &mut query,
        backend,
        criteria.label_selector.as_ref(),
        criteria.field_selector.as_ref(),
    );
    query.order_by((t, RecordCol::Id), Order::Asc);
    if criteria.limit > 0 {
        query.limit(criteria.limit as u64);
    }
    query
}

pub(crate) fn insert_record(table: &str, rec: &Record) -> Result<InsertStatement, StoreError> {
    let mut cols = vec![
        RecordCol::PartitionId,
        RecordCol::ApiGroup,
        RecordCol::Kind,
        RecordCol::Version,
        RecordCol::Namespace,
        RecordCol::Name,
        RecordCol::Uid,
        RecordCol::Generation,
        RecordCol::Previous,
        RecordCol::Create,
        RecordCol::Created,
        RecordCol::Updated,
        RecordCol::Deleted,
        RecordCol::Removed,
        RecordCol::Garbage,
        RecordCol::Latest,
        RecordCol::Metadata,
        RecordCol::Data,
        RecordCol::Status,
    ];
    let mut vals: Vec<SimpleExpr> = vec![
        rec.partition_id.clone().into(),
        rec.api_group.clone().into(),
        rec.kind.clone().into(),
        rec.version.clone().into(),
        rec.namespace.clone().into(),
        rec.name.clone().into(),
        rec.uid.clone().into(),
        rec.generation.into(),
        rec.previous.into(),
        rec.create.into(),
        rec.created.into(),
        rec.updated.into(),
        rec.deleted.into(),
        rec.removed.into(),
        rec.garbage.into(),
        rec.latest.into(),
        rec.metadata.clone().into(),
        rec.data.clone().into(),
        rec.status.clone().into(),
    ];
    // Sentinel fills are written at an explicit id to close a gap; all
    // other rows take the next sequence value.
    if rec.id != 0 {
        cols.push(RecordCol::Id);
        vals.push(rec.id.into());
    }

    let mut stmt = Query::insert();
    stmt.into_table(tbl(table))
        .columns(cols)
        .values(vals)
        .map_err(|e| StoreError::Database(DbErr::Custom(e.to_string())))?;
    Ok(stmt.to_owned())
}

pub(crate) fn flip_latest_stmt(table: &str, id: i64, latest: bool) -> UpdateStatement {
    Query::update()
        .table(tbl(table))
        .value(RecordCol::Latest, latest)
        .and_where(Expr::col(RecordCol::Id).eq(id))
        .to_owned()
}

pub(crate) fn since_stmt(table: &str, id: i64) -> SelectStatement {
    Query::select()
        .column(Asterisk)
        .from(tbl(table))
        .and_where(Expr::col(RecordCol::Id).gt(id))
        .order_by(RecordCol::Id, Order::Asc)
        .to_owned()
}

pub(crate) fn max_id_stmt(table: &str) -> SelectStatement {
    Query::select()
        .expr_as(Expr::col(RecordCol::Id).max(), Alias::new("id"))
        .from(tbl(table))
        .to_owned()
}

/// Smallest id not yet compacted away; seeds the GC scan cursor.
pub(crate) fn min_live_id_stmt(table: &str) -> SelectStatement {
    Query::select()
        .column(RecordCol::Id)
        .from(tbl(table))
        .and_where(Expr::col(RecordCol::Garbage).eq(false))
        .order_by(RecordCol::Id, Order::Asc)
        .limit(1)
        .to_owned()
}

pub(crate) fn last_record_stmt(table: &str) -> SelectStatement {
    Query::select()
        .column(Asterisk)
        .from(tbl(table))
        .order_by(RecordCol::Id, Order::Desc)
        .limit(1)
        .to_owned()
}

/// Narrow scan of one compaction batch: `from` inclusive, `to` exclusive.
pub(crate) fn gc_scan_stmt(table: &str, from: i64, to: i64) -> SelectStatement {
    Query::select()
        .columns([
            RecordCol::Id,
            RecordCol::Name,
            RecordCol::Removed,
            RecordCol::Previous,
        ])
        .from(tbl(table))
        .and_where(Expr::col(RecordCol::Id).gte(from))
        .and_where(Expr::col(RecordCol::Id).lt(to))
        .to_owned()
}

pub(crate) fn mark_garbage_stmt(table: &str, ids: &[i64]) -> UpdateStatement {
    Query::update()
        .table(tbl(table))
        .value(RecordCol::Garbage, true)
        .and_where(Expr::col(RecordCol::Garbage).eq(false))
        .and_where(Expr::col(RecordCol::Id).is_in(ids.iter().copied()))
        .to_owned()
}

pub(crate) fn garbage_ids_stmt(table: &str, limit: u64) -> SelectStatement {
    Query::select()
        .column(RecordCol::Id)
        .from(tbl(table))
        .and_where(Expr::col(RecordCol::Garbage).eq(true))
        .order_by(RecordCol::Id, Order::Asc)
        .limit(limit)
        .to_owned()
}

pub(crate) fn delete_ids_stmt(table: &str, ids: &[i64]) -> DeleteStatement {
    Query::delete()
        .from_table(tbl(table))
        .and_where(Expr::col(RecordCol::Id).is_in(ids.iter().copied()))
        .to_owned()
}

/// `previous` values referenced by more than one row: a branched history.
pub(crate) fn duplicate_previous_stmt(table: &str) -> SelectStatement {
    Query::select()
        .expr_as(Expr::col(RecordCol::Previous), Alias::new("id"))
        .from(tbl(table))
        .and_where(Expr::col(RecordCol::Previous).is_not_null())
        .group_by_col(RecordCol::Previous)
        .and_having(Expr::expr(Expr::col(RecordCol::Id).count()).gt(1))
        .to_owned()
}

pub(crate) fn children_of_stmt(table: &str, previous: i64) -> SelectStatement {
    Query::select()
        .column(Asterisk)
        .from(tbl(table))
        .and_where(Expr::col(RecordCol::Previous).eq(previous))
        .order_by(RecordCol::Id, Order::Asc)
        .to_owned()
}

/// Tombstone every live row of a logical key.
pub(crate) fn tombstone_key_stmt(
    table: &str,
    partition_id: &str,
    namespace: &str,
    name: &str,
    now: DateTime<Utc>,
) -> UpdateStatement {
    Query::update()
        .table(tbl(table))
        .value(RecordCol::Deleted, now)
        .value(RecordCol::Removed, now)
        .and_where(Expr::col(RecordCol::PartitionId).eq(partition_id))
        .and_where(Expr::col(RecordCol::Namespace).eq(namespace))
        .and_where(Expr::col(RecordCol::Name).eq(name))
        .and_where(Expr::col(RecordCol::Removed).is_null())
        .to_owned()
}

pub(crate) fn delete_row_stmt(table: &str, id: i64) -> DeleteStatement {
    Query::delete()
        .from_table(tbl(table))
        .and_where(Expr::col(RecordCol::Id).eq(id))
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::sea_query::{MysqlQueryBuilder, PostgresQueryBuilder, SqliteQueryBuilder};

    #[test]
    fn json_paths_are_escaped() {
        assert_eq!(dotted_json_path(&["labels", "a\"b"]), "$.\"labels\".\"a\\\"b\"");
        assert_eq!(pg_text_array_path(&["labels", "x"]), "{\"labels\",\"x\"}");
    }

    #[test]
    fn select_renders_on_every_dialect() {
        let criteria = Criteria {
            namespace: Some("ns".into()),
            label_selector: Some(LabelSelector::parse("a=1,b in (2,3),!c").unwrap()),
            field_selector: Some(FieldSelector::parse("spec.nodeName=x,metadata.other=y").unwrap()),
            limit: 10,
            ..Default::default()
        };
        for backend in [
            DatabaseBackend::Sqlite,
            DatabaseBackend::MySql,
            DatabaseBackend::Postgres,
        ] {
            let stmt = select_records(backend, "pod", &criteria, 100);
            let (sql, _) = match backend {
                DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
                DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
                DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
            };
            assert!(sql.to_lowercase().contains("max("), "missing group stage: {}", sql);
            assert!(!sql.contains("metadata.other"), "metadata field leaked: {}", sql);
        }
    }

    #[test]
    fn fill_insert_carries_explicit_id() {
        let rec = Record::fill(9, Utc::now());
        let stmt = insert_record("pod", &rec).unwrap();
        let (sql, values) = stmt.build(SqliteQueryBuilder);
        assert!(sql.contains("\"id\""));
        assert_eq!(values.0.len(), 20);
    }
}

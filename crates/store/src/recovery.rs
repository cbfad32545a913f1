//! Corruption recovery at table open.
//!
//! A history branch (two rows chaining from the same `previous`) can only
//! exist if the unique index was missing or broken at some point. Recovery
//! is deliberately blunt: the whole branched key is tombstoned and the
//! newest offending row dropped, repeatedly until no branches remain. The
//! repair is logged loudly and counted, never reported to callers.

use crate::errors::StoreError;
use crate::log::RecordLog;
use crate::record::{IdRow, Record};
use crate::sql;
use chrono::Utc;
use sea_orm::{ConnectionTrait, FromQueryResult};
use std::sync::atomic::Ordering;
use tracing::error;

pub(crate) async fn repair_branches(log: &RecordLog) -> Result<(), StoreError> {
    loop {
        let branched = duplicate_previous(log).await?;
        if branched.is_empty() {
            return Ok(());
        }

        for previous in branched {
            let children = children_of(log, previous).await?;
            let Some(newest) = children.last() else {
                continue;
            };
            if children.len() < 2 {
                continue;
            }

            error!(
                "branched history in [{}]: rows {:?} share previous {}; \
                 tombstoning key {}/{} and dropping row {}",
                log.table(),
                children.iter().map(|r| r.id).collect::<Vec<_>>(),
                previous,
                newest.namespace,
                newest.name,
                newest.id
            );

            let now = Utc::now();
            let stmt = log.backend().build(&sql::tombstone_key_stmt(
                log.table(),
                &newest.partition_id,
                &newest.namespace,
                &newest.name,
                now,
            ));
            log.conn().execute(stmt).await?;

            let stmt = log
                .backend()
                .build(&sql::delete_row_stmt(log.table(), newest.id));
            log.conn().execute(stmt).await?;

            log.metrics()
                .repaired_branches
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn duplicate_previous(log: &RecordLog) -> Result<Vec<i64>, StoreError> {
    let stmt = log
        .backend()
        .build(&sql::duplicate_previous_stmt(log.table()));
    let rows = log.conn().query_all(stmt).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(IdRow::from_query_result(&row, "")?.id);
    }
    Ok(out)
}

async fn children_of(log: &RecordLog, previous: i64) -> Result<Vec<Record>, StoreError> {
    let stmt = log
        .backend()
        .build(&sql::children_of_stmt(log.table(), previous));
    let rows = log.conn().query_all(stmt).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(Record::from_query_result(&row, "")?);
    }
    Ok(out)
}

//! Compaction and deletion.
//!
//! One task per table. Each pass advances the compaction horizon to
//! `tip - compact_retain`, records that as a marker row so peer replicas
//! observe it, marks superseded and tombstoned rows as garbage in batches,
//! and finally deletes all but the newest `delete_retain` garbage rows.

use crate::errors::StoreError;
use crate::log::{RecordLog, WATCH_POLL};
use crate::record::{GcRow, IdRow, Record};
use crate::sql;
use chrono::Utc;
use rand::Rng;
use sea_orm::{ConnectionTrait, FromQueryResult, TransactionTrait};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error};

const COMPACT_BATCH: i64 = 1000;
const DELETE_BATCH: i64 = 1000;

/// Uniform delay in `[base, base * (1 + max_factor))`; a non-positive
/// factor means `[base, 2 * base)`.
fn jitter(base: Duration, max_factor: f64) -> Duration {
    let factor = if max_factor <= 0.0 { 1.0 } else { max_factor };
    base + base.mul_f64(rand::thread_rng().gen::<f64>() * factor)
}

impl RecordLog {
    pub(crate) async fn gc_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let retention = self.retention().clone();
        if retention.compact_retain == 0 {
            debug!("compaction and deletion disabled for [{}]", self.table());
            return;
        }

        let mut last_success: i64 = 0;
        // first pass runs early so a freshly started table is not a full
        // interval behind
        let mut delay = jitter(retention.gc_interval.min(Duration::from_secs(10)), 2.0);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                _ = sleep(delay) => {}
            }
            delay = jitter(retention.gc_interval, 0.0);

            if last_success == 0 {
                debug!("starting compaction pass for [{}]", self.table());
                match self.min_live_id().await {
                    Ok(id) => last_success = id,
                    Err(err) => error!("failed to get minimum id for compaction: {}", err),
                }
            }

            let tip = self.last_seen.load(Ordering::SeqCst);
            if tip < retention.compact_retain {
                continue;
            }
            let next_horizon = tip - retention.compact_retain;
            if next_horizon <= *self.compaction.read().await {
                continue;
            }

            let proceed = match self.mark_compaction(next_horizon).await {
                Ok(proceed) => proceed,
                Err(err) => {
                    error!(
                        "failed to write compaction record [{}] {}: {}",
                        self.table(),
                        next_horizon,
                        err
                    );
                    continue;
                }
            };
            if !proceed {
                debug!("skipping compaction [{}]", self.table());
                continue;
            }

            {
                let mut compaction = self.compaction.write().await;
                if next_horizon > *compaction {
                    *compaction = next_horizon;
                }
            }

            // let peers observe the marker before rows start disappearing
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = sleep(WATCH_POLL * 2) => {}
            }

            while last_success < next_horizon {
                if *shutdown.borrow() {
                    return;
                }
                let batch_end = (last_success + COMPACT_BATCH).min(next_horizon);
                debug!(
                    "running compaction [{}] {} => {}",
                    self.table(),
                    last_success,
                    batch_end
                );

                let rows = match self.gc_scan(last_success, batch_end).await {
                    Ok(rows) => rows,
                    Err(err) => {
                        error!(
                            "failed running compaction [{}] {} => {}: {}",
                            self.table(),
                            last_success,
                            batch_end,
                            err
                        );
                        break;
                    }
                };

                let mut ids = Vec::new();
                for row in rows {
                    // a newer row supersedes its predecessor
                    if let Some(previous) = row.previous {
                        ids.push(previous);
                    }
                    // fill sentinels and tombstones are garbage themselves
                    if row.name.is_empty() || row.removed.is_some() {
                        ids.push(row.id);
                    }
                }

                if !ids.is_empty() {
                    match self.mark_garbage(&ids).await {
                        Ok(marked) if marked > 0 => {
                            debug!("compacted [{}] [{}] rows", self.table(), marked)
                        }
                        Ok(_) => {}
                        Err(err) => error!(
                            "failed updating compaction [{}] {} => {}: {}",
                            self.table(),
                            last_success,
                            batch_end,
                            err
                        ),
                    }
                }

                last_success = batch_end;
            }

            if retention.delete_retain == 0 {
                debug!("deletion disabled for [{}]", self.table());
                continue;
            }

            loop {
                if *shutdown.borrow() {
                    return;
                }
                let ids = match self
                    .garbage_ids((retention.delete_retain + DELETE_BATCH) as u64)
                    .await
                {
                    Ok(ids) => ids,
                    Err(err) => {
                        error!("failed finding deletions [{}]: {}", self.table(), err);
                        break;
                    }
                };

                if ids.len() as i64 > retention.delete_retain {
                    // keep the newest delete_retain garbage rows
                    let cut = ids.len() - retention.delete_retain as usize;
                    let doomed = &ids[..cut];
                    debug!(
                        "deleting [{}] records for [{}]",
                        doomed.len(),
                        self.table()
                    );
                    if let Err(err) = self.delete_ids(doomed).await {
                        error!("failed running deletion [{}]: {}", self.table(), err);
                        break;
                    }
                } else {
                    break;
                }
            }
        }
    }

    /// Insert a compaction marker at `horizon`, unless the table's last row
    /// already is one; back-to-back markers would otherwise become the only
    /// new data in the table and feed each other forever.
    async fn mark_compaction(&self, horizon: i64) -> Result<bool, StoreError> {
        let txn = self.conn().begin().await?;

        let last = txn
            .query_one(self.backend().build(&sql::last_record_stmt(self.table())))
            .await?
            .map(|row| Record::from_query_result(&row, ""))
            .transpose()?;
        if let Some(last) = &last {
            if last.name.is_empty() && !last.namespace.is_empty() {
                txn.commit().await?;
                return Ok(false);
            }
        }

        debug!(
            "inserting compaction record for [{}] [{}]",
            self.table(),
            horizon
        );
        let mut marker = Record::compaction_marker(horizon, Utc::now());
        self.insert_in(&txn, &mut marker).await?;
        txn.commit().await?;
        self.trigger_watch();
        Ok(true)
    }

    async fn gc_scan(&self, from: i64, to: i64) -> Result<Vec<GcRow>, StoreError> {
        let stmt = self.backend().build(&sql::gc_scan_stmt(self.table(), from, to));
        let rows = self.conn().query_all(stmt).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(GcRow::from_query_result(&row, "")?);
        }
        Ok(out)
    }

    async fn mark_garbage(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let stmt = self.backend().build(&sql::mark_garbage_stmt(self.table(), ids));
        let result = self.conn().execute(stmt).await?;
        Ok(result.rows_affected())
    }

    async fn garbage_ids(&self, limit: u64) -> Result<Vec<i64>, StoreError> {
        let stmt = self.backend().build(&sql::garbage_ids_stmt(self.table(), limit));
        let rows = self.conn().query_all(stmt).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(IdRow::from_query_result(&row, "")?.id);
        }
        Ok(out)
    }

    async fn delete_ids(&self, ids: &[i64]) -> Result<(), StoreError> {
        let stmt = self.backend().build(&sql::delete_ids_stmt(self.table(), ids));
        self.conn().execute(stmt).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = jitter(base, 2.0);
            assert!(d >= base && d < base * 3);
            let d = jitter(base, 0.0);
            assert!(d >= base && d < base * 2);
        }
    }
}

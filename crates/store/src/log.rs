//! The append-only record log for one table.
//!
//! `RecordLog` owns the table's database access plus the shared state its
//! background tasks coordinate through: the watch trigger, the broadcaster,
//! the in-memory compaction horizon and the watch loop's last-seen id. The
//! watch loop itself lives in `watch`, compaction and deletion in `gc`.

use crate::config::RetentionConfig;
use crate::errors::StoreError;
use crate::metrics::StoreMetrics;
use crate::record::{Criteria, MaxIdRow, Record, RecordCol};
use crate::sql;
use mink_channel::Broadcaster;
use mink_types::GroupVersionKind;
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr, FromQueryResult, TransactionTrait,
};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

pub(crate) const WATCH_POLL: std::time::Duration = std::time::Duration::from_secs(2);

pub struct RecordLog {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    table: String,
    gvk: GroupVersionKind,
    retention: RetentionConfig,
    metrics: Arc<StoreMetrics>,

    /// Single-slot wakeup for the watch loop; sends never block.
    trigger: mpsc::Sender<()>,
    trigger_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,

    pub(crate) broadcaster: Broadcaster<Record>,
    /// Producer side of the broadcaster, used by the watch loop.
    pub(crate) publish: mpsc::Sender<Record>,

    /// Compaction horizon. Readers (queries, watch catch-ups) hold the read
    /// half across their row fetch; the compactor takes the write half only
    /// while advancing.
    pub(crate) compaction: Arc<RwLock<i64>>,
    /// Tip id the watch loop has processed, read by the compactor.
    pub(crate) last_seen: AtomicI64,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RecordLog {
    pub(crate) fn new(
        conn: DatabaseConnection,
        table: String,
        gvk: GroupVersionKind,
        retention: RetentionConfig,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        let backend = conn.get_database_backend();
        let (trigger, trigger_rx) = mpsc::channel(1);
        let broadcaster = Broadcaster::new();
        let publish = broadcaster.sender();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            conn,
            backend,
            table,
            gvk,
            retention,
            metrics,
            trigger,
            trigger_rx: parking_lot::Mutex::new(Some(trigger_rx)),
            broadcaster,
            publish,
            compaction: Arc::new(RwLock::new(0)),
            last_seen: AtomicI64::new(0),
            shutdown_tx,
            shutdown_rx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub(crate) fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub(crate) fn retention(&self) -> &RetentionConfig {
        &self.retention
    }

    pub(crate) fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Spawn the broadcaster pump, the watch loop and the GC task. The
    /// horizon starts at the current tip: everything already in the table
    /// is assumed compacted until proven otherwise.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        let tip = self.max_id(&self.conn).await?;
        *self.compaction.write().await = tip;

        let mut tasks = Vec::with_capacity(3);

        let log = Arc::clone(self);
        let shutdown = self.shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            log.broadcaster.run(shutdown).await;
        }));

        if let Some(trigger_rx) = self.trigger_rx.lock().take() {
            let log = Arc::clone(self);
            let shutdown = self.shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                log.watch_loop(shutdown, trigger_rx).await;
            }));
        }

        let log = Arc::clone(self);
        let shutdown = self.shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            log.gc_loop(shutdown).await;
        }));

        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Stop all background tasks for this table.
    pub(crate) fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Non-blocking wakeup; a full slot means a wakeup is already pending.
    pub(crate) fn trigger_watch(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Append a record in its own transaction: the predecessor's `latest`
    /// flag is flipped off atomically with the insert.
    pub(crate) async fn insert(&self, rec: &mut Record) -> Result<(), StoreError> {
        let txn = self.conn.begin().await?;
        let result = self.insert_in(&txn, rec).await;
        match result {
            Ok(()) => {
                txn.commit().await?;
                self.trigger_watch();
                Ok(())
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }

    /// Append within a caller-owned transaction. The caller is responsible
    /// for triggering the watch loop after commit.
    pub(crate) async fn insert_in<C: ConnectionTrait>(
        &self,
        db: &C,
        rec: &mut Record,
    ) -> Result<(), StoreError> {
        if let Some(previous) = rec.previous {
            db.execute(
                self.backend
                    .build(&sql::flip_latest_stmt(&self.table, previous, false)),
            )
            .await?;
        }
        if !rec.name.is_empty() {
            rec.latest = true;
        }

        let mut stmt = sql::insert_record(&self.table, rec)?;
        if rec.id != 0 {
            // fill sentinel at an explicit id
            db.execute(self.backend.build(&stmt)).await?;
        } else if self.backend == DatabaseBackend::MySql {
            let result = db.execute(self.backend.build(&stmt)).await?;
            rec.id = result.last_insert_id() as i64;
        } else {
            stmt.returning_col(RecordCol::Id);
            let row = db
                .query_one(self.backend.build(&stmt))
                .await?
                .ok_or_else(|| DbErr::Custom("insert returned no row".to_string()))?;
            rec.id = row.try_get("", "id")?;
        }
        Ok(())
    }

    /// Two-stage latest-per-key read. Returns the matching records in id
    /// order together with the resolved snapshot version.
    ///
    /// Unless the criteria opted out, the compaction read lock is held from
    /// the window validation through the row fetch so the horizon cannot
    /// advance underneath the read.
    pub(crate) async fn query<C: ConnectionTrait>(
        &self,
        db: &C,
        criteria: &Criteria,
    ) -> Result<(Vec<Record>, i64), StoreError> {
        let mut before = criteria.before;
        if criteria.no_resource_version {
            before = 0;
        } else if before == 0 {
            before = self.max_id(db).await?;
        }

        let stmt = self
            .backend
            .build(&sql::select_records(self.backend, &self.table, criteria, before));

        let rows = if criteria.ignore_compaction_check {
            db.query_all(stmt).await?
        } else {
            let horizon = self.compaction.read().await;
            self.validate_window(criteria.before, criteria.after, *horizon)?;
            db.query_all(stmt).await?
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(Record::from_query_result(&row, "")?);
        }
        Ok((records, before))
    }

    /// All rows above `id`, in id order. The watch loop's poll read.
    pub(crate) async fn since(&self, id: i64) -> Result<Vec<Record>, StoreError> {
        let stmt = self.backend.build(&sql::since_stmt(&self.table, id));
        let rows = self.conn.query_all(stmt).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(Record::from_query_result(&row, "")?);
        }
        Ok(records)
    }

    pub(crate) async fn max_id<C: ConnectionTrait>(&self, db: &C) -> Result<i64, StoreError> {
        let stmt = self.backend.build(&sql::max_id_stmt(&self.table));
        let row = db.query_one(stmt).await?;
        Ok(row
            .map(|r| MaxIdRow::from_query_result(&r, ""))
            .transpose()?
            .and_then(|r| r.id)
            .unwrap_or(0))
    }

    pub(crate) async fn min_live_id(&self) -> Result<i64, StoreError> {
        let stmt = self.backend.build(&sql::min_live_id_stmt(&self.table));
        let row = self.conn.query_one(stmt).await?;
        Ok(row
            .map(|r| crate::record::IdRow::from_query_result(&r, ""))
            .transpose()?
            .map(|r| r.id)
            .unwrap_or(0))
    }

    pub(crate) async fn last_record(&self) -> Result<Option<Record>, StoreError> {
        let stmt = self.backend.build(&sql::last_record_stmt(&self.table));
        let row = self.conn.query_one(stmt).await?;
        Ok(row.map(|r| Record::from_query_result(&r, "")).transpose()?)
    }

    pub(crate) fn validate_window(
        &self,
        before: i64,
        after: i64,
        horizon: i64,
    ) -> Result<(), StoreError> {
        if before != 0 && before < horizon {
            return Err(StoreError::ResourceExpired {
                requested: before,
                compaction: horizon,
            });
        }
        if after != 0 && after < horizon {
            return Err(StoreError::ResourceExpired {
                requested: after,
                compaction: horizon,
            });
        }
        Ok(())
    }
}

//! The per-table watch loop and watcher pipeline.
//!
//! One background loop per table tails the log and publishes every new row
//! on the broadcaster. Individual watchers splice a paginated catch-up read
//! in front of their live subscription and deduplicate at the seam by the
//! last delivered id.

use crate::log::{RecordLog, WATCH_POLL};
use crate::record::{Criteria, Record, WatchCriteria};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::errors::StoreError;

const BOOKMARK_INTERVAL: Duration = Duration::from_secs(60);
const CATCH_UP_PAGE: i64 = 1000;

impl RecordLog {
    /// Tail the table until shutdown. Wakes on the insert trigger or on a
    /// short poll period, whichever comes first; the poll bounds liveness
    /// when a trigger is lost to the single-slot channel.
    pub(crate) async fn watch_loop(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut trigger: mpsc::Receiver<()>,
    ) {
        let mut last_id: i64 = 0;
        let mut init = true;
        let mut last_activity = Instant::now();

        loop {
            // published for the compactor
            self.last_seen.store(last_id, Ordering::SeqCst);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("watch loop for [{}] shutting down", self.table());
                        return;
                    }
                    continue;
                }
                _ = sleep(WATCH_POLL) => {}
                _ = trigger.recv() => {}
            }

            match self.read_events(init, last_id).await {
                Ok(id) => {
                    init = false;
                    if id != last_id {
                        last_activity = Instant::now();
                    }
                    last_id = id;
                }
                Err(err) => {
                    info!("watch loop read failed for [{}]: {}", self.table(), err);
                    continue;
                }
            }

            // Idle tables still owe their watchers a fresh resume point.
            if last_activity.elapsed() >= BOOKMARK_INTERVAL {
                self.send_bookmark(last_id).await;
                last_activity = Instant::now();
            }
        }
    }

    /// Read and publish everything past `last_id`. On the first pass the
    /// tip is re-read from the table so restarts resume at the end of the
    /// log. Returns the new last-seen id; once rows have been published no
    /// error is returned, because the id of the last published row must
    /// survive in memory.
    async fn read_events(&self, init: bool, last_id: i64) -> Result<i64, StoreError> {
        let mut last_id = if init {
            self.max_id(self.conn()).await?
        } else {
            last_id
        };

        let records = self.since(last_id).await?;

        for record in records {
            if record.id != last_id + 1 {
                // A transaction consumed a sequence id and rolled back;
                // plug the hole so the stream stays gap-free and retry on
                // the next wake.
                self.fill_gap(last_id + 1).await;
                return Ok(last_id);
            }
            if let Some(horizon) = record.compaction_horizon() {
                let mut compaction = self.compaction.write().await;
                if horizon > *compaction {
                    *compaction = horizon;
                }
            }
            let id = record.id;
            if self.publish.send(record).await.is_err() {
                return Ok(last_id);
            }
            last_id = id;
        }

        Ok(last_id)
    }

    async fn send_bookmark(&self, last_id: i64) {
        let _ = self.publish.send(Record::fill(last_id, Utc::now())).await;
    }

    async fn fill_gap(&self, id: i64) {
        let mut rec = Record::fill(id, Utc::now());
        if let Err(err) = self.insert(&mut rec).await {
            info!("failed to insert fill record for id {}: {}", id, err);
        }
    }

    /// Open a watcher: validate the resume point under the compaction read
    /// lock, splice catch-up in front of the live feed, and deliver records
    /// in strictly increasing id order until the receiver is dropped or the
    /// table shuts down.
    pub(crate) async fn watch(
        self: &Arc<Self>,
        criteria: WatchCriteria,
    ) -> Result<mpsc::Receiver<Record>, StoreError> {
        let sub = self.broadcaster.subscribe().await;

        // Held (moved into the catch-up task) until catch-up completes, so
        // the horizon cannot advance past the rows being replayed.
        let guard = Arc::clone(&self.compaction).read_owned().await;
        if let Err(err) = self.validate_window(0, criteria.after, *guard) {
            drop(guard);
            sub.close().await;
            return Err(err);
        }

        let (handle, sub_rx) = sub.split();
        let handle = Arc::new(Mutex::new(Some(handle)));
        let (init_tx, init_rx) = mpsc::channel::<Record>(1);
        let mut merged = mink_channel::concat(init_rx, sub_rx);
        let (out_tx, out_rx) = mpsc::channel::<Record>(1);

        let log = Arc::clone(self);
        let catch_up_criteria = criteria;
        let catch_up_handle = Arc::clone(&handle);
        let mut catch_up_shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let result = log
                .initialize_watch(&catch_up_criteria, &init_tx, &mut catch_up_shutdown)
                .await;
            drop(guard);
            drop(init_tx);
            if let Err(err) = result {
                error!(
                    "error initializing watch for kind {}: {}",
                    log.gvk().kind,
                    err
                );
                // Detaching closes the live feed, which ends the stream
                // once the records already sent are drained.
                if let Some(handle) = catch_up_handle.lock().await.take() {
                    handle.close().await;
                }
            }
        });

        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let mut last_id: i64 = 0;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    rec = merged.recv() => {
                        let Some(rec) = rec else { break };
                        // the seam between catch-up and live feed can
                        // present the same id twice
                        if last_id != 0 && rec.id <= last_id {
                            continue;
                        }
                        last_id = rec.id;
                        if out_tx.send(rec).await.is_err() {
                            break;
                        }
                    }
                }
            }
            if let Some(handle) = handle.lock().await.take() {
                handle.close().await;
            }
        });

        Ok(out_rx)
    }

    /// Replay all matching records in `(after, tip]`, paginated. Runs with
    /// the compaction read lock already held by the caller.
    async fn initialize_watch(
        &self,
        criteria: &WatchCriteria,
        out: &mpsc::Sender<Record>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), StoreError> {
        let mut before = 0i64;
        let mut after = criteria.after;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let page = Criteria {
                name: criteria.name.clone(),
                namespace: criteria.namespace.clone(),
                after,
                before,
                limit: CATCH_UP_PAGE,
                label_selector: criteria.label_selector.clone(),
                field_selector: criteria.field_selector.clone(),
                partition_id: criteria.partition_id.clone(),
                ignore_compaction_check: true,
                ..Default::default()
            };
            let (records, new_before) = self.query(self.conn(), &page).await?;
            let full_page = records.len() as i64 == CATCH_UP_PAGE;

            let mut last = after;
            for record in records {
                last = record.id;
                if out.send(record).await.is_err() {
                    return Ok(());
                }
            }

            if full_page {
                before = new_before;
                after = last;
            } else {
                return Ok(());
            }
        }
    }
}

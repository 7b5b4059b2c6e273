//! Log saver and retention sweeper
//!
//! The saver is the single consumer of the watcher channel. Every record
//! becomes one atomic batch in the log store: the per-row history entry and
//! the time-index entry together (schema changes get a single `ddl/` key).
//! Store failures are retried with backoff up to a fixed budget, then the
//! record is logged and skipped - a poison record never stalls the
//! pipeline.
//!
//! The sweeper enforces retention per table: the newest `min_log_num`
//! entries per primary key are kept unconditionally, everything older than
//! `outdate_days` beyond that floor is deleted. Writer and sweeper
//! serialize per table through [`TableLocks`] so a sweep sees a consistent
//! count.

use crate::common::{ChangeAction, ChangeRecord, ExponentialBackoff, Result, TablePolicy};
use crate::registry::PolicyRegistry;
use crate::store::{
    ddl_entry_key, ddl_prefix, key_after, millis_from_entry_key, pk_entry_key, pk_from_index_key,
    pk_index_prefix, prefix_end, time_index_prefix, LogStore,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WRITE_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

const SWEEP_SCAN_BATCH: usize = 1000;

/// Per-table mutexes serializing the saver against the sweeper.
#[derive(Default)]
pub struct TableLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TableLocks {
    /// Get (or create) the lock for one table.
    pub fn for_table(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("table locks poisoned");
        locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Single-writer drain of the watcher channel into the log store.
pub struct LogSaver {
    store: Arc<dyn LogStore>,
    locks: Arc<TableLocks>,
}

impl LogSaver {
    /// Create a saver over the given store.
    pub fn new(store: Arc<dyn LogStore>, locks: Arc<TableLocks>) -> Self {
        Self { store, locks }
    }

    /// Spawn the writer task consuming `rx` until the channel closes or
    /// shutdown (with a bounded best-effort drain).
    pub fn spawn(
        self,
        rx: mpsc::Receiver<ChangeRecord>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(rx, cancel).await;
        })
    }

    async fn run(&self, mut rx: mpsc::Receiver<ChangeRecord>, cancel: CancellationToken) {
        info!("log saver started");
        loop {
            tokio::select! {
                record = rx.recv() => {
                    match record {
                        Some(record) => self.save(record).await,
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    self.drain(&mut rx).await;
                    break;
                }
            }
        }
        info!("log saver stopped");
    }

    /// Best-effort drain of buffered records after shutdown, bounded by
    /// the drain deadline.
    async fn drain(&self, rx: &mut mpsc::Receiver<ChangeRecord>) {
        let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
        let mut drained = 0usize;
        while let Ok(Some(record)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            self.save(record).await;
            drained += 1;
            if tokio::time::Instant::now() >= deadline {
                warn!(drained, "drain deadline reached with records remaining");
                return;
            }
        }
        debug!(drained, "drained buffered records");
    }

    /// Write one record, retrying transient store failures. After the
    /// retry budget the record is logged and dropped.
    async fn save(&self, record: ChangeRecord) {
        let mut backoff = ExponentialBackoff::new(RETRY_BASE, RETRY_MAX);
        loop {
            match self.write(&record).await {
                Ok(()) => return,
                Err(e) if backoff.attempt() < WRITE_RETRIES && e.is_retriable() => {
                    let wait = backoff.next_backoff();
                    warn!(
                        table = %record.table,
                        pk = %record.primary_key,
                        error = %e,
                        ?wait,
                        "store write failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    error!(
                        table = %record.table,
                        pk = %record.primary_key,
                        seq = record.seq,
                        error = %e,
                        "giving up on record after retries"
                    );
                    return;
                }
            }
        }
    }

    async fn write(&self, record: &ChangeRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        let millis = record.timestamp_millis();

        let lock = self.locks.for_table(&record.table);
        let _guard = lock.lock().await;

        match record.action {
            ChangeAction::Ddl => {
                self.store
                    .put(&ddl_entry_key(&record.table, millis, record.seq), &value)
                    .await
            }
            _ => {
                // Both index entries land atomically or not at all
                self.store
                    .batch_put(&[
                        (
                            pk_entry_key(&record.table, &record.primary_key, millis, record.seq),
                            value.clone(),
                        ),
                        (
                            crate::store::time_entry_key(
                                &record.table,
                                &record.primary_key,
                                millis,
                                record.seq,
                            ),
                            value,
                        ),
                    ])
                    .await
            }
        }
    }
}

/// Periodic retention enforcement.
pub struct RetentionSweeper {
    store: Arc<dyn LogStore>,
    registry: Arc<PolicyRegistry>,
    locks: Arc<TableLocks>,
    interval: Duration,
}

impl RetentionSweeper {
    /// Create a sweeper over the given store and registry.
    pub fn new(
        store: Arc<dyn LogStore>,
        registry: Arc<PolicyRegistry>,
        locks: Arc<TableLocks>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            interval,
        }
    }

    /// Spawn the periodic sweep task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh start
            // does not sweep before anything is written.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_all().await {
                            warn!(error = %e, "retention sweep failed");
                        }
                    }
                }
            }
            info!("retention sweeper stopped");
        })
    }

    /// Sweep every registered table once.
    pub async fn sweep_all(&self) -> Result<()> {
        for policy in self.registry.all() {
            let lock = self.locks.for_table(&policy.table_name);
            let _guard = lock.lock().await;
            let deleted = self.sweep_table(&policy).await?;
            let ddl_deleted = self.sweep_ddl(&policy).await?;
            if deleted + ddl_deleted > 0 {
                info!(
                    table = %policy.table_name,
                    deleted,
                    ddl_deleted,
                    "retention sweep"
                );
            }
        }
        Ok(())
    }

    /// Apply retention to one table's row history.
    ///
    /// Keys in the pk index are grouped by primary key and ordered newest
    /// first, so a single ordered walk can count the floor per key and
    /// delete the stale tail. Each deleted pk entry takes its time-index
    /// twin with it.
    async fn sweep_table(&self, policy: &TablePolicy) -> Result<usize> {
        let threshold = Utc::now().timestamp_millis()
            - i64::from(policy.outdate_days) * 24 * 60 * 60 * 1000;
        let index_prefix = pk_index_prefix(&policy.table_name);
        let end = prefix_end(&index_prefix);

        let mut doomed: Vec<String> = Vec::new();
        let mut current_pk = String::new();
        let mut kept_for_pk = 0u32;
        let mut from = index_prefix.clone();

        loop {
            let batch = self.store.scan(&from, &end, SWEEP_SCAN_BATCH).await?;
            let Some((last_key, _)) = batch.last() else {
                break;
            };
            from = key_after(last_key);

            for (key, _) in &batch {
                let Some(pk) = pk_from_index_key(key, &index_prefix) else {
                    continue;
                };
                if pk != current_pk {
                    current_pk = pk.to_string();
                    kept_for_pk = 0;
                }
                if kept_for_pk < policy.min_log_num {
                    kept_for_pk += 1;
                    continue;
                }
                match millis_from_entry_key(key) {
                    Some(millis) if millis < threshold => {
                        doomed.push(key.clone());
                        if let Some(twin) = time_twin_key(&policy.table_name, key, &index_prefix) {
                            doomed.push(twin);
                        }
                    }
                    _ => kept_for_pk += 1,
                }
            }
        }

        let deleted = doomed.len();
        self.store.delete_keys(&doomed).await?;
        Ok(deleted)
    }

    /// Schema-change history is bounded by age only.
    async fn sweep_ddl(&self, policy: &TablePolicy) -> Result<usize> {
        let threshold = Utc::now().timestamp_millis()
            - i64::from(policy.outdate_days) * 24 * 60 * 60 * 1000;
        let prefix = ddl_prefix(&policy.table_name);

        let mut doomed = Vec::new();
        let mut from = prefix.clone();
        loop {
            let batch = self
                .store
                .scan(&from, &prefix_end(&prefix), SWEEP_SCAN_BATCH)
                .await?;
            let Some((last_key, _)) = batch.last() else {
                break;
            };
            from = key_after(last_key);
            for (key, _) in &batch {
                if matches!(millis_from_entry_key(key), Some(millis) if millis < threshold) {
                    doomed.push(key.clone());
                }
            }
        }

        let deleted = doomed.len();
        self.store.delete_keys(&doomed).await?;
        Ok(deleted)
    }
}

/// Rebuild the time-index key matching a pk-index key.
fn time_twin_key(table: &str, pk_key: &str, index_prefix: &str) -> Option<String> {
    let pk = pk_from_index_key(pk_key, index_prefix)?;
    let rev_at = pk_key.rfind("/t/")?;
    let rev = &pk_key[rev_at + 3..];
    Some(format!("{}{}/pk/{}", time_index_prefix(table), rev, pk))
}

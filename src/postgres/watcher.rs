//! Event source
//!
//! Drains staged change events out of the source database and emits typed
//! [`ChangeRecord`]s on a bounded channel. Two acquisition modes, exactly
//! one active per instance:
//!
//! - **notify**: a dedicated connection LISTENs on the trigger's channel.
//!   Each notification carries a staging row id; the watcher fetches the
//!   row body by id and deletes it in one transaction (payloads can exceed
//!   the ~8 KiB NOTIFY cap), then sends the record and advances its ack
//!   cursor. A heartbeat ping detects dead connections; reconnects use
//!   exponential backoff and replay staging rows past the cursor.
//! - **poll**: the staging table is drained on a fixed interval, up to
//!   `per_read_num` rows per pass in id order.
//!
//! Backpressure is the bounded channel: a full buffer blocks the send,
//! which stalls draining. Events are never dropped silently.

use crate::common::{
    ChangeAction, ChangeRecord, EngineConfig, ExponentialBackoff, ReadMode, Result, StagingEvent,
    TrailError,
};
use crate::postgres::driver::PgDriver;
use crate::postgres::triggers::TriggerManager;
use crate::registry::PolicyRegistry;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Watches the staging table and emits change records.
pub struct EventSource {
    config: Arc<EngineConfig>,
    driver: Arc<PgDriver>,
    registry: Arc<PolicyRegistry>,
    triggers: Arc<TriggerManager>,
}

impl EventSource {
    /// Create a watcher over the given staging machinery.
    pub fn new(
        config: Arc<EngineConfig>,
        driver: Arc<PgDriver>,
        registry: Arc<PolicyRegistry>,
        triggers: Arc<TriggerManager>,
    ) -> Self {
        Self {
            config,
            driver,
            registry,
            triggers,
        }
    }

    /// Spawn the watcher task. The returned receiver is the single
    /// consumer side of the event channel; the channel closes when the
    /// watcher exits.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<ChangeRecord>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let handle = tokio::spawn(async move {
            let mode = self.config.read_mode;
            info!(?mode, "event source started");
            let outcome = match mode {
                ReadMode::Poll => self.run_poll(&tx, &cancel).await,
                ReadMode::Notify => self.run_notify(&tx, &cancel).await,
            };
            match outcome {
                Ok(()) | Err(TrailError::Canceled) => info!("event source stopped"),
                Err(e) => error!(error = %e, "event source failed"),
            }
        });
        (rx, handle)
    }

    // ---- poll mode --------------------------------------------------

    async fn run_poll(
        &self,
        tx: &mpsc::Sender<ChangeRecord>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    match self.drain_batch(tx, cancel).await {
                        Ok(0) => {}
                        Ok(n) => debug!(drained = n, "staging batch drained"),
                        Err(TrailError::Canceled) => return Ok(()),
                        Err(e) if e.is_retriable() => {
                            warn!(error = %e, "staging drain failed, will retry next tick");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Drain up to `per_read_num` staging rows in id order.
    async fn drain_batch(
        &self,
        tx: &mpsc::Sender<ChangeRecord>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let rows = self
            .driver
            .query(
                &format!(
                    "SELECT id, table_name, log, action, \"time\" \
                     FROM \"{}\" ORDER BY id ASC LIMIT $1",
                    self.config.temp_log_table
                ),
                &[&self.config.per_read_num],
            )
            .await?;

        let mut drained = 0usize;
        for row in rows {
            if cancel.is_cancelled() {
                return Err(TrailError::Canceled);
            }
            self.consume_row(&row, tx).await?;
            drained += 1;
        }
        Ok(drained)
    }

    // ---- notify mode ------------------------------------------------

    async fn run_notify(
        &self,
        tx: &mpsc::Sender<ChangeRecord>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut backoff = ExponentialBackoff::new(RECONNECT_BASE, RECONNECT_MAX);
        let mut last_acked: i64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.listen_session(tx, cancel, &mut last_acked).await {
                Ok(()) => return Ok(()),
                Err(TrailError::Canceled) => return Ok(()),
                Err(e) if e.is_retriable() => {
                    let wait = backoff.next_backoff();
                    warn!(error = %e, ?wait, "listen connection lost, reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One LISTEN session: connect, replay missed rows, then consume
    /// notifications until the connection dies or shutdown.
    async fn listen_session(
        &self,
        tx: &mpsc::Sender<ChangeRecord>,
        cancel: &CancellationToken,
        last_acked: &mut i64,
    ) -> Result<()> {
        let (client, mut connection) = tokio_postgres::connect(&self.config.dsn, NoTls).await?;

        // The connection future multiplexes query responses and async
        // notifications; pump it on its own task.
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            let mut stream =
                futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = stream.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        if notify_tx.send(n).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "listen connection error");
                        break;
                    }
                }
            }
        });

        let result = self
            .listen_loop(&client, &mut notify_rx, tx, cancel, last_acked)
            .await;
        pump.abort();
        result
    }

    async fn listen_loop(
        &self,
        client: &tokio_postgres::Client,
        notify_rx: &mut mpsc::UnboundedReceiver<tokio_postgres::Notification>,
        tx: &mpsc::Sender<ChangeRecord>,
        cancel: &CancellationToken,
        last_acked: &mut i64,
    ) -> Result<()> {
        client
            .batch_execute(&format!("LISTEN \"{}\"", self.config.notify_channel))
            .await?;
        info!(channel = %self.config.notify_channel, "listening");

        // Rows staged while we were away (or before first start)
        self.replay_staging(tx, cancel, last_acked).await?;

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                notification = notify_rx.recv() => {
                    let Some(notification) = notification else {
                        return Err(TrailError::pool("listen connection closed"));
                    };
                    let Some(id) = parse_notify_payload(notification.payload()) else {
                        warn!(payload = notification.payload(), "ignoring malformed notification");
                        continue;
                    };
                    if id <= *last_acked {
                        continue; // already replayed
                    }
                    if let Some(row) = self.take_staging_row(id).await? {
                        self.handle_row(&row, tx).await?;
                        *last_acked = id;
                    }
                }
                // Health check only; a dead connection surfaces here first
                _ = ping.tick() => {
                    client.simple_query("SELECT 1").await?;
                }
            }
        }
    }

    /// Replay staging rows past the ack cursor, in id order.
    async fn replay_staging(
        &self,
        tx: &mpsc::Sender<ChangeRecord>,
        cancel: &CancellationToken,
        last_acked: &mut i64,
    ) -> Result<()> {
        loop {
            let rows = self
                .driver
                .query(
                    &format!(
                        "SELECT id, table_name, log, action, \"time\" \
                         FROM \"{}\" WHERE id > $1 ORDER BY id ASC LIMIT $2",
                        self.config.temp_log_table
                    ),
                    &[&*last_acked, &self.config.per_read_num],
                )
                .await?;
            if rows.is_empty() {
                return Ok(());
            }
            let replayed = rows.len();
            for row in rows {
                if cancel.is_cancelled() {
                    return Err(TrailError::Canceled);
                }
                *last_acked = self.consume_row(&row, tx).await?;
            }
            debug!(replayed, cursor = *last_acked, "replayed staged rows");
        }
    }

    // ---- shared -----------------------------------------------------

    /// Fetch a staging row by id and delete it, both in one transaction.
    /// Returns `None` when the row was already replayed between
    /// notification and fetch.
    async fn take_staging_row(&self, id: i64) -> Result<Option<tokio_postgres::Row>> {
        self.driver
            .take_row(
                &format!(
                    "SELECT id, table_name, log, action, \"time\" \
                     FROM \"{}\" WHERE id = $1",
                    self.config.temp_log_table
                ),
                &format!("DELETE FROM \"{}\" WHERE id = $1", self.config.temp_log_table),
                id,
            )
            .await
    }

    /// Decode a staging row and dispatch it downstream.
    ///
    /// An undecodable row is logged and skipped rather than propagated - a
    /// poison row must not wedge the watcher. Returns the row's id.
    async fn handle_row(
        &self,
        row: &tokio_postgres::Row,
        tx: &mpsc::Sender<ChangeRecord>,
    ) -> Result<i64> {
        let id: i64 = row.try_get(0)?;
        match staging_event_from_row(row) {
            Ok(event) => self.dispatch(event, tx).await?,
            Err(e) => warn!(staging_id = id, error = %e, "skipping undecodable staging row"),
        }
        Ok(id)
    }

    /// Process one staging row end to end: decode, dispatch, delete.
    /// Used by the poll and replay paths, where the ack is the delete.
    async fn consume_row(
        &self,
        row: &tokio_postgres::Row,
        tx: &mpsc::Sender<ChangeRecord>,
    ) -> Result<i64> {
        let id = self.handle_row(row, tx).await?;
        self.delete_staging_row(id).await?;
        Ok(id)
    }

    async fn delete_staging_row(&self, id: i64) -> Result<()> {
        self.driver
            .execute(
                &format!("DELETE FROM \"{}\" WHERE id = $1", self.config.temp_log_table),
                &[&id],
            )
            .await?;
        Ok(())
    }

    /// Turn a staging event into a record and send it downstream.
    ///
    /// Rows for unwatched tables are skipped (their staging row is still
    /// deleted by the caller). Malformed payloads are logged and skipped so
    /// a poison row cannot wedge the pipeline. A ddl event on a watched
    /// table first asks the trigger manager to reinstall, since the schema
    /// change may have invalidated the trigger function.
    async fn dispatch(&self, event: StagingEvent, tx: &mpsc::Sender<ChangeRecord>) -> Result<()> {
        let Some(policy) = self.registry.get(&event.table_name) else {
            if !event.table_name.is_empty() {
                debug!(table = %event.table_name, "skipping event for unwatched table");
            }
            return Ok(());
        };

        if event.action == ChangeAction::Ddl {
            if let Err(e) = self.triggers.reinstall(&event.table_name).await {
                warn!(table = %event.table_name, error = %e, "trigger reinstall after ddl failed");
            }
        }

        let record = match ChangeRecord::from_staging(&event, &policy) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    table = %event.table_name,
                    staging_id = event.id,
                    error = %e,
                    "skipping malformed staging payload"
                );
                return Ok(());
            }
        };

        // Blocks when the buffer is full - intended backpressure. A closed
        // receiver means the saver is gone, i.e. shutdown.
        tx.send(record).await.map_err(|_| TrailError::Canceled)
    }
}

/// Build a [`StagingEvent`] from a staging table row.
fn staging_event_from_row(row: &tokio_postgres::Row) -> Result<StagingEvent> {
    let table_name: Option<String> = row.try_get(1)?;
    let action: String = row.try_get(3)?;
    Ok(StagingEvent {
        id: row.try_get(0)?,
        table_name: table_name.unwrap_or_default(),
        log: row.try_get(2)?,
        action: ChangeAction::parse(&action)?,
        time: row.try_get(4)?,
    })
}

/// Notification payloads carry the staging row id in decimal.
fn parse_notify_payload(payload: &str) -> Option<i64> {
    payload.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notify_payload() {
        assert_eq!(parse_notify_payload("42"), Some(42));
        assert_eq!(parse_notify_payload(" 7\n"), Some(7));
        assert_eq!(parse_notify_payload(""), None);
        assert_eq!(parse_notify_payload("{\"table\":\"notes\"}"), None);
    }

    #[test]
    fn test_reconnect_backoff_schedule() {
        let mut backoff = ExponentialBackoff::new(RECONNECT_BASE, RECONNECT_MAX);
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        for _ in 0..10 {
            assert!(backoff.next_backoff() <= RECONNECT_MAX);
        }
    }
}

//! # pgtrail - trigger-based change capture for PostgreSQL
//!
//! For each registered table, pgtrail installs a row-level trigger (and two
//! global DDL event triggers) that stage every INSERT, UPDATE, DELETE, and
//! schema change into an append-only staging table. A watcher drains the
//! staging table - via LISTEN/NOTIFY or polling - into a bounded channel; a
//! single writer lands each event in an embedded ordered KV log under
//! per-row and per-table time indices; a periodic sweeper enforces
//! per-table retention. The history API reconstructs any row's or table's
//! change history over a time window.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ triggers ┌──────────────┐ NOTIFY/poll ┌─────────────┐
//! │ PostgreSQL  │ ───────> │ staging table│ ──────────> │  EventSource │
//! └─────────────┘          └──────────────┘             └──────┬──────┘
//!                                                   bounded mpsc│
//!                                                               ▼
//! ┌─────────────┐  scans   ┌──────────────┐  batch_put  ┌─────────────┐
//! │ HistoryService│ <───── │  log store   │ <────────── │  LogSaver   │
//! └─────────────┘          │ (redb)       │ <── sweeps ─┤  + sweeper  │
//!                          └──────────────┘             └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pgtrail::{EngineConfig, PolicySpec, ReadMode, TrailEngine};
//!
//! # async fn example() -> pgtrail::Result<()> {
//! let config = EngineConfig::builder()
//!     .dsn("host=localhost user=postgres dbname=app")
//!     .read_mode(ReadMode::Notify)
//!     .log_data_path("./version")
//!     .build()?;
//!
//! let engine = TrailEngine::new(config)?;
//! engine.start().await?;
//! engine.register(PolicySpec::named("notes")).await?;
//!
//! let page = engine
//!     .history()
//!     .list_table_log("notes", "1", None, None, 1, 20)
//!     .await?;
//! # drop(page);
//! # engine.stop().await
//! # }
//! ```

pub mod common;
pub mod history;
pub mod postgres;
pub mod registry;
pub mod runtime;
pub mod saver;
pub mod store;

// Re-export the public surface at the crate root
pub use common::{
    Catalog, ChangeAction, ChangeRecord, EngineConfig, EngineConfigBuilder, FieldInfo, PolicySpec,
    ReadMode, RelationLink, Result, StagingEvent, StoreBackend, TableInfo, TablePolicy, TableRef,
    TableSchema, TrailError,
};
pub use history::HistoryService;
pub use postgres::{PgCatalog, PgDriver, TriggerManager};
pub use registry::{PolicyRegistry, PolicyUpdate};
pub use runtime::TrailEngine;
pub use store::{LogStore, RedbLogStore};

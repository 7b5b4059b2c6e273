//! PostgreSQL side of the engine: pooled driver, trigger installation,
//! and the staging-table watcher.

mod catalog;
mod driver;
mod triggers;
mod watcher;

pub use catalog::PgCatalog;
pub use driver::{ColumnInfo, PgDriver};
pub use triggers::{function_name, trigger_name, TriggerManager};
pub use watcher::EventSource;

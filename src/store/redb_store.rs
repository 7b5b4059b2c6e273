//! redb-backed log store
//!
//! Pure Rust ordered KV - zero C dependencies, ACID transactions, B-tree
//! range scans. One table holds every history entry; the key layout in
//! [`super`] keeps tables and rows from colliding.

use crate::common::{Result, TrailError};
use crate::store::LogStore;
use async_trait::async_trait;
use redb::{Database, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// History entries (key: encoded path, value: serialized record).
const LOG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("trail_log");

/// redb-backed [`LogStore`].
///
/// Writes go through single write transactions, so a batch is atomic and a
/// committed batch survives restart. Reads open snapshot transactions and
/// never block the writer.
pub struct RedbLogStore {
    db: Arc<Database>,
}

impl RedbLogStore {
    /// Open (or create) the store under the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| TrailError::store(format!("failed to create {}: {e}", dir.display())))?;
        let path = dir.join("trail.redb");

        let db = Database::create(&path)
            .map_err(|e| TrailError::store(format!("failed to open redb: {e}")))?;

        // Make sure the table exists before the first read
        {
            let write_txn = db
                .begin_write()
                .map_err(|e| TrailError::store(e.to_string()))?;
            {
                let _ = write_txn
                    .open_table(LOG_TABLE)
                    .map_err(|e| TrailError::store(e.to_string()))?;
            }
            write_txn
                .commit()
                .map_err(|e| TrailError::store(e.to_string()))?;
        }

        info!(path = %path.display(), "opened history log store");
        Ok(Self { db: Arc::new(db) })
    }

    fn write_pairs(&self, pairs: &[(String, Vec<u8>)]) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| TrailError::store(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(LOG_TABLE)
                .map_err(|e| TrailError::store(e.to_string()))?;
            for (key, value) in pairs {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(|e| TrailError::store(e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| TrailError::store(e.to_string()))
    }

    fn remove_keys(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| TrailError::store(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(LOG_TABLE)
                .map_err(|e| TrailError::store(e.to_string()))?;
            for key in keys {
                table
                    .remove(key.as_str())
                    .map_err(|e| TrailError::store(e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| TrailError::store(e.to_string()))
    }

    fn read_range(&self, from: &str, to: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| TrailError::store(e.to_string()))?;
        let table = read_txn
            .open_table(LOG_TABLE)
            .map_err(|e| TrailError::store(e.to_string()))?;

        let mut out = Vec::new();
        let iter = table
            .range(from..to)
            .map_err(|e| TrailError::store(e.to_string()))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| TrailError::store(e.to_string()))?;
            out.push((key.value().to_string(), value.value().to_vec()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl LogStore for RedbLogStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write_pairs(&[(key.to_string(), value.to_vec())])
    }

    async fn batch_put(&self, pairs: &[(String, Vec<u8>)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.write_pairs(pairs)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| TrailError::store(e.to_string()))?;
        let table = read_txn
            .open_table(LOG_TABLE)
            .map_err(|e| TrailError::store(e.to_string()))?;
        let value = table
            .get(key)
            .map_err(|e| TrailError::store(e.to_string()))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    async fn scan(&self, from: &str, to: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        self.read_range(from, to, limit)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        self.remove_keys(keys)
    }

    async fn delete_range(&self, from: &str, to: &str) -> Result<()> {
        // Collect-then-delete: range deletes are rare (retention only) and
        // redb wants the read finished before the write txn.
        let doomed: Vec<String> = self
            .read_range(from, to, usize::MAX)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        self.remove_keys(&doomed)
    }
}

//! Policy registry
//!
//! Per-table policies persisted in a small SQLite database, fronted by a
//! write-through in-memory cache. Reads (the per-event hot path) take a
//! shared lock on the cache and never touch SQLite; writes go to SQLite
//! first, then the cache.
//!
//! List-valued columns (`primary_fields`, `fields`) are stored
//! comma-joined, `relations` as `table.column`.

use crate::common::{RelationLink, Result, TablePolicy, TrailError};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Partial policy update, applied by [`PolicyRegistry::modify`].
#[derive(Debug, Default, Clone)]
pub struct PolicyUpdate {
    /// New retention age in days.
    pub outdate_days: Option<u32>,
    /// New sensed-field list.
    pub fields: Option<Vec<String>>,
    /// New retention floor.
    pub min_log_num: Option<u32>,
}

/// SQLite-persisted policy store with an in-memory cache.
pub struct PolicyRegistry {
    conn: Mutex<Connection>,
    cache: RwLock<HashMap<String, Arc<TablePolicy>>>,
}

impl PolicyRegistry {
    /// Open (or create) the registry at the given path and load every
    /// persisted policy into the cache.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TrailError::store(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| TrailError::store(format!("failed to open policy store: {e}")))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS policies (
                table_name     TEXT PRIMARY KEY,
                primary_fields TEXT NOT NULL,
                fields         TEXT NOT NULL,
                min_log_num    INTEGER NOT NULL,
                outdate_days   INTEGER NOT NULL,
                rela_field     TEXT,
                relations      TEXT
            );
            "#,
        )
        .map_err(store_err)?;

        let registry = Self {
            conn: Mutex::new(conn),
            cache: RwLock::new(HashMap::new()),
        };
        let loaded = registry.reload()?;
        info!(policies = loaded, path = %path.display(), "policy registry opened");
        Ok(registry)
    }

    /// Re-read every persisted policy into the cache. Returns the count.
    pub fn reload(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("policy store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT table_name, primary_fields, fields, min_log_num, outdate_days, \
                 rela_field, relations FROM policies",
            )
            .map_err(store_err)?;
        let policies = stmt
            .query_map([], row_to_policy)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<TablePolicy>>>()
            .map_err(store_err)?;
        drop(stmt);
        drop(conn);

        let mut cache = self.cache.write().expect("policy cache lock poisoned");
        cache.clear();
        for policy in policies {
            cache.insert(policy.table_name.clone(), Arc::new(policy));
        }
        Ok(cache.len())
    }

    /// Insert or replace a policy, write-through.
    pub fn upsert(&self, policy: TablePolicy) -> Result<()> {
        policy.validate()?;
        {
            let conn = self.conn.lock().expect("policy store lock poisoned");
            conn.execute(
                "INSERT OR REPLACE INTO policies \
                 (table_name, primary_fields, fields, min_log_num, outdate_days, rela_field, relations) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                policy_params(&policy),
            )
            .map_err(store_err)?;
        }
        self.cache
            .write()
            .expect("policy cache lock poisoned")
            .insert(policy.table_name.clone(), Arc::new(policy));
        Ok(())
    }

    /// Insert the policy only if no row exists for its table. Succeeds
    /// either way; returns whether a new row was written.
    pub fn create_no_exist(&self, policy: TablePolicy) -> Result<bool> {
        policy.validate()?;
        let inserted = {
            let conn = self.conn.lock().expect("policy store lock poisoned");
            conn.execute(
                "INSERT OR IGNORE INTO policies \
                 (table_name, primary_fields, fields, min_log_num, outdate_days, rela_field, relations) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                policy_params(&policy),
            )
            .map_err(store_err)?
                > 0
        };
        if inserted {
            self.cache
                .write()
                .expect("policy cache lock poisoned")
                .insert(policy.table_name.clone(), Arc::new(policy));
        }
        Ok(inserted)
    }

    /// Cached lookup by table name.
    pub fn get(&self, table: &str) -> Option<Arc<TablePolicy>> {
        self.cache
            .read()
            .expect("policy cache lock poisoned")
            .get(table)
            .cloned()
    }

    /// Whether a policy is registered for the table.
    pub fn contains(&self, table: &str) -> bool {
        self.cache
            .read()
            .expect("policy cache lock poisoned")
            .contains_key(table)
    }

    /// All registered policies.
    pub fn all(&self) -> Vec<Arc<TablePolicy>> {
        self.cache
            .read()
            .expect("policy cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Delete a table's policy. Missing rows are fine.
    pub fn delete(&self, table: &str) -> Result<()> {
        {
            let conn = self.conn.lock().expect("policy store lock poisoned");
            conn.execute("DELETE FROM policies WHERE table_name = ?1", params![table])
                .map_err(store_err)?;
        }
        self.cache
            .write()
            .expect("policy cache lock poisoned")
            .remove(table);
        debug!(table, "policy deleted");
        Ok(())
    }

    /// Apply a partial update to a registered policy.
    pub fn modify(&self, table: &str, update: PolicyUpdate) -> Result<Arc<TablePolicy>> {
        let current = self
            .get(table)
            .ok_or_else(|| TrailError::policy(format!("table {table:?} not registered")))?;

        let mut policy = (*current).clone();
        if let Some(days) = update.outdate_days {
            policy.outdate_days = days;
        }
        if let Some(fields) = update.fields {
            policy.fields = fields;
        }
        if let Some(n) = update.min_log_num {
            policy.min_log_num = n;
        }
        self.upsert(policy.clone())?;
        Ok(Arc::new(policy))
    }

    /// Direct (uncached) read, used by tests and reconciliation.
    pub fn get_persisted(&self, table: &str) -> Result<Option<TablePolicy>> {
        let conn = self.conn.lock().expect("policy store lock poisoned");
        conn.query_row(
            "SELECT table_name, primary_fields, fields, min_log_num, outdate_days, \
             rela_field, relations FROM policies WHERE table_name = ?1",
            params![table],
            row_to_policy,
        )
        .optional()
        .map_err(store_err)
    }
}

fn store_err(e: rusqlite::Error) -> TrailError {
    TrailError::store(format!("policy store: {e}"))
}

type PolicyRow = (
    String,
    String,
    String,
    u32,
    u32,
    Option<String>,
    Option<String>,
);

fn policy_params(policy: &TablePolicy) -> PolicyRow {
    (
        policy.table_name.clone(),
        policy.primary_fields.join(","),
        policy.fields.join(","),
        policy.min_log_num,
        policy.outdate_days,
        policy.relation.as_ref().map(|r| r.field.clone()),
        policy.relation.as_ref().map(|r| r.target()),
    )
}

fn row_to_policy(row: &rusqlite::Row) -> rusqlite::Result<TablePolicy> {
    let table_name: String = row.get(0)?;
    let primary_fields: String = row.get(1)?;
    let fields: String = row.get(2)?;
    let min_log_num: u32 = row.get(3)?;
    let outdate_days: u32 = row.get(4)?;
    let rela_field: Option<String> = row.get(5)?;
    let relations: Option<String> = row.get(6)?;

    let relation = match (rela_field, relations) {
        (Some(field), Some(target)) => RelationLink::parse(&field, &target).ok(),
        _ => None,
    };

    Ok(TablePolicy {
        table_name,
        primary_fields: split_list(&primary_fields),
        fields: split_list(&fields),
        min_log_num,
        outdate_days,
        relation,
    })
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policy(table: &str) -> TablePolicy {
        TablePolicy {
            table_name: table.to_string(),
            primary_fields: vec!["id".to_string()],
            fields: vec!["note".to_string(), "tag".to_string()],
            min_log_num: 10,
            outdate_days: 10,
            relation: None,
        }
    }

    fn open(dir: &TempDir) -> PolicyRegistry {
        PolicyRegistry::open(dir.path().join("policy.db")).unwrap()
    }

    #[test]
    fn test_upsert_get_delete() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir);

        registry.upsert(policy("notes")).unwrap();
        let cached = registry.get("notes").unwrap();
        assert_eq!(cached.fields, vec!["note", "tag"]);
        assert!(registry.contains("notes"));

        registry.delete("notes").unwrap();
        assert!(registry.get("notes").is_none());
        assert!(registry.get_persisted("notes").unwrap().is_none());
    }

    #[test]
    fn test_create_no_exist() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir);

        assert!(registry.create_no_exist(policy("notes")).unwrap());

        // second insert is a silent no-op
        let mut other = policy("notes");
        other.min_log_num = 99;
        assert!(!registry.create_no_exist(other).unwrap());
        assert_eq!(registry.get("notes").unwrap().min_log_num, 10);
    }

    #[test]
    fn test_reload_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let registry = open(&dir);
            let mut p = policy("company");
            p.relation = Some(RelationLink::parse("id", "company_rela.company_id").unwrap());
            registry.upsert(p).unwrap();
        }
        let registry = open(&dir);
        let cached = registry.get("company").unwrap();
        assert_eq!(
            cached.relation.as_ref().map(|r| r.target()),
            Some("company_rela.company_id".to_string())
        );
    }

    #[test]
    fn test_modify() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir);
        registry.upsert(policy("notes")).unwrap();

        let updated = registry
            .modify(
                "notes",
                PolicyUpdate {
                    outdate_days: Some(30),
                    fields: Some(vec!["note".to_string()]),
                    min_log_num: None,
                },
            )
            .unwrap();
        assert_eq!(updated.outdate_days, 30);
        assert_eq!(updated.fields, vec!["note"]);
        assert_eq!(updated.min_log_num, 10);

        // persisted too
        let persisted = registry.get_persisted("notes").unwrap().unwrap();
        assert_eq!(persisted.outdate_days, 30);
    }

    #[test]
    fn test_modify_unregistered() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir);
        let err = registry.modify("ghost", PolicyUpdate::default()).unwrap_err();
        assert!(matches!(err, TrailError::Policy(_)));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir);
        let mut bad = policy("notes");
        bad.primary_fields.clear();
        assert!(registry.upsert(bad).is_err());
    }
}

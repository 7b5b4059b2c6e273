//! History queries
//!
//! Read side of the engine: table/field listings merged with registration
//! markers, per-table and per-row history over a time window with
//! pagination, and lazy resolution of relation links.
//!
//! All scans run against the newest-first index keys, so page 1 is always
//! the most recent history.

use crate::common::{Catalog, ChangeRecord, FieldInfo, Result, TableInfo, TrailError};
use crate::registry::PolicyRegistry;
use crate::store::{
    ddl_prefix, key_after, pk_prefix, prefix_end, reversed_ts, time_index_prefix, LogStore,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Batch size for filtered relation scans.
const RELATION_SCAN_BATCH: usize = 256;

/// Read-side API over the log store.
pub struct HistoryService {
    store: Arc<dyn LogStore>,
    registry: Arc<PolicyRegistry>,
    catalog: Arc<dyn Catalog>,
}

impl HistoryService {
    /// Create the history service.
    pub fn new(
        store: Arc<dyn LogStore>,
        registry: Arc<PolicyRegistry>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            store,
            registry,
            catalog,
        }
    }

    /// All catalog tables, with `is_listen` set for registered ones.
    pub async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        let mut tables = self.catalog.tables().await?;
        for table in &mut tables {
            table.is_listen = self.registry.contains(&table.table_name);
        }
        Ok(tables)
    }

    /// Full column catalog of a table, independent of sensed-field
    /// projection.
    pub async fn list_table_fields(&self, table: &str) -> Result<Vec<FieldInfo>> {
        self.catalog.fields(table).await
    }

    /// Page through a table's whole history, newest first, optionally
    /// bounded to `[start, end]`.
    pub async fn list_table_all_log(
        &self,
        table: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ChangeRecord>> {
        self.require_registered(table)?;
        let prefix = time_index_prefix(table);
        let (from, to) = window_bounds(&prefix, start, end);
        self.page_records(&from, &to, page, page_size).await
    }

    /// Page through one row's history, newest first. `record_id` is the
    /// primary key exactly as records expose it (policy-ordered values
    /// joined with `,`).
    pub async fn list_table_log(
        &self,
        table: &str,
        record_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ChangeRecord>> {
        self.require_registered(table)?;
        let prefix = pk_prefix(table, record_id);
        let (from, to) = window_bounds(&prefix, start, end);
        self.page_records(&from, &to, page, page_size).await
    }

    /// Page through a table's schema-change history, newest first.
    pub async fn list_table_ddl(
        &self,
        table: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ChangeRecord>> {
        self.require_registered(table)?;
        let prefix = ddl_prefix(table);
        let (from, to) = window_bounds(&prefix, start, end);
        self.page_records(&from, &to, page, page_size).await
    }

    /// Resolve a record's relation link and return the linked table's
    /// matching history, newest first.
    ///
    /// The link is resolved lazily from this record's field value; the
    /// linked table's history is filtered on the referenced column. Returns
    /// an empty page when the policy has no link or the record lacks the
    /// link field.
    pub async fn related_history(
        &self,
        table: &str,
        record: &ChangeRecord,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let policy = self
            .registry
            .get(table)
            .ok_or_else(|| TrailError::policy(format!("table {table:?} not registered")))?;
        let Some(link) = policy.relation.clone() else {
            return Ok(Vec::new());
        };
        let Some(value) = record
            .after
            .get(&link.field)
            .or_else(|| record.before.get(&link.field))
            .cloned()
        else {
            debug!(table, field = %link.field, "record carries no link value");
            return Ok(Vec::new());
        };
        if !self.registry.contains(&link.table) {
            debug!(linked = %link.table, "linked table not registered");
            return Ok(Vec::new());
        }

        let prefix = time_index_prefix(&link.table);
        let end = prefix_end(&prefix);
        let mut from = prefix.clone();
        let mut skip = page.saturating_sub(1) * page_size;
        let mut out = Vec::new();

        loop {
            let batch = self.store.scan(&from, &end, RELATION_SCAN_BATCH).await?;
            let Some((last_key, _)) = batch.last() else {
                break;
            };
            from = key_after(last_key);

            for (_, bytes) in &batch {
                let candidate: ChangeRecord = serde_json::from_slice(bytes)?;
                let matches = field_equals(&candidate, &link.column, &value);
                if !matches {
                    continue;
                }
                if skip > 0 {
                    skip -= 1;
                    continue;
                }
                out.push(candidate);
                if out.len() >= page_size {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    fn require_registered(&self, table: &str) -> Result<()> {
        if self.registry.contains(table) {
            Ok(())
        } else {
            Err(TrailError::policy(format!("table {table:?} not registered")))
        }
    }

    async fn page_records(
        &self,
        from: &str,
        to: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let page = page.max(1);
        let skip = (page - 1) * page_size;
        let entries = self.store.scan(from, to, skip + page_size).await?;
        entries
            .into_iter()
            .skip(skip)
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(TrailError::from))
            .collect()
    }
}

/// Key bounds for a `[start, end]` time window over a newest-first index.
///
/// `end` (the newer edge) becomes the scan's lower key, `start` the upper:
/// a record stamped exactly `start` still falls inside because its key
/// carries a tiebreak suffix below the bound for `start - 1ms`.
fn window_bounds(
    prefix: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> (String, String) {
    let from = match end {
        Some(end) => format!("{prefix}{}", reversed_ts(end.timestamp_millis())),
        None => prefix.to_string(),
    };
    let to = match start {
        Some(start) => format!("{prefix}{}", reversed_ts(start.timestamp_millis() - 1)),
        None => prefix_end(prefix),
    };
    (from, to)
}

fn field_equals(record: &ChangeRecord, column: &str, value: &Value) -> bool {
    record.after.get(column) == Some(value) || record.before.get(column) == Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ChangeAction, RelationLink, TablePolicy};
    use crate::saver::{LogSaver, TableLocks};
    use crate::store::RedbLogStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    struct FixedCatalog;

    #[async_trait::async_trait]
    impl Catalog for FixedCatalog {
        async fn tables(&self) -> Result<Vec<TableInfo>> {
            Ok(["notes", "company"]
                .iter()
                .map(|name| TableInfo {
                    table_id: name.to_string(),
                    table_name: name.to_string(),
                    is_listen: false,
                })
                .collect())
        }

        async fn fields(&self, _table: &str) -> Result<Vec<FieldInfo>> {
            Ok(["id", "note"]
                .iter()
                .map(|name| FieldInfo {
                    field_id: name.to_string(),
                    field_name: name.to_string(),
                })
                .collect())
        }
    }

    fn policy(table: &str) -> TablePolicy {
        TablePolicy {
            table_name: table.to_string(),
            primary_fields: vec!["id".to_string()],
            fields: vec!["id".to_string(), "note".to_string()],
            min_log_num: 10,
            outdate_days: 10,
            relation: None,
        }
    }

    fn record(table: &str, pk: &str, seq: i64, age_hours: i64, note: &str) -> ChangeRecord {
        let mut after = Map::new();
        after.insert("id".to_string(), json!(pk));
        after.insert("note".to_string(), json!(note));
        ChangeRecord {
            table: table.to_string(),
            action: ChangeAction::Insert,
            primary_key: pk.to_string(),
            seq,
            time: Utc::now() - ChronoDuration::hours(age_hours),
            before: Map::new(),
            after,
        }
    }

    async fn setup(dir: &TempDir) -> (HistoryService, Arc<RedbLogStore>, Arc<PolicyRegistry>) {
        let store = Arc::new(RedbLogStore::open(dir.path().join("log")).unwrap());
        let registry = Arc::new(PolicyRegistry::open(dir.path().join("policy.db")).unwrap());
        let service = HistoryService::new(store.clone(), registry.clone(), Arc::new(FixedCatalog));
        (service, store, registry)
    }

    async fn write(store: &Arc<RedbLogStore>, records: Vec<ChangeRecord>) {
        let saver = LogSaver::new(store.clone(), Arc::new(TableLocks::default()));
        let (tx, rx) = tokio::sync::mpsc::channel(records.len().max(1));
        let handle = saver.spawn(rx, tokio_util::sync::CancellationToken::new());
        for r in records {
            tx.send(r).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_table_is_policy_error() {
        let dir = TempDir::new().unwrap();
        let (service, _store, _registry) = setup(&dir).await;
        let err = service
            .list_table_all_log("ghost", None, None, 1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, TrailError::Policy(_)));
    }

    #[tokio::test]
    async fn test_list_tables_merges_listen_markers() {
        let dir = TempDir::new().unwrap();
        let (service, _store, registry) = setup(&dir).await;
        registry.upsert(policy("notes")).unwrap();

        let tables = service.list_tables().await.unwrap();
        let notes = tables.iter().find(|t| t.table_name == "notes").unwrap();
        let company = tables.iter().find(|t| t.table_name == "company").unwrap();
        assert!(notes.is_listen);
        assert!(!company.is_listen);
    }

    #[tokio::test]
    async fn test_row_history_newest_first_with_pagination() {
        let dir = TempDir::new().unwrap();
        let (service, store, registry) = setup(&dir).await;
        registry.upsert(policy("notes")).unwrap();

        write(
            &store,
            (1..=5)
                .map(|i| record("notes", "1", i, 10 - i, &format!("v{i}")))
                .collect(),
        )
        .await;

        let first = service
            .list_table_log("notes", "1", None, None, 1, 2)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].after["note"], json!("v5"));
        assert_eq!(first[1].after["note"], json!("v4"));

        let third = service
            .list_table_log("notes", "1", None, None, 3, 2)
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].after["note"], json!("v1"));
    }

    #[tokio::test]
    async fn test_row_history_is_scoped_to_the_row() {
        let dir = TempDir::new().unwrap();
        let (service, store, registry) = setup(&dir).await;
        registry.upsert(policy("notes")).unwrap();

        write(
            &store,
            vec![
                record("notes", "1", 1, 2, "mine"),
                record("notes", "2", 2, 1, "other"),
            ],
        )
        .await;

        let mine = service
            .list_table_log("notes", "1", None, None, 1, 10)
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].after["note"], json!("mine"));
    }

    #[tokio::test]
    async fn test_table_history_time_window() {
        let dir = TempDir::new().unwrap();
        let (service, store, registry) = setup(&dir).await;
        registry.upsert(policy("notes")).unwrap();

        write(
            &store,
            vec![
                record("notes", "1", 1, 30, "old"),
                record("notes", "1", 2, 10, "mid"),
                record("notes", "2", 3, 1, "new"),
            ],
        )
        .await;

        let start = Utc::now() - ChronoDuration::hours(20);
        let end = Utc::now() - ChronoDuration::hours(5);
        let windowed = service
            .list_table_all_log("notes", Some(start), Some(end), 1, 10)
            .await
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].after["note"], json!("mid"));

        let all = service
            .list_table_all_log("notes", None, None, 1, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].after["note"], json!("new"));
    }

    #[tokio::test]
    async fn test_related_history() {
        let dir = TempDir::new().unwrap();
        let (service, store, registry) = setup(&dir).await;

        let mut company = policy("company");
        company.relation = Some(RelationLink::parse("id", "company_rela.company_id").unwrap());
        registry.upsert(company).unwrap();

        let mut rela = policy("company_rela");
        rela.fields = vec!["id".to_string(), "company_id".to_string(), "salary".to_string()];
        registry.upsert(rela).unwrap();

        // two child rows for company 7, one for company 8
        let child = |pk: &str, seq: i64, company_id: i64| {
            let mut r = record("company_rela", pk, seq, seq, "x");
            r.after
                .insert("company_id".to_string(), json!(company_id));
            r
        };
        write(&store, vec![child("10", 1, 7), child("11", 2, 7), child("12", 3, 8)]).await;

        let mut parent = record("company", "7", 9, 1, "acme");
        parent.after.insert("id".to_string(), json!(7));

        let related = service
            .related_history("company", &parent, 1, 10)
            .await
            .unwrap();
        assert_eq!(related.len(), 2);
        assert!(related
            .iter()
            .all(|r| r.after["company_id"] == json!(7)));
    }

    #[tokio::test]
    async fn test_related_history_without_link_is_empty() {
        let dir = TempDir::new().unwrap();
        let (service, _store, registry) = setup(&dir).await;
        registry.upsert(policy("notes")).unwrap();

        let r = record("notes", "1", 1, 1, "x");
        let related = service.related_history("notes", &r, 1, 10).await.unwrap();
        assert!(related.is_empty());
    }
}

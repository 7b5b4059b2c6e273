//! Change event representation
//!
//! Two shapes travel through the pipeline:
//!
//! - [`StagingEvent`] - a row of the staging table exactly as the trigger
//!   wrote it (`table_name`, jsonb `log`, `action`, `time`).
//! - [`ChangeRecord`] - the canonical in-process event, derived from a
//!   staging row plus the table's policy: sensed-field projection applied,
//!   primary key materialized.
//!
//! Payload shapes per action, as produced by the trigger functions:
//!
//! ```text
//! update        {"before": [<row>], "after": [<row>]}
//! insert/delete {"data": [<row>]}
//! ddl           {"data": [<sql-text>]}
//! ```

use crate::common::policy::TablePolicy;
use crate::common::{Result, TrailError};
use crate::store::escape_component;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Captured operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Schema changed (CREATE/ALTER/DROP)
    Ddl,
}

impl ChangeAction {
    /// Parse the staging table's `action` column.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "ddl" => Ok(Self::Ddl),
            other => Err(TrailError::store(format!("unknown action {other:?}"))),
        }
    }

    /// The staging table's representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Ddl => "ddl",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One staging table row, as drained by the watcher.
#[derive(Debug, Clone)]
pub struct StagingEvent {
    /// Monotonic staging id (bigserial). Drives ordering and replay.
    pub id: i64,
    /// Source table, or the affected table for ddl events.
    pub table_name: String,
    /// Raw jsonb payload.
    pub log: Value,
    /// Operation type.
    pub action: ChangeAction,
    /// Commit-side timestamp (staging column is `timestamp` without zone,
    /// interpreted as UTC).
    pub time: NaiveDateTime,
}

/// The canonical change event written to the log store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Source table name
    pub table: String,
    /// Operation type
    pub action: ChangeAction,
    /// Primary-field values in policy order, joined with `,`
    /// (component-escaped so the key space stays unambiguous)
    pub primary_key: String,
    /// Staging id the record was drained from. Monotonic; breaks ordering
    /// ties between events in the same millisecond.
    pub seq: i64,
    /// Event timestamp
    pub time: DateTime<Utc>,
    /// Previous row state projected to sensed fields. Empty unless update.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub before: Map<String, Value>,
    /// Current row state projected to sensed fields. Empty for delete;
    /// for ddl events holds the originating SQL under `"query"`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub after: Map<String, Value>,
}

impl ChangeRecord {
    /// Build a record from a drained staging row and the table's policy.
    ///
    /// The primary key is extracted from the raw row before projection, so
    /// key columns need not be sensed. DDL staging rows carry SQL text
    /// instead of row data and do not consult the policy.
    pub fn from_staging(event: &StagingEvent, policy: &TablePolicy) -> Result<Self> {
        let time = event.time.and_utc();

        match event.action {
            ChangeAction::Ddl => Ok(Self {
                table: event.table_name.clone(),
                action: ChangeAction::Ddl,
                primary_key: String::new(),
                seq: event.id,
                time,
                before: Map::new(),
                after: ddl_payload(&event.log),
            }),
            ChangeAction::Insert => {
                let row = single_row(&event.log, "data")?;
                Ok(Self {
                    table: event.table_name.clone(),
                    action: ChangeAction::Insert,
                    primary_key: encode_primary_key(&row, &policy.primary_fields)?,
                    seq: event.id,
                    time,
                    before: Map::new(),
                    after: project(row, &policy.fields),
                })
            }
            ChangeAction::Delete => {
                let row = single_row(&event.log, "data")?;
                Ok(Self {
                    table: event.table_name.clone(),
                    action: ChangeAction::Delete,
                    primary_key: encode_primary_key(&row, &policy.primary_fields)?,
                    seq: event.id,
                    time,
                    before: project(row, &policy.fields),
                    after: Map::new(),
                })
            }
            ChangeAction::Update => {
                let before = single_row(&event.log, "before")?;
                let after = single_row(&event.log, "after")?;
                Ok(Self {
                    table: event.table_name.clone(),
                    action: ChangeAction::Update,
                    primary_key: encode_primary_key(&after, &policy.primary_fields)?,
                    seq: event.id,
                    time,
                    before: project(before, &policy.fields),
                    after: project(after, &policy.fields),
                })
            }
        }
    }

    /// Unix-epoch milliseconds of the event time, used for key derivation.
    pub fn timestamp_millis(&self) -> i64 {
        self.time.timestamp_millis()
    }
}

/// Extract the single row object from a `json_agg` array under `key`.
fn single_row(log: &Value, key: &str) -> Result<Map<String, Value>> {
    log.get(key)
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| TrailError::store(format!("staging payload missing {key:?} row")))
}

/// DDL payloads carry the originating SQL text; keep it under `"query"`.
fn ddl_payload(log: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(sql) = log
        .get("data")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
    {
        out.insert("query".to_string(), sql.clone());
    }
    out
}

/// Project a row to the sensed fields, preserving field order.
fn project(row: Map<String, Value>, fields: &[String]) -> Map<String, Value> {
    let mut out = Map::new();
    for field in fields {
        if let Some(v) = row.get(field) {
            out.insert(field.clone(), v.clone());
        }
    }
    out
}

/// Concatenate primary-field values in policy order.
///
/// Each component is escaped so `,` never collides with a value and the
/// result is safe inside a store key path.
pub fn encode_primary_key(row: &Map<String, Value>, primary_fields: &[String]) -> Result<String> {
    let mut parts = Vec::with_capacity(primary_fields.len());
    for field in primary_fields {
        let value = row
            .get(field)
            .ok_or_else(|| TrailError::policy(format!("primary field {field:?} missing from row")))?;
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        parts.push(escape_component(&text));
    }
    Ok(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(primary: &[&str], fields: &[&str]) -> TablePolicy {
        TablePolicy {
            table_name: "notes".to_string(),
            primary_fields: primary.iter().map(|s| s.to_string()).collect(),
            fields: fields.iter().map(|s| s.to_string()).collect(),
            min_log_num: 10,
            outdate_days: 10,
            relation: None,
        }
    }

    fn staging(action: ChangeAction, log: Value) -> StagingEvent {
        StagingEvent {
            id: 1,
            table_name: "notes".to_string(),
            log,
            action,
            time: chrono::DateTime::from_timestamp(1_705_000_000, 0)
                .unwrap()
                .naive_utc(),
        }
    }

    #[test]
    fn test_insert_record() {
        let ev = staging(
            ChangeAction::Insert,
            json!({"data": [{"id": 1, "note": "hello", "secret": "x"}]}),
        );
        let record = ChangeRecord::from_staging(&ev, &policy(&["id"], &["note"])).unwrap();

        assert_eq!(record.action, ChangeAction::Insert);
        assert_eq!(record.primary_key, "1");
        assert!(record.before.is_empty());
        assert_eq!(record.after.get("note"), Some(&json!("hello")));
        assert!(record.after.get("secret").is_none());
    }

    #[test]
    fn test_update_record() {
        let ev = staging(
            ChangeAction::Update,
            json!({
                "before": [{"id": 1, "note": "hello"}],
                "after": [{"id": 1, "note": "world"}],
            }),
        );
        let record = ChangeRecord::from_staging(&ev, &policy(&["id"], &["note"])).unwrap();

        assert_eq!(record.primary_key, "1");
        assert_eq!(record.before.get("note"), Some(&json!("hello")));
        assert_eq!(record.after.get("note"), Some(&json!("world")));
    }

    #[test]
    fn test_delete_record() {
        let ev = staging(
            ChangeAction::Delete,
            json!({"data": [{"id": 7, "note": "gone"}]}),
        );
        let record = ChangeRecord::from_staging(&ev, &policy(&["id"], &["note"])).unwrap();

        assert_eq!(record.primary_key, "7");
        assert!(record.after.is_empty());
        assert_eq!(record.before.get("note"), Some(&json!("gone")));
    }

    #[test]
    fn test_ddl_record() {
        let ev = staging(
            ChangeAction::Ddl,
            json!({"data": ["ALTER TABLE notes ADD COLUMN tag text"]}),
        );
        let record = ChangeRecord::from_staging(&ev, &policy(&["id"], &["note"])).unwrap();

        assert_eq!(record.action, ChangeAction::Ddl);
        assert!(record.primary_key.is_empty());
        assert_eq!(
            record.after.get("query"),
            Some(&json!("ALTER TABLE notes ADD COLUMN tag text"))
        );
    }

    #[test]
    fn test_composite_primary_key() {
        let row = json!({"org": "acme", "seq": 42, "note": "x"});
        let pk = encode_primary_key(
            row.as_object().unwrap(),
            &["org".to_string(), "seq".to_string()],
        )
        .unwrap();
        assert_eq!(pk, "acme,42");
    }

    #[test]
    fn test_primary_key_escaping() {
        let row = json!({"name": "a,b/c"});
        let pk = encode_primary_key(row.as_object().unwrap(), &["name".to_string()]).unwrap();
        // the separator and path characters inside the value are escaped,
        // so a composite key built from ("a", "b/c") cannot alias this one
        assert_eq!(pk, "a%2Cb%2Fc");
    }

    #[test]
    fn test_missing_primary_field() {
        let ev = staging(ChangeAction::Insert, json!({"data": [{"note": "hello"}]}));
        let err = ChangeRecord::from_staging(&ev, &policy(&["id"], &["note"])).unwrap_err();
        assert!(matches!(err, TrailError::Policy(_)));
    }

    #[test]
    fn test_large_payload_survives() {
        // NOTIFY caps payloads near 8 KiB; the staging row does not. The
        // builder must pass these through untouched.
        for len in [7870usize, 7880, 7890, 7900] {
            let body: String = std::iter::repeat('.').take(len).collect();
            let ev = staging(
                ChangeAction::Insert,
                json!({"data": [{"id": 1, "note": body}]}),
            );
            let record = ChangeRecord::from_staging(&ev, &policy(&["id"], &["note"])).unwrap();
            assert_eq!(
                record.after.get("note").and_then(Value::as_str).map(str::len),
                Some(len)
            );
        }
    }

    #[test]
    fn test_action_round_trip() {
        for action in [
            ChangeAction::Insert,
            ChangeAction::Update,
            ChangeAction::Delete,
            ChangeAction::Ddl,
        ] {
            assert_eq!(ChangeAction::parse(action.as_str()).unwrap(), action);
        }
        assert!(ChangeAction::parse("truncate").is_err());
    }

    #[test]
    fn test_record_serialization() {
        let ev = staging(
            ChangeAction::Insert,
            json!({"data": [{"id": 1, "note": "hello"}]}),
        );
        let record = ChangeRecord::from_staging(&ev, &policy(&["id"], &["note"])).unwrap();

        let bytes = serde_json::to_vec(&record).unwrap();
        let parsed: ChangeRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.primary_key, "1");
        assert_eq!(parsed.after.get("note"), Some(&json!("hello")));
        // empty maps are omitted on the wire
        assert!(!String::from_utf8(bytes).unwrap().contains("before"));
    }
}

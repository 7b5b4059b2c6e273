//! History log store
//!
//! An ordered key-value abstraction with range scans and atomic batch
//! writes, plus the key codec the pipeline shares.
//!
//! ## Key layout
//!
//! ```text
//! table/<table>/pk/<primary_key>/t/<rev>   per-row history, newest first
//! table/<table>/t/<rev>/pk/<primary_key>   per-table time index
//! ddl/<table>/t/<rev>                      schema-change history
//! ```
//!
//! `<rev>` is `u64::MAX - unix_millis`, zero-padded to 20 decimal digits,
//! with the staging id (also reversed) appended as a tiebreak - so plain
//! lexicographic order over keys yields newest-first, and two events in the
//! same millisecond keep their commit order. Every variable component is
//! percent-escaped, which keeps all key bytes strictly below `0x7f` and
//! makes `\u{7f}` a valid upper fence for prefix scans.

mod redb_store;

pub use redb_store::RedbLogStore;

use crate::common::Result;
use async_trait::async_trait;

/// Ordered KV store backing the history log.
///
/// Durability is the implementation's concern; the engine requires only
/// that a successful [`batch_put`](LogStore::batch_put) survives restart.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Write one entry.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Write several entries in one atomic batch: either all land or none.
    async fn batch_put(&self, pairs: &[(String, Vec<u8>)]) -> Result<()>;

    /// Point lookup.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Scan keys in `[from, to)` in lexicographic order, up to `limit`
    /// entries. Resume by passing the successor of the last returned key.
    async fn scan(&self, from: &str, to: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>>;

    /// Delete the given keys in one atomic batch. Missing keys are ignored.
    async fn delete_keys(&self, keys: &[String]) -> Result<()>;

    /// Delete every key in `[from, to)`.
    async fn delete_range(&self, from: &str, to: &str) -> Result<()>;
}

/// Smallest key strictly greater than every key sharing `prefix`.
pub fn prefix_end(prefix: &str) -> String {
    format!("{prefix}\u{7f}")
}

/// Successor key for resuming a scan after `key`.
pub fn key_after(key: &str) -> String {
    format!("{key}\0")
}

/// Percent-escape a key component.
///
/// Escapes `%`, the path separator `/`, the primary-key join separator `,`,
/// and every byte outside printable ASCII, so components never alias key
/// structure and all key bytes stay below `0x7f`.
pub fn escape_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'%' | b'/' | b',' => {
                out.push_str(&format!("%{b:02X}"));
            }
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

const REV_DIGITS: usize = 20;

/// Reversed timestamp: lexicographic order over the rendering is
/// newest-first.
pub fn reversed_ts(millis: i64) -> String {
    let rev = u64::MAX - millis.max(0) as u64;
    format!("{rev:020}")
}

/// Recover unix millis from a reversed timestamp rendering.
pub fn millis_from_reversed(rev: &str) -> Option<i64> {
    let parsed: u64 = rev.get(..REV_DIGITS)?.parse().ok()?;
    Some((u64::MAX - parsed) as i64)
}

/// Reversed time component with the staging id tiebreak appended.
fn rev_component(millis: i64, seq: i64) -> String {
    let rev_seq = u64::MAX - seq.max(0) as u64;
    format!("{}-{rev_seq:020}", reversed_ts(millis))
}

/// Per-row history key: `table/<t>/pk/<pk>/t/<rev>`.
pub fn pk_entry_key(table: &str, primary_key: &str, millis: i64, seq: i64) -> String {
    format!(
        "table/{}/pk/{}/t/{}",
        escape_component(table),
        primary_key,
        rev_component(millis, seq)
    )
}

/// Time-index key: `table/<t>/t/<rev>/pk/<pk>`.
pub fn time_entry_key(table: &str, primary_key: &str, millis: i64, seq: i64) -> String {
    format!(
        "table/{}/t/{}/pk/{}",
        escape_component(table),
        rev_component(millis, seq),
        primary_key
    )
}

/// Schema-change key: `ddl/<t>/t/<rev>`.
pub fn ddl_entry_key(table: &str, millis: i64, seq: i64) -> String {
    format!(
        "ddl/{}/t/{}",
        escape_component(table),
        rev_component(millis, seq)
    )
}

/// Prefix of one row's history.
pub fn pk_prefix(table: &str, primary_key: &str) -> String {
    format!("table/{}/pk/{}/t/", escape_component(table), primary_key)
}

/// Prefix of a table's whole pk index.
pub fn pk_index_prefix(table: &str) -> String {
    format!("table/{}/pk/", escape_component(table))
}

/// Prefix of a table's time index.
pub fn time_index_prefix(table: &str) -> String {
    format!("table/{}/t/", escape_component(table))
}

/// Prefix of a table's schema-change history.
pub fn ddl_prefix(table: &str) -> String {
    format!("ddl/{}/t/", escape_component(table))
}

/// Split a pk-index key into its primary-key component, given the table's
/// pk index prefix. Returns `None` for keys outside the index.
pub fn pk_from_index_key<'a>(key: &'a str, index_prefix: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(index_prefix)?;
    let (pk, _) = rest.split_once("/t/")?;
    Some(pk)
}

/// Extract the unix millis from any entry key carrying a `/t/<rev>` part.
pub fn millis_from_entry_key(key: &str) -> Option<i64> {
    let idx = key.rfind("/t/")?;
    millis_from_reversed(&key[idx + 3..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_component() {
        assert_eq!(escape_component("notes"), "notes");
        assert_eq!(escape_component("a/b"), "a%2Fb");
        assert_eq!(escape_component("a,b"), "a%2Cb");
        assert_eq!(escape_component("100%"), "100%25");
        // non-ASCII stays below the 0x7f fence
        for b in escape_component("naïve").bytes() {
            assert!(b < 0x7f);
        }
    }

    #[test]
    fn test_reversed_ts_orders_newest_first() {
        let older = reversed_ts(1_000);
        let newer = reversed_ts(2_000);
        assert!(newer < older);
        assert_eq!(millis_from_reversed(&older), Some(1_000));
        assert_eq!(millis_from_reversed(&newer), Some(2_000));
    }

    #[test]
    fn test_same_millis_keeps_commit_order() {
        // staging ids i1 < i2 at the same timestamp: i2 (newer) sorts first
        let first = pk_entry_key("notes", "1", 5_000, 10);
        let second = pk_entry_key("notes", "1", 5_000, 11);
        assert!(second < first);
        assert_ne!(first, second);
    }

    #[test]
    fn test_key_shapes() {
        let key = pk_entry_key("notes", "1", 1_000, 1);
        assert!(key.starts_with("table/notes/pk/1/t/"));
        let key = time_entry_key("notes", "1", 1_000, 1);
        assert!(key.starts_with("table/notes/t/"));
        assert!(key.ends_with("/pk/1"));
        let key = ddl_entry_key("notes", 1_000, 1);
        assert!(key.starts_with("ddl/notes/t/"));
    }

    #[test]
    fn test_prefix_scan_fences() {
        let prefix = pk_prefix("notes", "1");
        let key = pk_entry_key("notes", "1", 1_000, 1);
        let other_row = pk_entry_key("notes", "12", 1_000, 1);

        assert!(key.as_str() >= prefix.as_str());
        assert!(key < prefix_end(&prefix));
        // pk "12" shares the string prefix "1" but not the scan window
        assert!(other_row >= prefix_end(&prefix) || !other_row.starts_with(&prefix));
    }

    #[test]
    fn test_pk_from_index_key() {
        let prefix = pk_index_prefix("notes");
        let key = pk_entry_key("notes", "acme%2C1", 1_000, 1);
        assert_eq!(pk_from_index_key(&key, &prefix), Some("acme%2C1"));
        assert_eq!(pk_from_index_key("ddl/notes/t/0", &prefix), None);
    }

    #[test]
    fn test_millis_from_entry_key() {
        let key = time_entry_key("notes", "1", 42_000, 7);
        assert_eq!(millis_from_entry_key(&key), Some(42_000));
    }
}

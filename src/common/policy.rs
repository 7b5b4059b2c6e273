//! Table policies and the catalog seam
//!
//! A [`TablePolicy`] describes everything the engine needs to know about one
//! watched table: which columns form its primary key, which columns are
//! sensed (recorded in `before`/`after`), how long history is retained, and
//! an optional relation link to another watched table.
//!
//! The [`Catalog`] trait is the narrow capability interface to the
//! embedder's table metadata; the engine depends only on it, never on an
//! ORM.

use crate::common::{Result, TrailError};
use serde::{Deserialize, Serialize};

/// Retention and projection policy for one watched table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePolicy {
    /// Physical table name. Unique across the registry.
    pub table_name: String,
    /// Ordered primary-key column names.
    pub primary_fields: Vec<String>,
    /// Ordered sensed columns; diffs are recorded only for these.
    pub fields: Vec<String>,
    /// Retention floor: never drop below this many records per primary key.
    pub min_log_num: u32,
    /// Retention age in days: older records beyond the floor are deletable.
    pub outdate_days: u32,
    /// Optional link to a related table's history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationLink>,
}

impl TablePolicy {
    /// Validate the registry invariants.
    pub fn validate(&self) -> Result<()> {
        if self.table_name.is_empty() {
            return Err(TrailError::policy("table name must not be empty"));
        }
        if self.primary_fields.is_empty() {
            return Err(TrailError::policy(format!(
                "table {:?} has no primary fields",
                self.table_name
            )));
        }
        if self.min_log_num < 1 {
            return Err(TrailError::policy("min_log_num must be >= 1"));
        }
        if self.outdate_days < 1 {
            return Err(TrailError::policy("outdate_days must be >= 1"));
        }
        Ok(())
    }
}

/// Declarative back-reference from one watched table to another.
///
/// `field` is a column in the owning table; its value identifies rows in
/// `table` via `column`. The history API resolves the link lazily, one hop
/// at a time; link graphs (including cycles) are never walked transitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationLink {
    /// Column in the owning table.
    pub field: String,
    /// Referenced table.
    pub table: String,
    /// Referenced column.
    pub column: String,
}

impl RelationLink {
    /// Parse the `rela_field` / `relations` pair, where `relations` is
    /// `other_table.other_column`.
    pub fn parse(rela_field: &str, relations: &str) -> Result<Self> {
        if rela_field.is_empty() {
            return Err(TrailError::policy("relation field must not be empty"));
        }
        match relations.split_once('.') {
            Some((table, column)) if !table.is_empty() && !column.is_empty() => Ok(Self {
                field: rela_field.to_string(),
                table: table.to_string(),
                column: column.to_string(),
            }),
            _ => Err(TrailError::policy(format!(
                "relation {relations:?} must be table.column"
            ))),
        }
    }

    /// Render back to the persisted `table.column` form.
    pub fn target(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// Caller-facing registration request. The engine fills in defaults and
/// resolves fields against the catalog before persisting a [`TablePolicy`].
#[derive(Debug, Clone, Default)]
pub struct PolicySpec {
    /// Table to watch.
    pub table: TableRef,
    /// Explicit sensed columns. Empty means all-minus-ignored.
    pub sense_fields: Vec<String>,
    /// Columns excluded from sensing.
    pub ignore_fields: Vec<String>,
    /// Per-table retention floor; clamped up to the engine default.
    pub min_log_num: Option<u32>,
    /// Per-table retention age; clamped up to the engine default.
    pub outdate_days: Option<u32>,
    /// Relation link column in this table.
    pub rela_field: Option<String>,
    /// Relation target as `table.column`.
    pub relations: Option<String>,
}

impl PolicySpec {
    /// Watch a table by name with default projection and retention.
    pub fn named(table: impl Into<String>) -> Self {
        Self {
            table: TableRef::Named(table.into()),
            ..Self::default()
        }
    }
}

/// Identity of a table to watch: either a plain name or a typed schema
/// descriptor supplied by the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableRef {
    /// Physical table name.
    Named(String),
    /// Schema descriptor carrying the name and column layout.
    Typed(TableSchema),
}

impl TableRef {
    /// Resolve to the physical table name.
    pub fn table_name(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::Typed(schema) => &schema.name,
        }
    }
}

impl Default for TableRef {
    fn default() -> Self {
        Self::Named(String::new())
    }
}

impl From<&str> for TableRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for TableRef {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

/// Minimal schema descriptor for [`TableRef::Typed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Physical table name.
    pub name: String,
    /// Declared columns, in order.
    pub columns: Vec<String>,
}

/// One table as reported by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    /// Stable identifier (usually the physical name).
    pub table_id: String,
    /// Display name.
    pub table_name: String,
    /// Whether a policy is registered for this table.
    pub is_listen: bool,
}

/// One column as reported by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Stable identifier (the column name).
    pub field_id: String,
    /// Display name.
    pub field_name: String,
}

/// Table-metadata capability the engine depends on.
///
/// The default implementation reads the database catalog directly; embedders
/// with richer schema knowledge (an ORM layer, generated models) can supply
/// their own.
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    /// All known tables.
    async fn tables(&self) -> Result<Vec<TableInfo>>;

    /// Columns of one table, in ordinal order.
    async fn fields(&self, table: &str) -> Result<Vec<FieldInfo>>;

    /// Resolve a table id to its display name.
    async fn table_name(&self, table_id: &str) -> Result<String> {
        Ok(table_id.to_string())
    }

    /// Resolve a column id to its display name.
    async fn field_name(&self, _table: &str, field_id: &str) -> Result<String> {
        Ok(field_id.to_string())
    }
}

/// Resolve the sensed-field list: the explicit sense list minus ignored
/// columns, or every column minus ignored when no sense list is given.
pub fn resolve_sensed_fields(
    all_columns: &[String],
    sense: &[String],
    ignore: &[String],
) -> Vec<String> {
    let ignored: std::collections::HashSet<&str> = ignore.iter().map(String::as_str).collect();
    let source: Vec<&String> = if sense.is_empty() || sense.iter().all(String::is_empty) {
        all_columns.iter().collect()
    } else {
        sense.iter().collect()
    };
    source
        .into_iter()
        .filter(|f| !ignored.contains(f.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_policy() -> TablePolicy {
        TablePolicy {
            table_name: "notes".to_string(),
            primary_fields: vec!["id".to_string()],
            fields: vec!["note".to_string()],
            min_log_num: 3,
            outdate_days: 1,
            relation: None,
        }
    }

    #[test]
    fn test_policy_validate() {
        assert!(base_policy().validate().is_ok());

        let mut p = base_policy();
        p.primary_fields.clear();
        assert!(p.validate().is_err());

        let mut p = base_policy();
        p.min_log_num = 0;
        assert!(p.validate().is_err());

        let mut p = base_policy();
        p.outdate_days = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_relation_parse() {
        let link = RelationLink::parse("company_id", "company.id").unwrap();
        assert_eq!(link.field, "company_id");
        assert_eq!(link.table, "company");
        assert_eq!(link.column, "id");
        assert_eq!(link.target(), "company.id");

        assert!(RelationLink::parse("company_id", "company").is_err());
        assert!(RelationLink::parse("company_id", ".id").is_err());
        assert!(RelationLink::parse("", "company.id").is_err());
    }

    #[test]
    fn test_table_ref() {
        assert_eq!(TableRef::from("notes").table_name(), "notes");
        let typed = TableRef::Typed(TableSchema {
            name: "company".to_string(),
            columns: vec!["id".to_string(), "name".to_string()],
        });
        assert_eq!(typed.table_name(), "company");
    }

    #[test]
    fn test_resolve_sensed_fields() {
        let all = vec!["id".to_string(), "note".to_string(), "secret".to_string()];

        // all-minus-ignored when no sense list given
        let fields = resolve_sensed_fields(&all, &[], &["secret".to_string()]);
        assert_eq!(fields, vec!["id".to_string(), "note".to_string()]);

        // explicit sense list wins, still minus ignored
        let fields = resolve_sensed_fields(
            &all,
            &["note".to_string(), "secret".to_string()],
            &["secret".to_string()],
        );
        assert_eq!(fields, vec!["note".to_string()]);
    }

    #[test]
    fn test_policy_serde_round_trip() {
        let mut p = base_policy();
        p.relation = Some(RelationLink::parse("company_id", "company.id").unwrap());
        let json = serde_json::to_string(&p).unwrap();
        let parsed: TablePolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, p);
    }
}

//! Source database driver
//!
//! Pooled access to the watched PostgreSQL database: generic query/execute,
//! table introspection (primary keys, columns), and the idempotent trigger
//! DDL primitives the trigger manager builds on.
//!
//! Trigger create/drop runs inside a transaction holding a per-name
//! advisory lock, so concurrent registrations of the same table cannot race
//! to create the same function.

use crate::common::{Result, TrailError};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::future::Future;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, warn};

/// One column as reported by `information_schema.columns`.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared data type.
    pub data_type: String,
    /// 1-based ordinal position.
    pub ordinal: i32,
    /// Whether NULLs are allowed.
    pub nullable: bool,
}

/// Pooled driver for the source database.
#[derive(Debug)]
pub struct PgDriver {
    pool: Pool,
    statement_timeout: Duration,
}

impl PgDriver {
    /// Open a connection pool against the given DSN.
    pub fn connect(dsn: &str, pool_size: usize, statement_timeout: Duration) -> Result<Self> {
        let pg_config: tokio_postgres::Config = dsn
            .parse()
            .map_err(|e| TrailError::config(format!("invalid dsn: {e}")))?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| TrailError::pool(e.to_string()))?;

        Ok(Self {
            pool,
            statement_timeout,
        })
    }

    /// Apply the per-call deadline to a database future.
    async fn with_deadline<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.statement_timeout, fut)
            .await
            .map_err(|_| TrailError::timeout(format!("{what} exceeded {:?}", self.statement_timeout)))?
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| TrailError::pool(e.to_string()))
    }

    /// Execute a statement, returning the affected row count.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        self.with_deadline("execute", async {
            let client = self.client().await?;
            Ok(client.execute(sql, params).await?)
        })
        .await
    }

    /// Execute a multi-statement script.
    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        self.with_deadline("batch execute", async {
            let client = self.client().await?;
            client.batch_execute(sql).await?;
            Ok(())
        })
        .await
    }

    /// Run a query and return its rows.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        self.with_deadline("query", async {
            let client = self.client().await?;
            Ok(client.query(sql, params).await?)
        })
        .await
    }

    /// Run `select_sql` then `delete_sql` with the same key parameter
    /// inside one transaction, returning the selected row if any.
    ///
    /// Used to consume a staged row: either the row is returned and gone,
    /// or (on conflict/rollback) it is still staged - never half-consumed.
    pub async fn take_row(
        &self,
        select_sql: &str,
        delete_sql: &str,
        id: i64,
    ) -> Result<Option<Row>> {
        self.with_deadline("take row", async {
            let mut client = self.client().await?;
            let txn = client.transaction().await?;
            let row = txn.query_opt(select_sql, &[&id]).await?;
            txn.execute(delete_sql, &[&id]).await?;
            txn.commit().await?;
            Ok(row)
        })
        .await
    }

    /// Ordered primary-key column names of a table.
    pub async fn get_primary(&self, table: &str) -> Result<Vec<String>> {
        let rows = self
            .query(
                r#"
                SELECT a.attname
                FROM pg_index i
                JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                JOIN pg_class c ON c.oid = i.indrelid
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = current_schema() AND c.relname = $1
                AND i.indisprimary
                ORDER BY array_position(i.indkey, a.attnum)
                "#,
                &[&table],
            )
            .await?;

        let primary: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
        debug!(table, primary = ?primary, "resolved primary key");
        Ok(primary)
    }

    /// Column catalog of a table, in ordinal order.
    pub async fn get_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = self
            .query(
                r#"
                SELECT column_name, data_type, ordinal_position::int4,
                       is_nullable = 'YES'
                FROM information_schema.columns
                WHERE table_schema = current_schema() AND table_name = $1
                ORDER BY ordinal_position
                "#,
                &[&table],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| ColumnInfo {
                name: r.get(0),
                data_type: r.get(1),
                ordinal: r.get(2),
                nullable: r.get(3),
            })
            .collect())
    }

    /// All base tables in the current schema.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = self
            .query(
                r#"
                SELECT table_name FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'
                ORDER BY table_name
                "#,
                &[],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Whether a base table exists in the current schema.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let rows = self
            .query(
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1",
                &[&table],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Whether a row trigger with this name exists on the table.
    pub async fn trigger_exists(&self, trigger: &str, table: &str) -> Result<bool> {
        let rows = self
            .query(
                r#"
                SELECT 1
                FROM pg_trigger t
                JOIN pg_class c ON c.oid = t.tgrelid
                WHERE t.tgname = $1 AND c.relname = $2 AND NOT t.tgisinternal
                "#,
                &[&trigger, &table],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Install a row trigger: drop any previous instance, then run `body`
    /// (function definition + CREATE TRIGGER), all in one transaction under
    /// an advisory lock keyed by the trigger name.
    pub async fn create_trigger(&self, trigger: &str, table: &str, body: &str) -> Result<()> {
        self.with_deadline("create trigger", async {
            let mut client = self.client().await?;
            let txn = client.transaction().await?;
            txn.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&trigger])
                .await?;
            txn.batch_execute(&format!(
                "DROP TRIGGER IF EXISTS \"{trigger}\" ON \"{table}\";"
            ))
            .await?;
            txn.batch_execute(body).await?;
            txn.commit().await?;
            debug!(trigger, table, "installed row trigger");
            Ok(())
        })
        .await
    }

    /// Drop a row trigger and its function. Missing objects are swallowed.
    pub async fn delete_trigger(&self, trigger: &str, function: &str, table: &str) -> Result<()> {
        let result = self
            .with_deadline("drop trigger", async {
                let mut client = self.client().await?;
                let txn = client.transaction().await?;
                txn.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&trigger])
                    .await?;
                txn.batch_execute(&format!(
                    "DROP TRIGGER IF EXISTS \"{trigger}\" ON \"{table}\";\n\
                     DROP FUNCTION IF EXISTS \"{function}\"();"
                ))
                .await?;
                txn.commit().await?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                debug!(trigger, table, "dropped row trigger");
                Ok(())
            }
            Err(e) if is_undefined_object(&e) => {
                warn!(trigger, table, "trigger target already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Install an event trigger: drop any previous instance, then run
    /// `body`, in one transaction under an advisory lock.
    pub async fn create_event_trigger(&self, trigger: &str, body: &str) -> Result<()> {
        self.with_deadline("create event trigger", async {
            let mut client = self.client().await?;
            let txn = client.transaction().await?;
            txn.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&trigger])
                .await?;
            txn.batch_execute(&format!("DROP EVENT TRIGGER IF EXISTS \"{trigger}\";"))
                .await?;
            txn.batch_execute(body).await?;
            txn.commit().await?;
            debug!(trigger, "installed event trigger");
            Ok(())
        })
        .await
    }

    /// Drop an event trigger and its function. Missing objects are
    /// swallowed.
    pub async fn delete_event_trigger(&self, trigger: &str, function: &str) -> Result<()> {
        let result = self
            .with_deadline("drop event trigger", async {
                let mut client = self.client().await?;
                let txn = client.transaction().await?;
                txn.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&trigger])
                    .await?;
                txn.batch_execute(&format!(
                    "DROP EVENT TRIGGER IF EXISTS \"{trigger}\";\n\
                     DROP FUNCTION IF EXISTS \"{function}\"();"
                ))
                .await?;
                txn.commit().await?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_undefined_object(&e) => {
                warn!(trigger, "event trigger already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Postgres "object does not exist" error classes (undefined table,
/// function, or object), tolerated during removal.
fn is_undefined_object(e: &TrailError) -> bool {
    if let TrailError::Db(db) = e {
        if let Some(db_error) = db.as_db_error() {
            let code = db_error.code().code();
            return code == "42P01" || code == "42883" || code == "42704";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_dsn_rejected() {
        let err =
            PgDriver::connect("this is not a dsn", 2, Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, TrailError::Config(_)));
    }

    #[test]
    fn test_undefined_object_detection_ignores_other_errors() {
        assert!(!is_undefined_object(&TrailError::store("boom")));
        assert!(!is_undefined_object(&TrailError::pool("exhausted")));
    }
}

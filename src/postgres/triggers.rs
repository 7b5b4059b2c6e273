//! Trigger installation and removal
//!
//! The SQL-level contract with the source database. Each watched table gets
//! a row-level AFTER trigger whose function serializes the affected row
//! into the staging table and notifies the watcher with the staging row's
//! id (id only - NOTIFY payloads are capped near 8 KiB, the row body
//! travels through the staging table). Two global event triggers capture
//! CREATE/ALTER and DROP DDL the same way.
//!
//! Install and remove are idempotent: drop-if-exists first, one
//! transaction per trigger, serialized per name by an advisory lock inside
//! [`PgDriver`].

use crate::common::Result;
use crate::postgres::driver::PgDriver;
use std::sync::Arc;
use tracing::info;

/// Name of the per-table trigger function.
pub fn function_name(table: &str) -> String {
    format!("{table}_auto_log_recored")
}

/// Name of the per-table row trigger.
pub fn trigger_name(table: &str) -> String {
    format!("{table}_auto_log_trigger")
}

const DDL_END_FUNCTION: &str = "ddl_end_log_function";
const DDL_END_TRIGGER: &str = "ddl_end_log_trigger";
const DDL_DROP_FUNCTION: &str = "ddl_drop_log_function";
const DDL_DROP_TRIGGER: &str = "ddl_sql_drop_trigger";

/// Installs and removes the database-side capture machinery.
pub struct TriggerManager {
    driver: Arc<PgDriver>,
    staging_table: String,
    notify_channel: String,
}

impl TriggerManager {
    /// Create a manager writing into `staging_table` and notifying on
    /// `notify_channel`.
    pub fn new(driver: Arc<PgDriver>, staging_table: &str, notify_channel: &str) -> Self {
        Self {
            driver,
            staging_table: staging_table.to_string(),
            notify_channel: notify_channel.to_string(),
        }
    }

    /// Create the staging table and required extension if missing.
    pub async fn ensure_staging(&self) -> Result<()> {
        self.driver
            .batch_execute(&format!(
                r#"
                CREATE EXTENSION IF NOT EXISTS hstore;
                CREATE TABLE IF NOT EXISTS "{staging}" (
                    id bigserial PRIMARY KEY,
                    table_name text,
                    log jsonb,
                    action text,
                    "time" timestamp DEFAULT CURRENT_TIMESTAMP
                );
                "#,
                staging = self.staging_table
            ))
            .await?;
        info!(staging = %self.staging_table, "staging table ready");
        Ok(())
    }

    /// Install the row trigger for one table. Idempotent.
    pub async fn install(&self, table: &str) -> Result<()> {
        let body = self.row_trigger_body(table);
        self.driver
            .create_trigger(&trigger_name(table), table, &body)
            .await?;
        info!(table, "row trigger installed");
        Ok(())
    }

    /// Remove the row trigger for one table. Missing objects are fine.
    pub async fn remove(&self, table: &str) -> Result<()> {
        self.driver
            .delete_trigger(&trigger_name(table), &function_name(table), table)
            .await?;
        info!(table, "row trigger removed");
        Ok(())
    }

    /// Reinstall after DDL invalidated the trigger or its function.
    pub async fn reinstall(&self, table: &str) -> Result<()> {
        self.remove(table).await?;
        self.install(table).await
    }

    /// Whether the row trigger is physically present.
    pub async fn installed(&self, table: &str) -> Result<bool> {
        self.driver
            .trigger_exists(&trigger_name(table), table)
            .await
    }

    /// Install both global DDL event triggers. Idempotent.
    pub async fn install_event_triggers(&self) -> Result<()> {
        self.driver
            .create_event_trigger(DDL_END_TRIGGER, &self.ddl_end_body())
            .await?;
        self.driver
            .create_event_trigger(DDL_DROP_TRIGGER, &self.ddl_drop_body())
            .await?;
        info!("ddl event triggers installed");
        Ok(())
    }

    /// Remove both global DDL event triggers.
    pub async fn remove_event_triggers(&self) -> Result<()> {
        self.driver
            .delete_event_trigger(DDL_END_TRIGGER, DDL_END_FUNCTION)
            .await?;
        self.driver
            .delete_event_trigger(DDL_DROP_TRIGGER, DDL_DROP_FUNCTION)
            .await
    }

    /// Function + trigger definition for one table.
    ///
    /// Payload shapes: update `{"before": json_agg(old), "after":
    /// json_agg(new)}`, insert/delete `{"data": json_agg(row)}`. Only the
    /// staging id goes through `pg_notify`.
    fn row_trigger_body(&self, table: &str) -> String {
        let function = function_name(table);
        let trigger = trigger_name(table);
        let staging = &self.staging_table;
        let channel = &self.notify_channel;
        format!(
            r#"
CREATE OR REPLACE FUNCTION "{function}"() RETURNS trigger
LANGUAGE plpgsql
AS $$
DECLARE
    logjson json;
    logid bigint;
BEGIN
    IF (TG_OP = 'UPDATE') THEN
        SELECT json_build_object(
            'before', json_agg(old),
            'after', json_agg(new)
        ) INTO logjson;
        INSERT INTO "{staging}" ("table_name", "log", "action", "time")
        VALUES ('{table}', logjson, 'update', CURRENT_TIMESTAMP)
        RETURNING id INTO logid;
        PERFORM pg_notify('{channel}', logid::text);
    END IF;
    IF (TG_OP = 'DELETE') THEN
        SELECT json_build_object('data', json_agg(old)) INTO logjson;
        INSERT INTO "{staging}" ("table_name", "log", "action", "time")
        VALUES ('{table}', logjson, 'delete', CURRENT_TIMESTAMP)
        RETURNING id INTO logid;
        PERFORM pg_notify('{channel}', logid::text);
    END IF;
    IF (TG_OP = 'INSERT') THEN
        SELECT json_build_object('data', json_agg(new)) INTO logjson;
        INSERT INTO "{staging}" ("table_name", "log", "action", "time")
        VALUES ('{table}', logjson, 'insert', CURRENT_TIMESTAMP)
        RETURNING id INTO logid;
        PERFORM pg_notify('{channel}', logid::text);
    END IF;
    RETURN NEW;
END$$;

CREATE TRIGGER "{trigger}" AFTER INSERT OR UPDATE OR DELETE ON "{table}"
FOR EACH ROW EXECUTE PROCEDURE "{function}"();
"#
        )
    }

    /// Event trigger for `ddl_command_end` (CREATE TABLE / ALTER TABLE).
    ///
    /// Resolves the affected table from the command's schema-qualified
    /// `object_identity` and records the originating SQL out of
    /// `pg_stat_activity`.
    fn ddl_end_body(&self) -> String {
        let staging = &self.staging_table;
        let channel = &self.notify_channel;
        format!(
            r#"
CREATE EXTENSION IF NOT EXISTS hstore;
CREATE OR REPLACE FUNCTION {DDL_END_FUNCTION}() RETURNS event_trigger
LANGUAGE plpgsql
AS $$
DECLARE
    rec hstore;
    logjson json;
    t varchar(255);
    logid bigint;
BEGIN
    SELECT hstore(pg_stat_activity.*) INTO rec
    FROM pg_stat_activity WHERE pid = pg_backend_pid();
    t := SPLIT_PART((SELECT object_identity FROM pg_event_trigger_ddl_commands()
                     WHERE object_type = 'table' LIMIT 1), '.', 2);
    SELECT json_build_object('data', json_agg(rec->'query')) INTO logjson;

    INSERT INTO "{staging}" ("table_name", "log", "action", "time")
    VALUES (t, logjson, 'ddl', CURRENT_TIMESTAMP)
    RETURNING id INTO logid;
    PERFORM pg_notify('{channel}', logid::text);
END$$;

CREATE EVENT TRIGGER {DDL_END_TRIGGER} ON ddl_command_end
WHEN TAG IN ('CREATE TABLE', 'ALTER TABLE')
EXECUTE PROCEDURE {DDL_END_FUNCTION}();
"#
        )
    }

    /// Event trigger for `sql_drop` (dropped tables or columns).
    fn ddl_drop_body(&self) -> String {
        let staging = &self.staging_table;
        let channel = &self.notify_channel;
        format!(
            r#"
CREATE EXTENSION IF NOT EXISTS hstore;
CREATE OR REPLACE FUNCTION {DDL_DROP_FUNCTION}() RETURNS event_trigger
LANGUAGE plpgsql
AS $$
DECLARE
    rec hstore;
    logjson json;
    t varchar(255);
    logid bigint;
BEGIN
    SELECT hstore(pg_stat_activity.*) INTO rec
    FROM pg_stat_activity WHERE pid = pg_backend_pid();
    t := SPLIT_PART((SELECT object_identity FROM pg_event_trigger_dropped_objects()
                     WHERE object_type IN ('table', 'table column') LIMIT 1), '.', 2);
    SELECT json_build_object('data', json_agg(rec->'query')) INTO logjson;

    INSERT INTO "{staging}" ("table_name", "log", "action", "time")
    VALUES (t, logjson, 'ddl', CURRENT_TIMESTAMP)
    RETURNING id INTO logid;
    PERFORM pg_notify('{channel}', logid::text);
END$$;

CREATE EVENT TRIGGER {DDL_DROP_TRIGGER} ON sql_drop
EXECUTE PROCEDURE {DDL_DROP_FUNCTION}();
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TrailError;
    use std::time::Duration;

    fn manager() -> TriggerManager {
        let driver = PgDriver::connect(
            "host=localhost user=postgres",
            1,
            Duration::from_secs(30),
        )
        .unwrap();
        TriggerManager::new(Arc::new(driver), "_action_log", "pgtrail_events")
    }

    #[test]
    fn test_names() {
        assert_eq!(function_name("notes"), "notes_auto_log_recored");
        assert_eq!(trigger_name("notes"), "notes_auto_log_trigger");
    }

    #[test]
    fn test_row_trigger_body_shape() {
        let body = manager().row_trigger_body("notes");

        assert!(body.contains("CREATE OR REPLACE FUNCTION \"notes_auto_log_recored\"()"));
        assert!(body.contains("'before', json_agg(old)"));
        assert!(body.contains("'after', json_agg(new)"));
        assert!(body.contains("json_build_object('data', json_agg(old))"));
        assert!(body.contains("json_build_object('data', json_agg(new))"));
        assert!(body.contains("INSERT INTO \"_action_log\""));
        // only the staging id is notified, never the payload
        assert!(body.contains("pg_notify('pgtrail_events', logid::text)"));
        assert!(!body.contains("pg_notify('pgtrail_events', logjson"));
        assert!(body.contains(
            "CREATE TRIGGER \"notes_auto_log_trigger\" AFTER INSERT OR UPDATE OR DELETE ON \"notes\""
        ));
    }

    #[test]
    fn test_ddl_bodies_shape() {
        let m = manager();
        let end = m.ddl_end_body();
        assert!(end.contains("ON ddl_command_end"));
        assert!(end.contains("TAG IN ('CREATE TABLE', 'ALTER TABLE')"));
        assert!(end.contains("pg_event_trigger_ddl_commands()"));
        assert!(end.contains("SPLIT_PART"));

        let drop = m.ddl_drop_body();
        assert!(drop.contains("ON sql_drop"));
        assert!(drop.contains("pg_event_trigger_dropped_objects()"));
        assert!(drop.contains("'table', 'table column'"));
    }

    #[test]
    fn test_staging_name_flows_into_bodies() {
        let driver = PgDriver::connect(
            "host=localhost user=postgres",
            1,
            Duration::from_secs(30),
        )
        .unwrap();
        let m = TriggerManager::new(Arc::new(driver), "_custom_log", "custom_channel");
        let body = m.row_trigger_body("notes");
        assert!(body.contains("\"_custom_log\""));
        assert!(body.contains("'custom_channel'"));
        assert!(!body.contains("_action_log"));
    }

    #[test]
    fn test_error_kind_for_bad_dsn() {
        let err = PgDriver::connect("%%", 1, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TrailError::Config(_)));
    }
}

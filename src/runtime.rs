//! Engine runtime
//!
//! Owns the long-lived tasks (watcher, saver, sweeper), the registration
//! entry points, and shutdown. Constructed once from a frozen
//! [`EngineConfig`]; lifecycle is `new -> start -> stop`.
//!
//! Per-table registration walks Unregistered -> Installing -> Active: the
//! policy is persisted, then the trigger installed; a partial failure rolls
//! both back. Unregistering drops the trigger, then the policy. Only
//! tables in Active state feed events into the pipeline.

use crate::common::{
    Catalog, EngineConfig, PolicySpec, RelationLink, Result, StoreBackend, TablePolicy, TrailError,
};
use crate::history::HistoryService;
use crate::postgres::{EventSource, PgCatalog, PgDriver, TriggerManager};
use crate::registry::{PolicyRegistry, PolicyUpdate};
use crate::saver::{LogSaver, RetentionSweeper, TableLocks};
use crate::store::{LogStore, RedbLogStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct EngineTasks {
    cancel: CancellationToken,
    watcher: JoinHandle<()>,
    saver: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// The capture engine.
pub struct TrailEngine {
    config: Arc<EngineConfig>,
    driver: Arc<PgDriver>,
    registry: Arc<PolicyRegistry>,
    triggers: Arc<TriggerManager>,
    store: Arc<dyn LogStore>,
    locks: Arc<TableLocks>,
    history: HistoryService,
    tasks: tokio::sync::Mutex<Option<EngineTasks>>,
}

impl TrailEngine {
    /// Build an engine with the default database-backed catalog.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let driver = Arc::new(PgDriver::connect(
            &config.dsn,
            config.pool_size,
            config.statement_timeout,
        )?);
        let catalog = Arc::new(PgCatalog::new(driver.clone()));
        Self::with_catalog(config, driver, catalog)
    }

    /// Build an engine with a caller-supplied catalog.
    pub fn new_with_catalog(config: EngineConfig, catalog: Arc<dyn Catalog>) -> Result<Self> {
        let driver = Arc::new(PgDriver::connect(
            &config.dsn,
            config.pool_size,
            config.statement_timeout,
        )?);
        Self::with_catalog(config, driver, catalog)
    }

    fn with_catalog(
        config: EngineConfig,
        driver: Arc<PgDriver>,
        catalog: Arc<dyn Catalog>,
    ) -> Result<Self> {
        let store: Arc<dyn LogStore> = match config.store_backend {
            StoreBackend::Redb => Arc::new(RedbLogStore::open(&config.log_data_path)?),
        };
        let registry = Arc::new(PolicyRegistry::open(&config.policy_db_path)?);
        let triggers = Arc::new(TriggerManager::new(
            driver.clone(),
            &config.temp_log_table,
            &config.notify_channel,
        ));
        let history = HistoryService::new(store.clone(), registry.clone(), catalog);

        Ok(Self {
            config: Arc::new(config),
            driver,
            registry,
            triggers,
            store,
            locks: Arc::new(TableLocks::default()),
            history,
            tasks: tokio::sync::Mutex::new(None),
        })
    }

    /// Start the background pipeline. Idempotent in the sense that a
    /// second call fails with `InvalidState` instead of spawning twins.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Err(TrailError::invalid_state("already started"));
        }

        self.triggers.ensure_staging().await?;
        self.triggers.install_event_triggers().await?;

        // Tables configured for startup registration: new ones go through
        // the full register path, persisted ones only get reconciled.
        for spec in self.config.register_tables.clone() {
            let table = spec.table.table_name().to_string();
            if self.registry.contains(&table) {
                continue;
            }
            if let Err(e) = self.register(spec).await {
                error!(table, error = %e, "startup registration failed");
            }
        }
        self.reconcile().await?;

        let cancel = CancellationToken::new();
        let watcher_src = EventSource::new(
            self.config.clone(),
            self.driver.clone(),
            self.registry.clone(),
            self.triggers.clone(),
        );
        let (rx, watcher) = watcher_src.spawn(cancel.child_token());
        let saver = LogSaver::new(self.store.clone(), self.locks.clone())
            .spawn(rx, cancel.child_token());
        let sweeper = RetentionSweeper::new(
            self.store.clone(),
            self.registry.clone(),
            self.locks.clone(),
            self.config.sweep_interval,
        )
        .spawn(cancel.child_token());

        *tasks = Some(EngineTasks {
            cancel,
            watcher,
            saver,
            sweeper,
        });
        info!("engine started");
        Ok(())
    }

    /// Stop the pipeline: cancel, then wait for the watcher, the saver
    /// (which drains briefly), and the sweeper.
    pub async fn stop(&self) -> Result<()> {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Err(TrailError::invalid_state("not started"));
        };
        tasks.cancel.cancel();
        for (name, handle) in [
            ("watcher", tasks.watcher),
            ("saver", tasks.saver),
            ("sweeper", tasks.sweeper),
        ] {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "task join failed");
            }
        }
        info!("engine stopped");
        Ok(())
    }

    /// Register a table for capture: persist its policy and install its
    /// trigger. Rolls both back on partial failure.
    pub async fn register(&self, spec: PolicySpec) -> Result<Arc<TablePolicy>> {
        let policy = self.build_policy(&spec).await?;
        let table = policy.table_name.clone();

        if self.registry.contains(&table) {
            return Err(TrailError::policy(format!(
                "table {table:?} already registered"
            )));
        }

        // Installing: policy first, trigger second
        self.registry.create_no_exist(policy.clone())?;
        if let Err(e) = self.triggers.install(&table).await {
            // Roll back to Unregistered
            if let Err(rollback) = self.registry.delete(&table) {
                warn!(table, error = %rollback, "policy rollback failed");
            }
            if let Err(rollback) = self.triggers.remove(&table).await {
                warn!(table, error = %rollback, "trigger rollback failed");
            }
            return Err(e);
        }

        info!(table, "table registered");
        Ok(self.registry.get(&table).unwrap_or_else(|| Arc::new(policy)))
    }

    /// Stop capturing a table: drop its trigger, then its policy.
    pub async fn unregister(&self, table: &str) -> Result<()> {
        if !self.registry.contains(table) {
            return Err(TrailError::policy(format!(
                "table {table:?} not registered"
            )));
        }
        self.triggers.remove(table).await?;
        self.registry.delete(table)?;
        info!(table, "table unregistered");
        Ok(())
    }

    /// Reinstall triggers for any cached policy whose physical trigger is
    /// missing, restoring the policy <-> trigger invariant.
    pub async fn reconcile(&self) -> Result<()> {
        for policy in self.registry.all() {
            let table = &policy.table_name;
            if !self.triggers.installed(table).await? {
                warn!(table, "trigger missing for registered policy, reinstalling");
                self.triggers.install(table).await?;
            }
        }
        Ok(())
    }

    /// Apply a partial policy update.
    pub async fn modify_policy(&self, table: &str, update: PolicyUpdate) -> Result<Arc<TablePolicy>> {
        if let Some(fields) = &update.fields {
            self.check_known_fields(table, fields).await?;
        }
        self.registry.modify(table, update)
    }

    /// Change a table's retention age.
    pub async fn modify_outdate(&self, table: &str, days: u32) -> Result<()> {
        self.registry
            .modify(
                table,
                PolicyUpdate {
                    outdate_days: Some(days),
                    ..PolicyUpdate::default()
                },
            )
            .map(|_| ())
    }

    /// Change a table's sensed fields.
    pub async fn modify_fields(&self, table: &str, fields: Vec<String>) -> Result<()> {
        self.check_known_fields(table, &fields).await?;
        self.registry
            .modify(
                table,
                PolicyUpdate {
                    fields: Some(fields),
                    ..PolicyUpdate::default()
                },
            )
            .map(|_| ())
    }

    /// Change a table's retention floor.
    pub async fn modify_min_log_num(&self, table: &str, n: u32) -> Result<()> {
        self.registry
            .modify(
                table,
                PolicyUpdate {
                    min_log_num: Some(n),
                    ..PolicyUpdate::default()
                },
            )
            .map(|_| ())
    }

    /// Read-side query API.
    pub fn history(&self) -> &HistoryService {
        &self.history
    }

    /// The policy registry (shared with the pipeline).
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Resolve a registration spec into a validated policy.
    async fn build_policy(&self, spec: &PolicySpec) -> Result<TablePolicy> {
        let table = spec.table.table_name().to_string();
        if table.is_empty() {
            return Err(TrailError::policy("table name must not be empty"));
        }
        if !self.driver.table_exists(&table).await? {
            return Err(TrailError::policy(format!("table {table:?} does not exist")));
        }

        let primary_fields = self.driver.get_primary(&table).await?;
        if primary_fields.is_empty() {
            return Err(TrailError::policy(format!(
                "table {table:?} has no primary key"
            )));
        }

        let columns: Vec<String> = self
            .driver
            .get_columns(&table)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        self.check_subset(&table, &spec.sense_fields, &columns)?;

        let fields =
            crate::common::resolve_sensed_fields(&columns, &spec.sense_fields, &spec.ignore_fields);

        let relation = match (&spec.rela_field, &spec.relations) {
            (Some(field), Some(target)) => Some(RelationLink::parse(field, target)?),
            (None, None) => None,
            _ => {
                return Err(TrailError::policy(
                    "rela_field and relations must be set together",
                ))
            }
        };

        // Per-table retention never drops below the engine defaults
        let policy = TablePolicy {
            table_name: table,
            primary_fields,
            fields,
            min_log_num: spec
                .min_log_num
                .unwrap_or(self.config.min_log_num)
                .max(self.config.min_log_num),
            outdate_days: spec
                .outdate_days
                .unwrap_or(self.config.outdate_days)
                .max(self.config.outdate_days),
            relation,
        };
        policy.validate()?;
        Ok(policy)
    }

    async fn check_known_fields(&self, table: &str, fields: &[String]) -> Result<()> {
        let columns: Vec<String> = self
            .driver
            .get_columns(table)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        self.check_subset(table, fields, &columns)
    }

    fn check_subset(&self, table: &str, fields: &[String], columns: &[String]) -> Result<()> {
        for field in fields {
            if field.is_empty() {
                continue;
            }
            if !columns.contains(field) {
                return Err(TrailError::policy(format!(
                    "unknown field {field:?} on table {table:?}"
                )));
            }
        }
        Ok(())
    }
}

//! Default catalog backed by the database's own metadata
//!
//! Embedders with richer schema knowledge can supply their own
//! [`Catalog`]; this one reads `information_schema` directly and uses
//! physical names as both id and display name.

use crate::common::{Catalog, FieldInfo, Result, TableInfo};
use crate::postgres::driver::PgDriver;
use std::sync::Arc;

/// Catalog implementation reading the source database's schema.
pub struct PgCatalog {
    driver: Arc<PgDriver>,
}

impl PgCatalog {
    /// Create a catalog over the given driver.
    pub fn new(driver: Arc<PgDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait::async_trait]
impl Catalog for PgCatalog {
    async fn tables(&self) -> Result<Vec<TableInfo>> {
        Ok(self
            .driver
            .list_tables()
            .await?
            .into_iter()
            .map(|name| TableInfo {
                table_id: name.clone(),
                table_name: name,
                is_listen: false,
            })
            .collect())
    }

    async fn fields(&self, table: &str) -> Result<Vec<FieldInfo>> {
        Ok(self
            .driver
            .get_columns(table)
            .await?
            .into_iter()
            .map(|col| FieldInfo {
                field_id: col.name.clone(),
                field_name: col.name,
            })
            .collect())
    }
}

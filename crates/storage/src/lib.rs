//! SeaORM-backed storage adapters that satisfy the domain storage traits while
//! keeping the database backend swappable (SQLite by default, PostgreSQL via
//! feature flag).

mod builder;
mod dedup_store;
mod entity;
mod errors;
mod ledger_store;
mod migration;
mod watermark_store;

use std::sync::Arc;

use pay_sentinel_domain::config::WatermarkKeys;
use pay_sentinel_domain::storage::StorageResult;
use sea_orm::{Database, DatabaseConnection};

pub use builder::StorageBuilder;
use errors::StorageError;
use migration::run_migrations;

/// Shared storage handle used by the scanner: ledger reads, the scan cursor,
/// and alert dedup keys all live behind the same connection.
#[derive(Clone)]
pub struct SeaOrmStorage {
    db: Arc<DatabaseConnection>,
    watermark_keys: Arc<WatermarkKeys>,
}

impl SeaOrmStorage {
    /// Connects to the provided database URL and ensures the schema is present.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let db = Database::connect(database_url)
            .await
            .map_err(StorageError::from_source)?;
        run_migrations(&db).await?;
        Ok(Self::from_connection(db, WatermarkKeys::default()))
    }

    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    pub(crate) fn from_connection(db: DatabaseConnection, watermark_keys: WatermarkKeys) -> Self {
        Self {
            db: Arc::new(db),
            watermark_keys: Arc::new(watermark_keys),
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    pub fn watermark_keys(&self) -> &WatermarkKeys {
        self.watermark_keys.as_ref()
    }
}

use pay_sentinel_domain::config::WatermarkKeys;
use pay_sentinel_domain::storage::StorageResult;
use sea_orm::Database;

use crate::{errors::StorageError, migration::run_migrations, SeaOrmStorage};

#[derive(Default)]
pub struct StorageBuilder {
    database_url: Option<String>,
    watermark_keys: Option<WatermarkKeys>,
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Overrides the keys the cursor scalars are stored under.
    pub fn watermark_keys(mut self, keys: WatermarkKeys) -> Self {
        self.watermark_keys = Some(keys);
        self
    }

    pub async fn build(self) -> StorageResult<SeaOrmStorage> {
        let url = self
            .database_url
            .ok_or_else(|| StorageError::Database("missing database url".into()))?;
        let db = Database::connect(url)
            .await
            .map_err(StorageError::from_source)?;
        run_migrations(&db).await?;
        Ok(SeaOrmStorage::from_connection(
            db,
            self.watermark_keys.unwrap_or_default(),
        ))
    }
}

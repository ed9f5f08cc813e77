use std::time::Duration;

use chrono::Utc;
use pay_sentinel_domain::model::DedupeKey;
use pay_sentinel_domain::storage::{DedupStore, StorageResult};
use sea_orm::{sea_query::OnConflict, EntityTrait, Set};

use crate::entity::alert_dedupe;
use crate::errors::StorageError;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl DedupStore for SeaOrmStorage {
    async fn contains_key(&self, key: &DedupeKey) -> StorageResult<bool> {
        let maybe = alert_dedupe::Entity::find_by_id(key.as_str().to_string())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(maybe.is_some_and(|model| model.expires_at > Utc::now()))
    }

    async fn insert_with_ttl(&self, key: &DedupeKey, ttl: Duration) -> StorageResult<()> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| StorageError::Database(format!("dedup ttl {ttl:?} out of range")))?;
        let active = alert_dedupe::ActiveModel {
            key: Set(key.as_str().to_string()),
            expires_at: Set(expires_at),
        };
        alert_dedupe::Entity::insert(active)
            .on_conflict(
                OnConflict::column(alert_dedupe::Column::Key)
                    .update_column(alert_dedupe::Column::ExpiresAt)
                    .to_owned(),
            )
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }

    async fn remove_key(&self, key: &DedupeKey) -> StorageResult<()> {
        alert_dedupe::Entity::delete_by_id(key.as_str().to_string())
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }
}

use pay_sentinel_domain::model::Watermark;
use pay_sentinel_domain::storage::{StorageResult, WatermarkStore};
use sea_orm::{sea_query::OnConflict, ConnectionTrait, EntityTrait, Set, TransactionTrait};
use tracing::debug;

use crate::entity::scanner_state;
use crate::errors::StorageError;
use crate::ledger_store::{from_db_int, to_db_int};
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl WatermarkStore for SeaOrmStorage {
    async fn watermark(&self) -> StorageResult<Watermark> {
        let keys = self.watermark_keys();
        let block = read_value(self.connection(), &keys.block).await?;
        let log_index = read_value(self.connection(), &keys.log).await?;

        match (block, log_index) {
            (Some(block), Some(log_index)) => Ok(Watermark::new(
                from_db_int(block)?,
                from_db_int(log_index)?,
            )),
            _ => Ok(Watermark::ORIGIN),
        }
    }

    async fn set_watermark(&self, watermark: Watermark) -> StorageResult<()> {
        let keys = self.watermark_keys();
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;
        upsert_value(&txn, &keys.block, to_db_int(watermark.block)?).await?;
        upsert_value(&txn, &keys.log, to_db_int(watermark.log_index)?).await?;
        txn.commit().await.map_err(StorageError::from_source)?;
        debug!(%watermark, "watermark persisted");
        Ok(())
    }
}

async fn read_value<C: ConnectionTrait>(conn: &C, key: &str) -> StorageResult<Option<i64>> {
    let maybe = scanner_state::Entity::find_by_id(key.to_string())
        .one(conn)
        .await
        .map_err(StorageError::from_source)?;
    Ok(maybe.map(|model| model.value_int))
}

async fn upsert_value<C: ConnectionTrait>(conn: &C, key: &str, value: i64) -> StorageResult<()> {
    let active = scanner_state::ActiveModel {
        key: Set(key.to_string()),
        value_int: Set(value),
    };
    scanner_state::Entity::insert(active)
        .on_conflict(
            OnConflict::column(scanner_state::Column::Key)
                .update_column(scanner_state::Column::ValueInt)
                .to_owned(),
        )
        .exec(conn)
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}

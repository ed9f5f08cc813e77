use chrono::{DateTime, Utc};
use pay_sentinel_domain::model::{NewPayment, PaymentRecord, Watermark};
use pay_sentinel_domain::storage::{PaymentLedger, StorageResult};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, Condition, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Select, Set,
};

use crate::entity::{payments, wallets};
use crate::errors::StorageError;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl PaymentLedger for SeaOrmStorage {
    async fn payments_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> StorageResult<Vec<PaymentRecord>> {
        let query = payments::Entity::find().filter(payments::Column::Timestamp.gte(cutoff));
        self.fetch_ordered(query, limit).await
    }

    async fn payments_after(
        &self,
        after: Watermark,
        limit: u64,
    ) -> StorageResult<Vec<PaymentRecord>> {
        let block = to_db_int(after.block)?;
        let log_index = to_db_int(after.log_index)?;
        let query = payments::Entity::find().filter(
            Condition::any()
                .add(payments::Column::BlockNumber.gt(block))
                .add(
                    Condition::all()
                        .add(payments::Column::BlockNumber.eq(block))
                        .add(payments::Column::LogIndex.gt(log_index)),
                ),
        );
        self.fetch_ordered(query, limit).await
    }

    async fn insert_payment(&self, payment: NewPayment) -> StorageResult<()> {
        let wallet_id = payment.address.to_ascii_lowercase();
        let wallet = wallets::ActiveModel {
            id: Set(wallet_id.clone()),
            address: Set(payment.address),
        };
        wallets::Entity::insert(wallet)
            .on_conflict(
                OnConflict::column(wallets::Column::Id)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;

        let model = payments::ActiveModel {
            id: Set(payment.id),
            wallet_id: Set(wallet_id),
            amount: Set(payment.amount),
            tx_hash: Set(payment.tx_hash),
            block_number: Set(to_db_int(payment.block_number)?),
            log_index: Set(to_db_int(payment.log_index)?),
            timestamp: Set(payment.timestamp),
        };
        payments::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([payments::Column::TxHash, payments::Column::LogIndex])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }
}

impl SeaOrmStorage {
    async fn fetch_ordered(
        &self,
        query: Select<payments::Entity>,
        limit: u64,
    ) -> StorageResult<Vec<PaymentRecord>> {
        let rows = query
            .inner_join(wallets::Entity)
            .select_also(wallets::Entity)
            .order_by_asc(payments::Column::BlockNumber)
            .order_by_asc(payments::Column::LogIndex)
            .limit(limit)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?;

        rows.into_iter()
            .filter_map(|(payment, wallet)| wallet.map(|wallet| (payment, wallet)))
            .map(|(payment, wallet)| payment_to_record(payment, wallet))
            .collect()
    }
}

fn payment_to_record(
    model: payments::Model,
    wallet: wallets::Model,
) -> StorageResult<PaymentRecord> {
    Ok(PaymentRecord {
        block_number: from_db_int(model.block_number)?,
        log_index: from_db_int(model.log_index)?,
        id: model.id,
        amount: model.amount,
        tx_hash: model.tx_hash,
        timestamp: model.timestamp,
        address: wallet.address,
    })
}

pub(crate) fn to_db_int(value: u64) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::Database(format!("value {value} exceeds i64 range")))
}

pub(crate) fn from_db_int(value: i64) -> StorageResult<u64> {
    u64::try_from(value)
        .map_err(|_| StorageError::Database(format!("negative ledger position {value}")))
}

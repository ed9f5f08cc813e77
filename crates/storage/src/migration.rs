use sea_orm::sea_query::{ColumnDef, Index, IndexCreateStatement, Table, TableCreateStatement};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection};

use crate::entity::{alert_dedupe, payments, scanner_state, wallets};
use pay_sentinel_domain::storage::StorageResult;

pub async fn run_migrations(db: &DatabaseConnection) -> StorageResult<()> {
    let backend = db.get_database_backend();

    let wallets_table = Table::create()
        .table(wallets::Entity)
        .col(
            ColumnDef::new(wallets::Column::Id)
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(wallets::Column::Address)
                .string_len(42)
                .not_null()
                .unique_key(),
        )
        .to_owned();
    create_table(db, backend, wallets_table).await?;

    let payments_table = Table::create()
        .table(payments::Entity)
        .col(
            ColumnDef::new(payments::Column::Id)
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(payments::Column::WalletId)
                .string_len(64)
                .not_null(),
        )
        .col(ColumnDef::new(payments::Column::Amount).text().not_null())
        .col(
            ColumnDef::new(payments::Column::TxHash)
                .string_len(66)
                .not_null(),
        )
        .col(
            ColumnDef::new(payments::Column::BlockNumber)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(payments::Column::LogIndex)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(payments::Column::Timestamp)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, payments_table).await?;

    create_index(
        db,
        backend,
        Index::create()
            .name("idx_payments_tx_log")
            .table(payments::Entity)
            .col(payments::Column::TxHash)
            .col(payments::Column::LogIndex)
            .unique()
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        backend,
        Index::create()
            .name("idx_payments_position")
            .table(payments::Entity)
            .col(payments::Column::BlockNumber)
            .col(payments::Column::LogIndex)
            .to_owned(),
    )
    .await?;

    let state_table = Table::create()
        .table(scanner_state::Entity)
        .col(
            ColumnDef::new(scanner_state::Column::Key)
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(scanner_state::Column::ValueInt)
                .big_integer()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, state_table).await?;

    let dedupe_table = Table::create()
        .table(alert_dedupe::Entity)
        .col(
            ColumnDef::new(alert_dedupe::Column::Key)
                .string_len(255)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(alert_dedupe::Column::ExpiresAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, dedupe_table).await?;

    Ok(())
}

async fn create_table(
    db: &DatabaseConnection,
    backend: DatabaseBackend,
    mut statement: TableCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    db.execute(backend.build(&statement))
        .await
        .map_err(crate::errors::StorageError::from_source)?;
    Ok(())
}

async fn create_index(
    db: &DatabaseConnection,
    backend: DatabaseBackend,
    mut statement: IndexCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    db.execute(backend.build(&statement))
        .await
        .map_err(crate::errors::StorageError::from_source)?;
    Ok(())
}

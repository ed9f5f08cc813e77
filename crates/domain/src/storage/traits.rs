use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{DedupeKey, NewPayment, PaymentRecord, Watermark};

/// Common result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
}

impl StorageError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

/// Read side of the append-only payment ledger. Both queries return rows
/// ordered by `(block_number, log_index)` ascending, capped at `limit`.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Rows with `timestamp >= cutoff` (first run, bounded lookback).
    async fn payments_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> StorageResult<Vec<PaymentRecord>>;

    /// Rows strictly after `after` in ledger order.
    async fn payments_after(
        &self,
        after: Watermark,
        limit: u64,
    ) -> StorageResult<Vec<PaymentRecord>>;

    /// Appends a payment; re-inserting the same `(tx_hash, log_index)` is a no-op.
    async fn insert_payment(&self, payment: NewPayment) -> StorageResult<()>;
}

/// Durable scan cursor. `set` overwrites unconditionally; callers keep a
/// single writer.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Returns [`Watermark::ORIGIN`] when nothing has been stored.
    async fn watermark(&self) -> StorageResult<Watermark>;
    async fn set_watermark(&self, watermark: Watermark) -> StorageResult<()>;
}

/// Alert suppression keys with expiry.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// `true` when the key exists and has not expired.
    async fn contains_key(&self, key: &DedupeKey) -> StorageResult<bool>;
    async fn insert_with_ttl(&self, key: &DedupeKey, ttl: Duration) -> StorageResult<()>;
    async fn remove_key(&self, key: &DedupeKey) -> StorageResult<()>;
}

//! Pulls the next ordered batch of unseen ledger events for a scan run.

use chrono::{DateTime, Duration, Utc};
use pay_sentinel_domain::config::ScanSettings;
use pay_sentinel_domain::model::{PaymentRecord, Watermark};
use pay_sentinel_domain::storage::{PaymentLedger, StorageResult};
use tracing::debug;

/// Fetches at most `max_batch_size` records after `watermark`, ordered by
/// ledger position.
///
/// With the origin watermark only the last `lookback_days` are read, so a
/// first run does not backfill the entire history. The result never contains
/// a record at or before a non-origin watermark, whatever the ledger returns.
pub async fn fetch_batch<L>(
    ledger: &L,
    watermark: Watermark,
    settings: &ScanSettings,
    now: DateTime<Utc>,
) -> StorageResult<Vec<PaymentRecord>>
where
    L: PaymentLedger + ?Sized,
{
    let limit = settings.max_batch_size;
    let mut batch = if watermark.is_origin() {
        let cutoff = lookback_cutoff(now, settings.lookback_days);
        debug!(%cutoff, limit, "fetching lookback window");
        ledger.payments_since(cutoff, limit).await?
    } else {
        debug!(%watermark, limit, "fetching after watermark");
        let mut rows = ledger.payments_after(watermark, limit).await?;
        rows.retain(|record| record.position() > watermark);
        rows
    };

    batch.sort_by_key(PaymentRecord::position);
    batch.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    Ok(batch)
}

/// Start of the lookback window, clamped to the Unix epoch.
fn lookback_cutoff(now: DateTime<Utc>, lookback_days: u32) -> DateTime<Utc> {
    now.checked_sub_signed(Duration::days(i64::from(lookback_days)))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |cutoff| {
            cutoff.max(DateTime::<Utc>::UNIX_EPOCH)
        })
}

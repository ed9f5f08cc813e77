use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use pay_sentinel_domain::{
    config::{ConfigError, RetrySettings, ScanSettings},
    model::Watermark,
    services::telemetry::TelemetryError,
    storage::{DedupStore, PaymentLedger, StorageError, WatermarkStore},
};

use crate::{
    detectors::DetectorEnsemble,
    features::FeatureEngine,
    fetcher::fetch_batch,
    notifier::{notify, AlertSink, DeliveryError},
};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("http client error: {0}")]
    Http(#[from] DeliveryError),
    #[error("scan failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ScanError>,
    },
}

/// Summary of one completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub payments_processed: usize,
    pub anomalies_detected: usize,
    pub alerts_delivered: usize,
    pub alerts_failed: usize,
    pub alerts_suppressed: usize,
    /// Stored cursor after the run.
    pub watermark: Watermark,
    pub watermark_advanced: bool,
}

impl ScanReport {
    fn idle(watermark: Watermark) -> Self {
        Self {
            payments_processed: 0,
            anomalies_detected: 0,
            alerts_delivered: 0,
            alerts_failed: 0,
            alerts_suppressed: 0,
            watermark,
            watermark_advanced: false,
        }
    }
}

/// Exponential backoff between whole-run attempts: `base * 2^attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(value: RetrySettings) -> Self {
        Self {
            base: value.base,
            max_retries: value.max_retries,
        }
    }
}

/// One logical scanner: a single writer of the watermark and dedup keys.
pub struct Scanner<S, A> {
    storage: S,
    sink: A,
    settings: ScanSettings,
    features: FeatureEngine,
    detectors: DetectorEnsemble,
}

impl<S, A> Scanner<S, A>
where
    S: PaymentLedger + WatermarkStore + DedupStore,
    A: AlertSink,
{
    pub fn new(storage: S, sink: A, settings: ScanSettings) -> Self {
        let features = FeatureEngine::from_settings(&settings);
        let detectors = DetectorEnsemble::from_settings(&settings.detectors);
        Self {
            storage,
            sink,
            settings,
            features,
            detectors,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn sink(&self) -> &A {
        &self.sink
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.settings.retry.into()
    }

    /// Fetch, engineer, detect, notify, then advance the watermark to the
    /// last fetched row. Any storage failure aborts before the watermark moves.
    pub async fn run_once(&self) -> Result<ScanReport, ScanError> {
        let start = self.storage.watermark().await?;
        let batch = fetch_batch(&self.storage, start, &self.settings, Utc::now()).await?;
        histogram!("scan_batch_rows", batch.len() as f64);

        let Some(last) = batch.last().map(|record| record.position()) else {
            debug!(watermark = %start, "no new payments");
            return Ok(ScanReport::idle(start));
        };

        let payments_processed = batch.len();
        let rows = self.features.engineer(batch);
        let candidates = self.detectors.run(&rows);
        let outcome = notify(
            &self.storage,
            &self.sink,
            &self.settings.notifier,
            &candidates,
        )
        .await?;

        let hold = self.settings.strict_watermark && outcome.failed > 0;
        let watermark = if hold {
            warn!(
                failed = outcome.failed,
                watermark = %start,
                "holding watermark until failed alerts are delivered"
            );
            start
        } else {
            self.storage.set_watermark(last).await?;
            gauge!("scan_watermark_block", last.block as f64);
            last
        };

        info!(
            processed = payments_processed,
            anomalies = candidates.len(),
            delivered = outcome.delivered,
            failed = outcome.failed,
            suppressed = outcome.suppressed,
            %watermark,
            "scan complete"
        );

        Ok(ScanReport {
            payments_processed,
            anomalies_detected: candidates.len(),
            alerts_delivered: outcome.delivered,
            alerts_failed: outcome.failed,
            alerts_suppressed: outcome.suppressed,
            watermark,
            watermark_advanced: !hold,
        })
    }

    /// Retries the whole run with exponential backoff and returns
    /// [`ScanError::RetriesExhausted`] once the cap is reached.
    pub async fn run_with_retry(&self) -> Result<ScanReport, ScanError> {
        let policy = self.retry_policy();
        let mut attempt = 0u32;
        loop {
            match self.run_once().await {
                Ok(report) => {
                    counter!("scan_runs_total", 1, "result" => "ok");
                    return Ok(report);
                }
                Err(err) if attempt >= policy.max_retries => {
                    counter!("scan_runs_total", 1, "result" => "error");
                    error!(attempts = attempt + 1, %err, "scan retries exhausted");
                    return Err(ScanError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = policy.delay(attempt);
                    warn!(attempt, ?delay, %err, "scan failed; retrying");
                    counter!("scan_retries_total", 1);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Triggers a run every `period`. Terminal failures are logged and the next
/// tick starts over from the persisted watermark.
pub async fn run_scheduled<S, A>(scanner: &Scanner<S, A>, period: Duration)
where
    S: PaymentLedger + WatermarkStore + DedupStore,
    A: AlertSink,
{
    let mut ticker = interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = scanner.run_with_retry().await {
            error!(%err, "scheduled scan failed; waiting for next tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use pay_sentinel_domain::model::{DedupeKey, DetectionRule, NewPayment, PaymentRecord};
    use pay_sentinel_domain::storage::StorageResult;
    use pay_sentinel_storage::SeaOrmStorage;

    use crate::testing::RecordingSink;

    const WEI: u128 = 1_000_000_000_000_000;

    async fn storage() -> SeaOrmStorage {
        SeaOrmStorage::connect("sqlite::memory:").await.unwrap()
    }

    /// Ten distinct transactions: nine near the reference price, one at 50x.
    async fn seed_scenario_a(storage: &SeaOrmStorage) {
        let milli_eth = [97u128, 98, 99, 99, 100, 100, 101, 102, 103, 5_000];
        let now = Utc::now();
        for (idx, amount) in milli_eth.iter().enumerate() {
            let block = 100 + idx as u64;
            storage
                .insert_payment(NewPayment {
                    id: format!("pay-{idx}"),
                    address: format!("0xWallet{idx}"),
                    amount: (amount * WEI).to_string(),
                    tx_hash: format!("0xhash{idx}"),
                    block_number: block,
                    log_index: (idx % 2) as u64,
                    timestamp: now - ChronoDuration::minutes(60 - idx as i64),
                })
                .await
                .unwrap();
        }
    }

    fn settings() -> ScanSettings {
        let mut settings = ScanSettings::default();
        settings.detectors.zscore_threshold = 2.5;
        settings.retry = RetrySettings {
            base: Duration::from_millis(1),
            max_retries: 3,
        };
        settings
    }

    fn key(tx: &str, rule: DetectionRule) -> DedupeKey {
        DedupeKey::derive("an:dup:", tx, rule)
    }

    #[tokio::test]
    async fn scenario_a_alerts_outlier_under_two_rules() {
        let storage = storage().await;
        seed_scenario_a(&storage).await;
        let scanner = Scanner::new(storage, RecordingSink::default(), settings());

        let report = scanner.run_once().await.unwrap();
        assert_eq!(report.payments_processed, 10);
        assert_eq!(report.anomalies_detected, 2);
        assert_eq!(report.alerts_delivered, 2);
        assert_eq!(report.watermark, Watermark::new(109, 1));

        let delivered = scanner.sink().delivered();
        let rules: Vec<_> = delivered.iter().map(|a| a.payload.rule.as_str()).collect();
        assert_eq!(rules, vec!["IQR", "ZSCORE"]);
        assert!(delivered.iter().all(|a| a.payload.tx_hash == "0xhash9"));
        assert_eq!(delivered[0].payload.amount_wei, "5000000000000000000");

        let stored = scanner.storage();
        assert!(stored.contains_key(&key("0xhash9", DetectionRule::Range)).await.unwrap());
        assert!(stored.contains_key(&key("0xhash9", DetectionRule::Deviation)).await.unwrap());
        assert_eq!(stored.watermark().await.unwrap(), Watermark::new(109, 1));
    }

    #[tokio::test]
    async fn scenario_b_empty_first_run_is_a_no_op() {
        let scanner = Scanner::new(storage().await, RecordingSink::default(), settings());

        let report = scanner.run_once().await.unwrap();
        assert_eq!(report.payments_processed, 0);
        assert!(!report.watermark_advanced);
        assert_eq!(scanner.storage().watermark().await.unwrap(), Watermark::ORIGIN);
        assert_eq!(scanner.sink().attempts(), 0);
    }

    #[tokio::test]
    async fn scenario_c_strict_mode_redelivers_failed_alert_once() {
        let storage = storage().await;
        seed_scenario_a(&storage).await;
        let mut settings = settings();
        settings.detectors.use_zscore = false;
        settings.strict_watermark = true;
        let scanner = Scanner::new(storage, RecordingSink::default(), settings);
        let range_key = key("0xhash9", DetectionRule::Range);

        scanner.sink().fail_next(1);
        let first = scanner.run_once().await.unwrap();
        assert_eq!(first.alerts_failed, 1);
        assert!(!first.watermark_advanced);
        assert!(!scanner.storage().contains_key(&range_key).await.unwrap());
        assert_eq!(scanner.storage().watermark().await.unwrap(), Watermark::ORIGIN);

        let second = scanner.run_once().await.unwrap();
        assert_eq!(second.alerts_delivered, 1);
        assert!(second.watermark_advanced);
        assert!(scanner.storage().contains_key(&range_key).await.unwrap());

        let third = scanner.run_once().await.unwrap();
        assert_eq!(third.payments_processed, 0);
        assert_eq!(scanner.sink().attempts(), 2);
        assert_eq!(scanner.sink().delivered().len(), 1);
    }

    #[tokio::test]
    async fn default_mode_advances_past_failed_delivery() {
        let storage = storage().await;
        seed_scenario_a(&storage).await;
        let scanner = Scanner::new(storage, RecordingSink::default(), settings());

        scanner.sink().fail_next(1);
        let report = scanner.run_once().await.unwrap();
        assert_eq!((report.alerts_delivered, report.alerts_failed), (1, 1));
        assert!(report.watermark_advanced);
        assert!(!scanner
            .storage()
            .contains_key(&key("0xhash9", DetectionRule::Range))
            .await
            .unwrap());

        let next = scanner.run_once().await.unwrap();
        assert_eq!(next.payments_processed, 0);
        assert_eq!(scanner.sink().attempts(), 2);
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards_across_runs() {
        let storage = storage().await;
        seed_scenario_a(&storage).await;
        let mut settings = settings();
        settings.detectors.use_zscore = false;
        settings.strict_watermark = true;
        let scanner = Scanner::new(storage, RecordingSink::default(), settings);

        let mut observed = vec![scanner.storage().watermark().await.unwrap()];
        scanner.sink().fail_next(1);
        for round in 0..5 {
            if round == 3 {
                for (offset, log) in [(0u64, 0u64), (0, 1), (2, 0)] {
                    scanner
                        .storage()
                        .insert_payment(NewPayment {
                            id: format!("late-{offset}-{log}"),
                            address: "0xLate".into(),
                            amount: (100 * WEI).to_string(),
                            tx_hash: format!("0xlate{offset}{log}"),
                            block_number: 200 + offset,
                            log_index: log,
                            timestamp: Utc::now(),
                        })
                        .await
                        .unwrap();
                }
            }
            let report = scanner.run_once().await.unwrap();
            let stored = scanner.storage().watermark().await.unwrap();
            assert_eq!(report.watermark, stored);
            observed.push(stored);
        }

        assert!(
            observed.windows(2).all(|pair| pair[0] <= pair[1]),
            "watermark regressed: {observed:?}"
        );
        assert_eq!(observed[1], Watermark::ORIGIN);
        assert_eq!(observed[2], Watermark::new(109, 1));
        assert_eq!(observed[3], Watermark::new(109, 1));
        assert_eq!(observed[5], Watermark::new(202, 0));
    }

    #[tokio::test]
    async fn rescanning_within_ttl_sends_nothing_new() {
        let storage = storage().await;
        seed_scenario_a(&storage).await;
        let scanner = Scanner::new(storage, RecordingSink::default(), settings());

        scanner.run_once().await.unwrap();
        scanner
            .storage()
            .set_watermark(Watermark::ORIGIN)
            .await
            .unwrap();
        let again = scanner.run_once().await.unwrap();

        assert_eq!(again.anomalies_detected, 2);
        assert_eq!(again.alerts_suppressed, 2);
        assert_eq!(scanner.sink().delivered().len(), 2);
        assert_eq!(again.watermark, Watermark::new(109, 1));
    }

    #[tokio::test]
    async fn whitelisted_outlier_produces_no_webhook() {
        let storage = storage().await;
        seed_scenario_a(&storage).await;
        let mut settings = settings();
        settings.notifier.whitelist.insert("0xwallet9".to_string());
        let scanner = Scanner::new(storage, RecordingSink::default(), settings);

        let report = scanner.run_once().await.unwrap();
        assert_eq!(report.anomalies_detected, 2);
        assert_eq!(scanner.sink().attempts(), 0);
        assert!(report.watermark_advanced);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            base: Duration::from_secs(60),
            max_retries: 3,
        };
        assert_eq!(policy.delay(0), Duration::from_secs(60));
        assert_eq!(policy.delay(2), Duration::from_secs(240));
        assert_eq!(
            policy.delay(64),
            Duration::from_secs(60 * u64::from(u32::MAX))
        );
    }

    /// Delegates to SQLite but fails the first `read_failures` cursor reads,
    /// and every cursor write while `fail_writes` is non-zero.
    struct FlakyStorage {
        inner: SeaOrmStorage,
        read_failures: AtomicU32,
        fail_writes: AtomicU32,
    }

    impl FlakyStorage {
        async fn new(read_failures: u32, fail_writes: bool) -> Self {
            Self {
                inner: storage().await,
                read_failures: AtomicU32::new(read_failures),
                fail_writes: AtomicU32::new(u32::from(fail_writes)),
            }
        }
    }

    fn outage() -> StorageError {
        StorageError::Database("connection reset".into())
    }

    #[async_trait]
    impl PaymentLedger for FlakyStorage {
        async fn payments_since(
            &self,
            cutoff: DateTime<Utc>,
            limit: u64,
        ) -> StorageResult<Vec<PaymentRecord>> {
            self.inner.payments_since(cutoff, limit).await
        }

        async fn payments_after(
            &self,
            after: Watermark,
            limit: u64,
        ) -> StorageResult<Vec<PaymentRecord>> {
            self.inner.payments_after(after, limit).await
        }

        async fn insert_payment(&self, payment: NewPayment) -> StorageResult<()> {
            self.inner.insert_payment(payment).await
        }
    }

    #[async_trait]
    impl WatermarkStore for FlakyStorage {
        async fn watermark(&self) -> StorageResult<Watermark> {
            let remaining = self.read_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.read_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(outage());
            }
            self.inner.watermark().await
        }

        async fn set_watermark(&self, watermark: Watermark) -> StorageResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) > 0 {
                return Err(outage());
            }
            self.inner.set_watermark(watermark).await
        }
    }

    #[async_trait]
    impl DedupStore for FlakyStorage {
        async fn contains_key(&self, key: &DedupeKey) -> StorageResult<bool> {
            self.inner.contains_key(key).await
        }

        async fn insert_with_ttl(&self, key: &DedupeKey, ttl: Duration) -> StorageResult<()> {
            self.inner.insert_with_ttl(key, ttl).await
        }

        async fn remove_key(&self, key: &DedupeKey) -> StorageResult<()> {
            self.inner.remove_key(key).await
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let storage = FlakyStorage::new(2, false).await;
        seed_scenario_a(&storage.inner).await;
        let scanner = Scanner::new(storage, RecordingSink::default(), settings());

        let report = scanner.run_with_retry().await.unwrap();
        assert_eq!(report.payments_processed, 10);
        assert_eq!(report.watermark, Watermark::new(109, 1));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let scanner = Scanner::new(
            FlakyStorage::new(10, false).await,
            RecordingSink::default(),
            settings(),
        );

        let err = scanner.run_with_retry().await.unwrap_err();
        match err {
            ScanError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last, ScanError::Storage(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failed_watermark_write_leaves_cursor_unchanged() {
        let storage = FlakyStorage::new(0, true).await;
        seed_scenario_a(&storage.inner).await;
        let scanner = Scanner::new(storage, RecordingSink::default(), settings());

        let err = scanner.run_once().await.unwrap_err();
        assert!(matches!(err, ScanError::Storage(_)));
        assert_eq!(
            scanner.storage().inner.watermark().await.unwrap(),
            Watermark::ORIGIN
        );

        scanner.storage().fail_writes.store(0, Ordering::SeqCst);
        let retry = scanner.run_once().await.unwrap();
        assert_eq!(retry.alerts_suppressed, 2);
        assert_eq!(retry.watermark, Watermark::new(109, 1));
    }
}

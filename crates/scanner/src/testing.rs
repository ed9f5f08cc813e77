//! Builders and fakes shared by the unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use pay_sentinel_domain::model::PaymentRecord;

use crate::features::FeatureRow;
use crate::notifier::{Alert, AlertSink, DeliveryError};

pub(crate) fn record(tx_hash: &str, block: u64, log: u64, amount: &str) -> PaymentRecord {
    PaymentRecord {
        id: format!("pay-{block}-{log}"),
        amount: amount.to_string(),
        tx_hash: tx_hash.to_string(),
        block_number: block,
        log_index: log,
        timestamp: Utc::now(),
        address: format!("0xAddr{block}"),
    }
}

/// One row per amount with `ratio == amount_scaled`; tx hashes are `0xtx{i}`.
pub(crate) fn feature_rows(amounts: &[f64]) -> Vec<FeatureRow> {
    amounts
        .iter()
        .enumerate()
        .map(|(idx, &amount)| {
            let record = record(&format!("0xtx{idx}"), idx as u64 + 1, 0, "0");
            FeatureRow {
                amount_units: Some(0),
                amount_scaled: Some(amount),
                ratio: Some(amount),
                address_normalized: record.address.to_ascii_lowercase(),
                inter_arrival_seconds: None,
                address_batch_count: 1,
                record,
            }
        })
        .collect()
}

/// Sink that records every delivered alert. Failures can be scripted per
/// call or per transaction hash.
#[derive(Default)]
pub(crate) struct RecordingSink {
    delivered: Mutex<Vec<Alert>>,
    attempts: Mutex<usize>,
    scripted: Mutex<VecDeque<bool>>,
    failing_tx: Mutex<HashSet<String>>,
}

impl RecordingSink {
    /// The next `count` deliveries fail regardless of content.
    pub(crate) fn fail_next(&self, count: usize) {
        self.scripted.lock().unwrap().extend(std::iter::repeat(false).take(count));
    }

    pub(crate) fn fail_tx(&self, tx_hash: &str) {
        self.failing_tx.lock().unwrap().insert(tx_hash.to_string());
    }

    pub(crate) fn heal(&self) {
        self.scripted.lock().unwrap().clear();
        self.failing_tx.lock().unwrap().clear();
    }

    pub(crate) fn delivered(&self) -> Vec<Alert> {
        self.delivered.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        *self.attempts.lock().unwrap() += 1;
        let scripted_ok = self.scripted.lock().unwrap().pop_front().unwrap_or(true);
        let tx_ok = !self
            .failing_tx
            .lock()
            .unwrap()
            .contains(&alert.payload.tx_hash);
        if scripted_ok && tx_ok {
            self.delivered.lock().unwrap().push(alert.clone());
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            })
        }
    }
}

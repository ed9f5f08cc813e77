//! Per-row signals derived from one batch. The transform is pure: nothing
//! carries over between batches, so `inter_arrival_seconds` only sees gaps
//! between payments fetched together.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pay_sentinel_domain::config::ScanSettings;
use pay_sentinel_domain::model::PaymentRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub record: PaymentRecord,
    /// Parsed amount in smallest units; `None` when the ledger text is malformed.
    pub amount_units: Option<u128>,
    /// Amount in human units (e.g. ETH).
    pub amount_scaled: Option<f64>,
    /// Amount divided by the expected reference price.
    pub ratio: Option<f64>,
    pub address_normalized: String,
    /// Seconds since the previous payment from the same address in this batch.
    pub inter_arrival_seconds: Option<f64>,
    pub address_batch_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureEngine {
    reference_price: u128,
    amount_decimals: u32,
}

impl FeatureEngine {
    pub fn new(reference_price: u128, amount_decimals: u32) -> Self {
        Self {
            reference_price,
            amount_decimals,
        }
    }

    pub fn from_settings(settings: &ScanSettings) -> Self {
        Self::new(settings.reference_price, settings.amount_decimals)
    }

    /// Derives features for a batch and returns the rows in ledger order.
    pub fn engineer(&self, records: Vec<PaymentRecord>) -> Vec<FeatureRow> {
        let scale = 10f64.powi(self.amount_decimals as i32);
        let mut rows: Vec<FeatureRow> = records
            .into_iter()
            .map(|record| {
                let amount_units = record.amount_units();
                let amount = amount_units.map(|units| units as f64);
                FeatureRow {
                    amount_units,
                    amount_scaled: amount.map(|value| value / scale),
                    ratio: amount
                        .filter(|_| self.reference_price > 0)
                        .map(|value| value / self.reference_price as f64),
                    address_normalized: record.address.to_ascii_lowercase(),
                    inter_arrival_seconds: None,
                    address_batch_count: 0,
                    record,
                }
            })
            .collect();

        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, row) in rows.iter().enumerate() {
            groups
                .entry(row.address_normalized.clone())
                .or_default()
                .push(idx);
        }

        for members in groups.values_mut() {
            members.sort_by_key(|&idx| (rows[idx].record.timestamp, rows[idx].record.position()));
            let count = members.len();
            let mut previous: Option<DateTime<Utc>> = None;
            for &idx in members.iter() {
                let timestamp = rows[idx].record.timestamp;
                rows[idx].address_batch_count = count;
                rows[idx].inter_arrival_seconds = previous
                    .map(|prev| (timestamp - prev).num_milliseconds() as f64 / 1000.0);
                previous = Some(timestamp);
            }
        }

        rows.sort_by_key(|row| row.record.position());
        rows
    }
}

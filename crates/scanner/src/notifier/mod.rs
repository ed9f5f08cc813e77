//! Turns anomaly candidates into webhook alerts, at most once per dedupe TTL.

mod webhook;

pub use webhook::{AlertSink, DeliveryError, WebhookSink};

use chrono::{DateTime, SecondsFormat, Utc};
use metrics::counter;
use pay_sentinel_domain::config::NotifierSettings;
use pay_sentinel_domain::model::DedupeKey;
use pay_sentinel_domain::storage::{DedupStore, StorageResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::detectors::AnomalyCandidate;

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub dedupe_key: DedupeKey,
    pub payload: AlertPayload,
}

/// JSON body posted to the alert consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub address: String,
    pub tx_hash: String,
    /// Exact ledger text; never routed through a float.
    pub amount_wei: String,
    pub block_number: u64,
    pub log_index: u64,
    pub rule: String,
    pub score: f64,
    pub dedupe_key: String,
    pub ts: String,
    pub meta: AlertMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMeta {
    pub amount_eth: Option<f64>,
    pub ratio: Option<f64>,
    #[serde(rename = "delta_t")]
    pub delta_t: Option<f64>,
    pub batch_count_for_address: usize,
}

/// Per-run delivery tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub delivered: usize,
    pub failed: usize,
    pub suppressed: usize,
    pub whitelisted: usize,
}

pub fn build_alert(candidate: &AnomalyCandidate<'_>, prefix: &str, now: DateTime<Utc>) -> Alert {
    let row = candidate.row;
    let record = &row.record;
    let dedupe_key = DedupeKey::derive(prefix, &record.tx_hash, candidate.rule);
    let payload = AlertPayload {
        address: row.address_normalized.clone(),
        tx_hash: record.tx_hash.clone(),
        amount_wei: row
            .amount_units
            .map(|units| units.to_string())
            .unwrap_or_else(|| record.amount.clone()),
        block_number: record.block_number,
        log_index: record.log_index,
        rule: candidate.rule.tag().to_string(),
        score: candidate.score,
        dedupe_key: dedupe_key.as_str().to_string(),
        ts: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        meta: AlertMeta {
            amount_eth: row.amount_scaled,
            ratio: row.ratio,
            delta_t: row.inter_arrival_seconds,
            batch_count_for_address: row.address_batch_count,
        },
    };
    Alert {
        dedupe_key,
        payload,
    }
}

/// Delivers each candidate in order. A key is written only after a
/// successful delivery, so failed alerts stay eligible for a later run.
/// Dedup store errors abort the call.
pub async fn notify<D, S>(
    dedup: &D,
    sink: &S,
    settings: &NotifierSettings,
    candidates: &[AnomalyCandidate<'_>],
) -> StorageResult<NotifyOutcome>
where
    D: DedupStore + ?Sized,
    S: AlertSink + ?Sized,
{
    let mut outcome = NotifyOutcome::default();

    for candidate in candidates {
        let row = candidate.row;
        if settings.whitelist.contains(&row.address_normalized) {
            debug!(address = %row.address_normalized, "skipping whitelisted address");
            counter!("scan_alerts_total", 1, "result" => "whitelisted");
            outcome.whitelisted += 1;
            continue;
        }

        let alert = build_alert(candidate, &settings.dedup_prefix, Utc::now());
        if dedup.contains_key(&alert.dedupe_key).await? {
            debug!(key = %alert.dedupe_key, "alert already sent within ttl");
            counter!("scan_alerts_total", 1, "result" => "duplicate");
            outcome.suppressed += 1;
            continue;
        }

        match sink.deliver(&alert).await {
            Ok(()) => {
                dedup
                    .insert_with_ttl(&alert.dedupe_key, settings.dedup_ttl)
                    .await?;
                info!(key = %alert.dedupe_key, score = candidate.score, "alert delivered");
                counter!("scan_alerts_total", 1, "result" => "delivered");
                outcome.delivered += 1;
            }
            Err(err) => {
                warn!(key = %alert.dedupe_key, %err, "alert delivery failed");
                counter!("scan_alerts_total", 1, "result" => "failed");
                outcome.failed += 1;
            }
        }
    }

    Ok(outcome)
}

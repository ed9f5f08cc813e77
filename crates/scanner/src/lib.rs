//! Library entrypoint for the payment anomaly scanner. The binary in
//! `main.rs` drives [`worker::Scanner`] on a schedule; embedding processes can
//! call [`worker::Scanner::run_with_retry`] from their own trigger instead.

pub mod detectors;
pub mod features;
pub mod fetcher;
pub mod notifier;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use detectors::{AnomalyCandidate, Detector, DetectorEnsemble, DetectorError};
pub use features::{FeatureEngine, FeatureRow};
pub use fetcher::fetch_batch;
pub use notifier::{Alert, AlertPayload, AlertSink, DeliveryError, NotifyOutcome, WebhookSink};
pub use worker::{run_scheduled, RetryPolicy, ScanError, ScanReport, Scanner};

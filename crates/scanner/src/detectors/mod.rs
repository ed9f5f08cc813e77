//! Independent, stateless anomaly scorers run over the same batch snapshot.

mod deviation;
mod isolation;
mod range;
mod stats;

pub use deviation::DeviationDetector;
pub use isolation::{isolation_scores, IsolationDetector};
pub use range::RangeDetector;

use metrics::counter;
use pay_sentinel_domain::config::DetectorSettings;
use pay_sentinel_domain::model::DetectionRule;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::features::FeatureRow;

/// A row flagged by one rule. The same row may be flagged by several rules;
/// candidates are never merged across rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyCandidate<'a> {
    pub row: &'a FeatureRow,
    pub rule: DetectionRule,
    /// Non-negative; its scale depends on the rule.
    pub score: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectorError {
    #[error("non-finite {0} statistic")]
    NonFinite(&'static str),
}

pub trait Detector: Send + Sync {
    fn rule(&self) -> DetectionRule;

    /// Returns zero or more candidates in batch order. Too-small or degenerate
    /// batches yield an empty result rather than an error.
    fn detect<'a>(
        &self,
        rows: &'a [FeatureRow],
    ) -> Result<Vec<AnomalyCandidate<'a>>, DetectorError>;
}

/// The enabled detectors, in a fixed order (range, deviation, isolation).
pub struct DetectorEnsemble {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorEnsemble {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    pub fn from_settings(settings: &DetectorSettings) -> Self {
        let mut detectors: Vec<Box<dyn Detector>> = Vec::new();
        if settings.use_iqr {
            detectors.push(Box::new(RangeDetector::new(settings.iqr_multiplier)));
        }
        if settings.use_zscore {
            detectors.push(Box::new(DeviationDetector::new(settings.zscore_threshold)));
        }
        if settings.use_isolation {
            detectors.push(Box::new(IsolationDetector::from_settings(settings)));
        }
        Self::new(detectors)
    }

    pub fn rules(&self) -> Vec<DetectionRule> {
        self.detectors.iter().map(|detector| detector.rule()).collect()
    }

    /// Runs every detector and concatenates their candidates. A failing
    /// detector contributes nothing for this run and does not affect the others.
    pub fn run<'a>(&self, rows: &'a [FeatureRow]) -> Vec<AnomalyCandidate<'a>> {
        let mut candidates = Vec::new();
        for detector in &self.detectors {
            let rule = detector.rule();
            match detector.detect(rows) {
                Ok(found) => {
                    if found.is_empty() {
                        debug!(rule = rule.tag(), "no anomalies");
                    } else {
                        info!(rule = rule.tag(), count = found.len(), "anomalies detected");
                        counter!("scan_candidates_total", found.len() as u64, "rule" => rule.tag());
                    }
                    candidates.extend(found);
                }
                Err(err) => {
                    warn!(rule = rule.tag(), %err, "detector failed; skipping for this run");
                    counter!("scan_detector_failures_total", 1, "rule" => rule.tag());
                }
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::feature_rows;

    struct Broken;

    impl Detector for Broken {
        fn rule(&self) -> DetectionRule {
            DetectionRule::Isolation
        }

        fn detect<'a>(
            &self,
            _rows: &'a [FeatureRow],
        ) -> Result<Vec<AnomalyCandidate<'a>>, DetectorError> {
            Err(DetectorError::NonFinite("test"))
        }
    }

    fn outlier_batch() -> Vec<FeatureRow> {
        let mut amounts = vec![0.97, 0.98, 0.99, 0.99, 1.0, 1.0, 1.01, 1.02, 1.03];
        amounts.push(50.0);
        feature_rows(&amounts)
    }

    #[test]
    fn respects_enable_flags() {
        let settings = DetectorSettings {
            use_zscore: false,
            ..DetectorSettings::default()
        };
        let ensemble = DetectorEnsemble::from_settings(&settings);
        assert_eq!(
            ensemble.rules(),
            vec![DetectionRule::Range, DetectionRule::Isolation]
        );
    }

    #[test]
    fn concatenates_without_merging_rules() {
        let rows = outlier_batch();
        let ensemble = DetectorEnsemble::new(vec![
            Box::new(RangeDetector::new(1.5)),
            Box::new(DeviationDetector::new(2.5)),
        ]);

        let candidates = ensemble.run(&rows);
        let tagged: Vec<_> = candidates
            .iter()
            .map(|c| (c.row.record.tx_hash.as_str(), c.rule))
            .collect();
        assert_eq!(
            tagged,
            vec![
                ("0xtx9", DetectionRule::Range),
                ("0xtx9", DetectionRule::Deviation)
            ]
        );
    }

    #[test]
    fn failing_detector_does_not_block_others() {
        let rows = outlier_batch();
        let ensemble = DetectorEnsemble::new(vec![
            Box::new(Broken),
            Box::new(RangeDetector::new(1.5)),
        ]);

        let candidates = ensemble.run(&rows);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].rule, DetectionRule::Range);
    }
}

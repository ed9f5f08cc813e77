use pay_sentinel_domain::model::DetectionRule;

use super::stats::{mean, sample_std};
use super::{AnomalyCandidate, Detector, DetectorError};
use crate::features::FeatureRow;

const MIN_ROWS: usize = 3;

/// Z-score detector over the scaled amounts.
#[derive(Debug, Clone, Copy)]
pub struct DeviationDetector {
    threshold: f64,
}

impl DeviationDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Detector for DeviationDetector {
    fn rule(&self) -> DetectionRule {
        DetectionRule::Deviation
    }

    fn detect<'a>(
        &self,
        rows: &'a [FeatureRow],
    ) -> Result<Vec<AnomalyCandidate<'a>>, DetectorError> {
        let amounts: Vec<f64> = rows.iter().filter_map(|row| row.amount_scaled).collect();
        if amounts.len() < MIN_ROWS {
            return Ok(Vec::new());
        }

        let mean = mean(&amounts);
        let std = sample_std(&amounts, mean);
        if !(mean.is_finite() && std.is_finite()) {
            return Err(DetectorError::NonFinite("standard deviation"));
        }
        // Identical values can still leave rounding noise in `std`.
        if std == 0.0 || amounts.iter().all(|amount| *amount == amounts[0]) {
            return Ok(Vec::new());
        }

        Ok(rows
            .iter()
            .filter_map(|row| {
                let z = (row.amount_scaled? - mean).abs() / std;
                (z >= self.threshold).then_some(AnomalyCandidate {
                    row,
                    rule: DetectionRule::Deviation,
                    score: z,
                })
            })
            .collect())
    }
}

use pay_sentinel_domain::model::DetectionRule;

use super::stats::{quantile, sorted};
use super::{AnomalyCandidate, Detector, DetectorError};
use crate::features::FeatureRow;

const MIN_ROWS: usize = 4;
const IQR_EPSILON: f64 = 1e-9;

/// Quartile bounds: flags amounts outside `[Q1 - k*IQR, Q3 + k*IQR]`.
#[derive(Debug, Clone, Copy)]
pub struct RangeDetector {
    multiplier: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeBounds {
    pub lower: f64,
    pub upper: f64,
    pub median: f64,
    pub iqr: f64,
}

impl RangeDetector {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }

    /// Bounds over the usable amounts; `None` below the minimum row count.
    pub fn bounds(&self, amounts: &[f64]) -> Option<RangeBounds> {
        if amounts.len() < MIN_ROWS {
            return None;
        }
        let ordered = sorted(amounts.to_vec());
        let q1 = quantile(&ordered, 0.25)?;
        let q3 = quantile(&ordered, 0.75)?;
        let median = quantile(&ordered, 0.5)?;
        let iqr = q3 - q1;
        Some(RangeBounds {
            lower: q1 - self.multiplier * iqr,
            upper: q3 + self.multiplier * iqr,
            median,
            iqr,
        })
    }
}

impl Detector for RangeDetector {
    fn rule(&self) -> DetectionRule {
        DetectionRule::Range
    }

    fn detect<'a>(
        &self,
        rows: &'a [FeatureRow],
    ) -> Result<Vec<AnomalyCandidate<'a>>, DetectorError> {
        let amounts: Vec<f64> = rows.iter().filter_map(|row| row.amount_scaled).collect();
        let Some(bounds) = self.bounds(&amounts) else {
            return Ok(Vec::new());
        };
        if !(bounds.lower.is_finite() && bounds.upper.is_finite()) {
            return Err(DetectorError::NonFinite("quartile"));
        }

        Ok(rows
            .iter()
            .filter_map(|row| {
                let amount = row.amount_scaled?;
                (amount < bounds.lower || amount > bounds.upper).then(|| AnomalyCandidate {
                    row,
                    rule: DetectionRule::Range,
                    score: (amount - bounds.median).abs() / (bounds.iqr + IQR_EPSILON),
                })
            })
            .collect())
    }
}

//! Seeded isolation forest over `(amount_scaled, ratio)`.
//!
//! Every run rebuilds the forest from the configured seed, so identical
//! batches always produce identical scores.

use pay_sentinel_domain::config::DetectorSettings;
use pay_sentinel_domain::model::DetectionRule;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::stats::{quantile, sorted};
use super::{AnomalyCandidate, Detector, DetectorError};
use crate::features::FeatureRow;

const MAX_SAMPLES: usize = 256;
const EULER_GAMMA: f64 = 0.577_215_664_9;

type Point = [f64; 2];

#[derive(Debug, Clone)]
pub struct IsolationDetector {
    min_samples: usize,
    contamination: f64,
    trees: usize,
    seed: u64,
}

impl IsolationDetector {
    pub fn new(min_samples: usize, contamination: f64, trees: usize, seed: u64) -> Self {
        Self {
            min_samples,
            contamination,
            trees,
            seed,
        }
    }

    pub fn from_settings(settings: &DetectorSettings) -> Self {
        Self::new(
            settings.isolation_min_samples,
            settings.contamination(),
            settings.isolation_trees,
            settings.isolation_seed,
        )
    }
}

impl Detector for IsolationDetector {
    fn rule(&self) -> DetectionRule {
        DetectionRule::Isolation
    }

    fn detect<'a>(
        &self,
        rows: &'a [FeatureRow],
    ) -> Result<Vec<AnomalyCandidate<'a>>, DetectorError> {
        if rows.len() < self.min_samples.max(2) {
            return Ok(Vec::new());
        }

        let points: Vec<Point> = rows
            .iter()
            .map(|row| [row.amount_scaled.unwrap_or(0.0), row.ratio.unwrap_or(0.0)])
            .collect();
        if points.iter().flatten().any(|value| !value.is_finite()) {
            return Err(DetectorError::NonFinite("isolation feature"));
        }

        let scores = isolation_scores(&points, self.trees.max(1), self.seed);
        let negated = sorted(scores.iter().map(|score| -score).collect());
        let Some(offset) = quantile(&negated, self.contamination) else {
            return Ok(Vec::new());
        };

        Ok(rows
            .iter()
            .zip(scores)
            .filter(|(_, score)| -score < offset)
            .map(|(row, score)| AnomalyCandidate {
                row,
                rule: DetectionRule::Isolation,
                score: score.abs(),
            })
            .collect())
    }
}

/// Anomaly score per point in `(0, 1]`; higher means easier to isolate.
pub fn isolation_scores(points: &[Point], trees: usize, seed: u64) -> Vec<f64> {
    let psi = points.len().min(MAX_SAMPLES);
    let normalizer = average_path_length(psi);
    if psi < 2 || normalizer <= 0.0 {
        return vec![0.5; points.len()];
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let height_limit = (psi as f64).log2().ceil() as usize;
    let forest: Vec<Node> = (0..trees)
        .map(|_| {
            let sample = rand::seq::index::sample(&mut rng, points.len(), psi).into_vec();
            Node::grow(points, sample, 0, height_limit, &mut rng)
        })
        .collect();

    points
        .iter()
        .map(|point| {
            let total: f64 = forest.iter().map(|tree| tree.path_length(point, 0)).sum();
            let mean = total / forest.len() as f64;
            2f64.powf(-mean / normalizer)
        })
        .collect()
}

/// Expected path length of an unsuccessful search in a binary tree of `n` nodes.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn grow(
        points: &[Point],
        members: Vec<usize>,
        depth: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> Node {
        if depth >= height_limit || members.len() <= 1 {
            return Node::Leaf {
                size: members.len(),
            };
        }

        let mut features = [0usize, 1];
        features.shuffle(rng);
        for feature in features {
            let (min, max) = members.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &idx| {
                let value = points[idx][feature];
                (lo.min(value), hi.max(value))
            });
            if max <= min {
                continue;
            }
            let threshold = rng.gen_range(min..max);
            let (left, right): (Vec<usize>, Vec<usize>) = members
                .iter()
                .partition(|&&idx| points[idx][feature] < threshold);
            return Node::Split {
                feature,
                threshold,
                left: Box::new(Node::grow(points, left, depth + 1, height_limit, rng)),
                right: Box::new(Node::grow(points, right, depth + 1, height_limit, rng)),
            };
        }

        // All members identical on every feature.
        Node::Leaf {
            size: members.len(),
        }
    }

    fn path_length(&self, point: &Point, depth: usize) -> f64 {
        match self {
            Node::Leaf { size } => depth as f64 + average_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                let next = if point[*feature] < *threshold { left } else { right };
                next.path_length(point, depth + 1)
            }
        }
    }
}

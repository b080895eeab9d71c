// feltwatch/src/workers/isolation.rs
//
// Isolation forest over normalized behavioral feature vectors.
//
// Each tree recursively splits a random subsample on a random feature at a
// random cut point. Anomalies are isolated in fewer splits, so
//
//     s(x) = 2^( -E[h(x)] / c(ψ) )
//
// approaches 1 for outliers and sits near 0.5 (or below) for inliers.
// c(ψ) is the average unsuccessful-search path length of a BST on ψ points.
//
// The default forest is fitted on a seeded synthetic population of human
// players; `fit` accepts any baseline so a production sample can replace it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::events::PlayerBehavioralFeatures;

pub const N_FEATURES: usize = 8;
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average path length of an unsuccessful BST search over `n` points.
pub fn c_factor(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Map features onto [0,1] per dimension. Non-finite inputs land mid-range.
pub fn feature_vector(f: &PlayerBehavioralFeatures) -> [f64; N_FEATURES] {
    fn unit(v: f64, scale: f64) -> f64 {
        if !v.is_finite() {
            return 0.5;
        }
        (v / scale).clamp(0.0, 1.0)
    }
    [
        unit(f.mean_action_time, 15.0),
        unit(f.action_time_stddev, 8.0),
        unit(f.bet_precision, 1.0),
        unit(f.hands_per_hour, 250.0),
        unit(f.concurrent_tables as f64, 24.0),
        unit(f.consistency_score, 1.0),
        unit(f.win_rate_variance, 0.3),
        unit(f.showdown_rate, 1.0),
    ]
}

#[derive(Debug)]
enum Node {
    Leaf { size: usize },
    Split { feature: usize, cut: f64, left: Box<Node>, right: Box<Node> },
}

impl Node {
    fn build(rows: &mut [[f64; N_FEATURES]], depth: u32, limit: u32, rng: &mut StdRng) -> Node {
        if rows.len() <= 1 || depth >= limit {
            return Node::Leaf { size: rows.len() };
        }
        // Pick among features that still vary in this partition.
        let spread: Vec<(usize, f64, f64)> = (0..N_FEATURES)
            .filter_map(|k| {
                let lo = rows.iter().map(|r| r[k]).fold(f64::INFINITY, f64::min);
                let hi = rows.iter().map(|r| r[k]).fold(f64::NEG_INFINITY, f64::max);
                (hi > lo).then_some((k, lo, hi))
            })
            .collect();
        if spread.is_empty() {
            return Node::Leaf { size: rows.len() };
        }
        let (feature, lo, hi) = spread[rng.gen_range(0..spread.len())];
        let cut = rng.gen_range(lo..hi);

        // In-place partition: rows[..mid] < cut
        let mut mid = 0;
        for i in 0..rows.len() {
            if rows[i][feature] < cut {
                rows.swap(i, mid);
                mid += 1;
            }
        }
        let (l, r) = rows.split_at_mut(mid);
        Node::Split {
            feature,
            cut,
            left: Box::new(Node::build(l, depth + 1, limit, rng)),
            right: Box::new(Node::build(r, depth + 1, limit, rng)),
        }
    }

    fn path_length(&self, x: &[f64; N_FEATURES], depth: f64) -> f64 {
        match self {
            Node::Leaf { size } => depth + c_factor(*size),
            Node::Split { feature, cut, left, right } => {
                if x[*feature] < *cut {
                    left.path_length(x, depth + 1.0)
                } else {
                    right.path_length(x, depth + 1.0)
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    pub fn fit(baseline: &[[f64; N_FEATURES]], n_trees: usize, sample_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let psi = sample_size.min(baseline.len()).max(1);
        let limit = (psi as f64).log2().ceil() as u32;
        let trees = (0..n_trees.max(1))
            .map(|_| {
                let mut sample: Vec<[f64; N_FEATURES]> = if baseline.is_empty() {
                    Vec::new()
                } else {
                    rand::seq::index::sample(&mut rng, baseline.len(), psi)
                        .into_iter()
                        .map(|i| baseline[i])
                        .collect()
                };
                Node::build(&mut sample, 0, limit, &mut rng)
            })
            .collect();
        Self { trees, sample_size: psi }
    }

    /// Default forest fitted on the synthetic human population.
    pub fn human_default(n_trees: usize, sample_size: usize, seed: u64) -> Self {
        let baseline = human_baseline(sample_size.max(2) * 4, seed);
        Self::fit(&baseline, n_trees, sample_size, seed)
    }

    /// Anomaly score in (0,1].
    pub fn score(&self, x: &[f64; N_FEATURES]) -> f64 {
        let c = c_factor(self.sample_size);
        if c <= 0.0 || self.trees.is_empty() {
            return 0.5;
        }
        let mean_path =
            self.trees.iter().map(|t| t.path_length(x, 0.0)).sum::<f64>() / self.trees.len() as f64;
        2f64.powf(-mean_path / c)
    }

    pub fn score_features(&self, f: &PlayerBehavioralFeatures) -> f64 {
        self.score(&feature_vector(f))
    }
}

/// Seeded synthetic population of recreational and regular human players.
pub fn human_baseline(n: usize, seed: u64) -> Vec<[f64; N_FEATURES]> {
    let mut rng = StdRng::seed_from_u64(seed ^ 0x4855_4D41_4E00);
    (0..n)
        .map(|_| {
            let f = PlayerBehavioralFeatures {
                mean_action_time: rng.gen_range(3.0..12.0),
                action_time_stddev: rng.gen_range(1.5..6.0),
                bet_precision: rng.gen_range(0.30..0.80),
                hands_per_hour: rng.gen_range(20.0..95.0),
                concurrent_tables: rng.gen_range(1..=4),
                consistency_score: rng.gen_range(0.20..0.60),
                win_rate_variance: rng.gen_range(0.05..0.25),
                showdown_rate: rng.gen_range(0.15..0.35),
                ..Default::default()
            };
            feature_vector(&f)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_factor_matches_known_values() {
        assert_eq!(c_factor(1), 0.0);
        assert_eq!(c_factor(2), 1.0);
        // c(256) ≈ 10.24
        assert!((c_factor(256) - 10.24).abs() < 0.05);
    }

    #[test]
    fn outlier_scores_above_inlier() {
        let forest = IsolationForest::human_default(100, 256, 7);
        let human = PlayerBehavioralFeatures {
            mean_action_time: 7.0,
            action_time_stddev: 3.5,
            bet_precision: 0.55,
            hands_per_hour: 55.0,
            concurrent_tables: 2,
            consistency_score: 0.4,
            win_rate_variance: 0.15,
            showdown_rate: 0.25,
            ..Default::default()
        };
        let bot = PlayerBehavioralFeatures {
            mean_action_time: 1.0,
            action_time_stddev: 0.1,
            bet_precision: 0.98,
            hands_per_hour: 220.0,
            concurrent_tables: 24,
            consistency_score: 0.95,
            win_rate_variance: 0.0,
            showdown_rate: 0.6,
            ..Default::default()
        };
        let (h, b) = (forest.score_features(&human), forest.score_features(&bot));
        assert!(b > h, "bot {b} should outscore human {h}");
        assert!(b > 0.55);
    }

    #[test]
    fn same_seed_same_forest() {
        let x = feature_vector(&PlayerBehavioralFeatures { mean_action_time: 2.0, ..Default::default() });
        let a = IsolationForest::human_default(20, 64, 42).score(&x);
        let b = IsolationForest::human_default(20, 64, 42).score(&x);
        assert_eq!(a, b);
    }
}

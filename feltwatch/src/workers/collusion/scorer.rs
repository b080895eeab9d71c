// feltwatch/src/workers/collusion/scorer.rs
//
// Pluggable soft-play scorer.
//
// The collusion detector hands the scorer a named feature map with every
// value already normalized to [0,1]; a trained model can implement the
// same trait and be injected without touching the detector.

use std::collections::HashMap;

pub const F_AGGRESSION_DROP: &str = "aggression_drop";
pub const F_CHECK_DOWN: &str = "check_down_rate";
pub const F_POT_SIZE: &str = "pot_size_delta";
pub const F_SHOWDOWN: &str = "showdown_delta";
pub const F_VPIP: &str = "vpip_delta";
pub const F_PFR: &str = "pfr_delta";
pub const F_THREE_BET: &str = "three_bet_delta";
pub const F_MUTUAL_WIN_DEFICIT: &str = "mutual_win_deficit";

pub trait SoftPlayScorer: Send + Sync {
    /// Score in [0,1]; missing features count as 0.
    fn score(&self, features: &HashMap<String, f64>) -> f64;

    fn name(&self) -> &str;
}

/// Fixed-weight linear model. Weights sum to 1.0.
#[derive(Debug, Clone)]
pub struct LinearSoftPlayScorer {
    weights: Vec<(String, f64)>,
}

impl Default for LinearSoftPlayScorer {
    fn default() -> Self {
        Self::new(vec![
            (F_AGGRESSION_DROP, 0.25),
            (F_CHECK_DOWN, 0.15),
            (F_MUTUAL_WIN_DEFICIT, 0.15),
            (F_POT_SIZE, 0.10),
            (F_SHOWDOWN, 0.10),
            (F_VPIP, 0.10),
            (F_PFR, 0.10),
            (F_THREE_BET, 0.05),
        ])
    }
}

impl LinearSoftPlayScorer {
    pub fn new(weights: Vec<(&str, f64)>) -> Self {
        Self { weights: weights.into_iter().map(|(k, w)| (k.to_string(), w)).collect() }
    }
}

impl SoftPlayScorer for LinearSoftPlayScorer {
    fn score(&self, features: &HashMap<String, f64>) -> f64 {
        let total: f64 = self.weights.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let raw: f64 = self
            .weights
            .iter()
            .map(|(k, w)| {
                let v = features.get(k).copied().unwrap_or(0.0);
                let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
                v * w
            })
            .sum();
        (raw / total).clamp(0.0, 1.0)
    }

    fn name(&self) -> &str {
        "linear"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ones_scores_one() {
        let s = LinearSoftPlayScorer::default();
        let all: HashMap<String, f64> = s.weights.iter().map(|(k, _)| (k.clone(), 1.0)).collect();
        assert!((s.score(&all) - 1.0).abs() < 1e-9);
        assert_eq!(s.score(&HashMap::new()), 0.0);
    }

    #[test]
    fn out_of_range_features_are_clamped() {
        let s = LinearSoftPlayScorer::default();
        let mut f = HashMap::new();
        f.insert(F_AGGRESSION_DROP.to_string(), 7.0);
        f.insert(F_CHECK_DOWN.to_string(), f64::NAN);
        assert!((s.score(&f) - 0.25).abs() < 1e-9);
    }
}

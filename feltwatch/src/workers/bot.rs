// feltwatch/src/workers/bot.rs
//
// Bot detector: three independent estimators over one feature vector.
//
//   heuristic   weighted sum of monotone per-feature sub-scores
//   isolation   isolation-forest anomaly score vs. the human baseline
//   sequential  fixed increments for machine-like timing/sizing/volume
//
//   score = 0.5·heuristic + 0.25·isolation + 0.25·sequential
//
// Confidence does not look at the score. It grows with data volume and
// with how many estimators agree, so a ten-hand sample that looks extreme
// still routes to review instead of an automatic flag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::BotConfig;
use crate::events::{PlayerBehavioralFeatures, Verdict};
use crate::workers::isolation::IsolationForest;

const HEURISTIC_WEIGHT: f64 = 0.50;
const ISOLATION_WEIGHT: f64 = 0.25;
const SEQUENCE_WEIGHT: f64 = 0.25;

/// Neutral sub-score for values we cannot interpret.
const UNKNOWN: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionMethod {
    #[serde(rename = "heuristic")]
    Heuristic,
    #[serde(rename = "isolation_forest")]
    IsolationForest,
    /// Sequential-pattern scorer (stands in for a recurrent model).
    #[serde(rename = "lstm")]
    Lstm,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heuristic => write!(f, "heuristic"),
            Self::IsolationForest => write!(f, "isolation_forest"),
            Self::Lstm => write!(f, "lstm"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotDetectionResult {
    pub player_id: String,
    pub is_bot: bool,
    pub score: f64,
    pub confidence: f64,
    pub action: Verdict,
    pub feature_scores: BTreeMap<String, f64>,
    pub triggered_methods: Vec<DetectionMethod>,
    pub reasons: Vec<String>,
    pub heuristic_score: f64,
    pub isolation_score: f64,
    pub sequence_score: f64,
}

// ── Sub-score shapes ──────────────────────────────────────────────────────────

/// 0 at/above `threshold`, rising linearly to 1 at `floor`.
pub fn falling(value: f64, threshold: f64, floor: f64) -> f64 {
    if !value.is_finite() || value < 0.0 {
        return UNKNOWN;
    }
    if value >= threshold {
        0.0
    } else if value <= floor {
        1.0
    } else {
        (threshold - value) / (threshold - floor)
    }
}

/// 0 at/below `threshold`, rising linearly to 1 at `ceiling`.
pub fn rising(value: f64, threshold: f64, ceiling: f64) -> f64 {
    if !value.is_finite() || value < 0.0 {
        return UNKNOWN;
    }
    if value <= threshold {
        0.0
    } else if value >= ceiling {
        1.0
    } else {
        (value - threshold) / (ceiling - threshold)
    }
}

// ── Detector ──────────────────────────────────────────────────────────────────

pub struct BotDetector {
    cfg: BotConfig,
    forest: IsolationForest,
}

impl BotDetector {
    pub fn new(cfg: BotConfig) -> Self {
        let forest = IsolationForest::human_default(cfg.isolation_trees, cfg.isolation_sample_size, cfg.isolation_seed);
        Self { cfg, forest }
    }

    pub fn config(&self) -> &BotConfig {
        &self.cfg
    }

    pub fn feature_scores(&self, f: &PlayerBehavioralFeatures) -> BTreeMap<String, f64> {
        let c = &self.cfg;
        let mut s = BTreeMap::new();
        s.insert("mean_action_time".into(), falling(f.mean_action_time, c.action_time_threshold_secs, c.action_time_floor_secs));
        s.insert(
            "action_time_stddev".into(),
            falling(f.action_time_stddev, c.action_stddev_threshold_secs, c.action_stddev_floor_secs),
        );
        s.insert("bet_precision".into(), rising(f.bet_precision, c.bet_precision_threshold, 1.0));
        s.insert("hands_per_hour".into(), rising(f.hands_per_hour, c.hands_per_hour_threshold, c.hands_per_hour_ceiling));
        s.insert("concurrent_tables".into(), rising(f.concurrent_tables as f64, c.tables_threshold, c.tables_ceiling));
        s.insert("consistency".into(), rising(f.consistency_score, c.consistency_threshold, 1.0));
        let wrv = if f.hands_played >= c.win_rate_variance_min_hands {
            falling(f.win_rate_variance, c.win_rate_variance_threshold, 0.0)
        } else {
            0.0
        };
        s.insert("win_rate_variance".into(), wrv);
        s.insert("showdown_rate".into(), rising(f.showdown_rate, c.showdown_rate_threshold, c.showdown_rate_ceiling));
        s
    }

    fn heuristic(&self, scores: &BTreeMap<String, f64>) -> f64 {
        let w = &self.cfg.weights;
        let get = |k: &str| scores.get(k).copied().unwrap_or(0.0);
        (get("mean_action_time") * w.mean_action_time
            + get("action_time_stddev") * w.action_time_stddev
            + get("bet_precision") * w.bet_precision
            + get("hands_per_hour") * w.hands_per_hour
            + get("concurrent_tables") * w.concurrent_tables
            + get("consistency") * w.consistency
            + get("win_rate_variance") * w.win_rate_variance
            + get("showdown_rate") * w.showdown_rate)
            .clamp(0.0, 1.0)
    }

    pub fn sequence_score(&self, f: &PlayerBehavioralFeatures) -> f64 {
        let mut s = 0.0;
        if f.action_time_stddev.is_finite() && f.action_time_stddev < 0.5 && f.hands_played > 0 {
            s += 0.4;
        }
        if f.bet_precision > 0.9 {
            s += 0.3;
        }
        if f.hands_per_hour > 120.0 {
            s += 0.3;
        }
        f64::min(s, 1.0)
    }

    /// Volume part (log-scaled hands) plus 0.1 per triggered method.
    pub fn confidence(hands_played: u64, triggered: usize) -> f64 {
        let volume = if hands_played <= 10 {
            0.0
        } else if hands_played >= 1000 {
            0.65
        } else {
            0.65 * (hands_played as f64 / 10.0).ln() / 100f64.ln()
        };
        (volume + 0.1 * triggered as f64).min(1.0)
    }

    pub fn analyze(&self, f: &PlayerBehavioralFeatures) -> BotDetectionResult {
        let c = &self.cfg;
        let feature_scores = self.feature_scores(f);
        let heuristic = self.heuristic(&feature_scores);
        let isolation = self.forest.score_features(f);
        let sequence = self.sequence_score(f);
        let score =
            (HEURISTIC_WEIGHT * heuristic + ISOLATION_WEIGHT * isolation + SEQUENCE_WEIGHT * sequence).clamp(0.0, 1.0);

        let mut triggered = Vec::new();
        if heuristic >= c.heuristic_trigger {
            triggered.push(DetectionMethod::Heuristic);
        }
        if isolation >= c.isolation_trigger {
            triggered.push(DetectionMethod::IsolationForest);
        }
        if sequence >= c.sequence_trigger {
            triggered.push(DetectionMethod::Lstm);
        }
        let confidence = Self::confidence(f.hands_played, triggered.len());

        let is_bot = score >= c.flag_threshold && confidence >= c.min_flag_confidence;
        let action = if is_bot {
            Verdict::Flag
        } else if score >= c.review_threshold {
            Verdict::Review
        } else {
            Verdict::Clear
        };

        BotDetectionResult {
            player_id: f.player_id.clone(),
            is_bot,
            score,
            confidence,
            action,
            reasons: self.reasons(f, &feature_scores, &triggered),
            feature_scores,
            triggered_methods: triggered,
            heuristic_score: heuristic,
            isolation_score: isolation,
            sequence_score: sequence,
        }
    }

    fn reasons(
        &self,
        f: &PlayerBehavioralFeatures,
        scores: &BTreeMap<String, f64>,
        triggered: &[DetectionMethod],
    ) -> Vec<String> {
        let c = &self.cfg;
        let hot = |k: &str| scores.get(k).map(|&v| v > UNKNOWN).unwrap_or(false);
        let mut out = Vec::new();
        if hot("mean_action_time") {
            out.push(format!("mean action time {:.2}s below {:.2}s", f.mean_action_time, c.action_time_threshold_secs));
        }
        if hot("action_time_stddev") {
            out.push(format!("action time stddev {:.2}s (robotic timing)", f.action_time_stddev));
        }
        if hot("bet_precision") {
            out.push(format!("bet sizing precision {:.2}", f.bet_precision));
        }
        if hot("hands_per_hour") {
            out.push(format!("{:.0} hands/hour", f.hands_per_hour));
        }
        if hot("concurrent_tables") {
            out.push(format!("{} concurrent tables", f.concurrent_tables));
        }
        if hot("consistency") {
            out.push(format!("consistency score {:.2}", f.consistency_score));
        }
        if hot("win_rate_variance") {
            out.push(format!("win-rate variance {:.3} over {} hands", f.win_rate_variance, f.hands_played));
        }
        if hot("showdown_rate") {
            out.push(format!("showdown rate {:.0}%", f.showdown_rate * 100.0));
        }
        if !triggered.is_empty() {
            let names: Vec<String> = triggered.iter().map(|m| m.to_string()).collect();
            out.push(format!("triggered: {}", names.join(",")));
        }
        out
    }
}

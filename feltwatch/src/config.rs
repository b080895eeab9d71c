// feltwatch/src/config.rs
//
// Engine configuration. Every section has a Default matching production
// calibration, so a TOML file only needs the keys it overrides:
//
//   [bot]
//   flag_threshold = 0.8
//
//   [publisher]
//   brokers = "kafka1:9092,kafka2:9092"
//   ack     = "all"

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FraudError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bot: BotConfig,
    pub collusion: CollusionConfig,
    pub multi_account: MultiAccountConfig,
    pub rules: RuleConfig,
    pub risk: RiskConfig,
    pub publisher: PublisherConfig,
    pub service: ServiceConfig,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw).map_err(|e| FraudError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FraudError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        check_weights("bot.weights", self.bot.weights.sum())?;
        check_weights("risk.weights", self.risk.weights.sum())?;
        check_band("bot", self.bot.review_threshold, self.bot.flag_threshold)?;
        check_band(
            "multi_account",
            self.multi_account.review_threshold,
            self.multi_account.flag_threshold,
        )?;
        if self.publisher.queue_capacity == 0 {
            return Err(FraudError::Config("publisher.queue_capacity must be > 0".into()));
        }
        if self.publisher.max_errors == 0 {
            return Err(FraudError::Config("publisher.max_errors must be > 0".into()));
        }
        if self.bot.isolation_trees == 0 || self.bot.isolation_sample_size < 2 {
            return Err(FraudError::Config("bot isolation forest needs ≥1 tree and ≥2 samples".into()));
        }
        Ok(())
    }
}

fn check_weights(name: &str, sum: f64) -> Result<()> {
    if (sum - 1.0).abs() > 1e-6 {
        return Err(FraudError::Config(format!("{name} must sum to 1.0 (got {sum:.4})")));
    }
    Ok(())
}

fn check_band(name: &str, review: f64, flag: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&review) || !(0.0..=1.0).contains(&flag) || review > flag {
        return Err(FraudError::Config(format!(
            "{name}: need 0 ≤ review_threshold ≤ flag_threshold ≤ 1 (got {review} / {flag})"
        )));
    }
    Ok(())
}

// ── Bot detector ──────────────────────────────────────────────────────────────

/// Heuristic sub-score weights. Must sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotWeights {
    pub mean_action_time: f64,
    pub action_time_stddev: f64,
    pub bet_precision: f64,
    pub hands_per_hour: f64,
    pub concurrent_tables: f64,
    pub consistency: f64,
    pub win_rate_variance: f64,
    pub showdown_rate: f64,
}

impl BotWeights {
    pub fn sum(&self) -> f64 {
        self.mean_action_time
            + self.action_time_stddev
            + self.bet_precision
            + self.hands_per_hour
            + self.concurrent_tables
            + self.consistency
            + self.win_rate_variance
            + self.showdown_rate
    }
}

impl Default for BotWeights {
    fn default() -> Self {
        Self {
            mean_action_time: 0.15,
            action_time_stddev: 0.25,
            bet_precision: 0.15,
            hands_per_hour: 0.10,
            concurrent_tables: 0.10,
            consistency: 0.10,
            win_rate_variance: 0.08,
            showdown_rate: 0.07,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub flag_threshold: f64,
    pub review_threshold: f64,
    pub min_flag_confidence: f64,
    pub weights: BotWeights,

    // Human/bot calibration points. Below `threshold` the sub-score rises
    // linearly, reaching 1.0 at `floor` (or at `ceiling` for rising features).
    pub action_time_threshold_secs: f64,
    pub action_time_floor_secs: f64,
    pub action_stddev_threshold_secs: f64,
    pub action_stddev_floor_secs: f64,
    pub bet_precision_threshold: f64,
    pub hands_per_hour_threshold: f64,
    pub hands_per_hour_ceiling: f64,
    pub tables_threshold: f64,
    pub tables_ceiling: f64,
    pub consistency_threshold: f64,
    pub win_rate_variance_threshold: f64,
    pub win_rate_variance_min_hands: u64,
    pub showdown_rate_threshold: f64,
    pub showdown_rate_ceiling: f64,

    // Isolation forest
    pub isolation_trees: usize,
    pub isolation_sample_size: usize,
    pub isolation_seed: u64,

    // A method counts as "triggered" above these scores
    pub heuristic_trigger: f64,
    pub isolation_trigger: f64,
    pub sequence_trigger: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            flag_threshold: 0.75,
            review_threshold: 0.50,
            min_flag_confidence: 0.70,
            weights: BotWeights::default(),
            action_time_threshold_secs: 2.5,
            action_time_floor_secs: 0.5,
            action_stddev_threshold_secs: 1.0,
            action_stddev_floor_secs: 0.1,
            bet_precision_threshold: 0.85,
            hands_per_hour_threshold: 100.0,
            hands_per_hour_ceiling: 200.0,
            tables_threshold: 6.0,
            tables_ceiling: 20.0,
            consistency_threshold: 0.70,
            win_rate_variance_threshold: 0.05,
            win_rate_variance_min_hands: 50,
            showdown_rate_threshold: 0.30,
            showdown_rate_ceiling: 0.50,
            isolation_trees: 100,
            isolation_sample_size: 256,
            isolation_seed: 0x5EED_F017,
            heuristic_trigger: 0.50,
            isolation_trigger: 0.60,
            sequence_trigger: 0.50,
        }
    }
}

// ── Collusion detector ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunityMethod {
    /// Weighted modularity local-moving.
    Louvain,
    /// BFS over strong edges.
    ConnectedComponents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollusionConfig {
    /// Hands together below which hand-based analyzers stay neutral.
    pub min_hands: u64,
    pub co_occurrence_hands: f64,
    pub adjacency_baseline: f64,
    pub stake_overlap_sessions: f64,
    pub arrival_sync_baseline: f64,
    pub chip_flow_threshold: f64,
    pub transfer_frequency_threshold: f64,
    pub ev_loss_threshold: f64,
    pub ip_match_threshold: f64,
    pub device_match_threshold: f64,
    pub subnet_match_threshold: f64,
    /// Expected head-to-head win share between independent players.
    pub fair_mutual_win_rate: f64,
    pub min_head_to_head: u64,

    /// A sub-score at or above this emits an evidence item.
    pub evidence_threshold: f64,
    pub squeeze_soft_play: f64,
    pub squeeze_chip_flow: f64,

    // Ring detection
    pub community_method: CommunityMethod,
    pub strong_edge_weight: f64,
    pub ring_min_density: f64,
    pub ring_min_hands: u64,
    pub louvain_max_passes: u32,
}

impl Default for CollusionConfig {
    fn default() -> Self {
        Self {
            min_hands: 10,
            co_occurrence_hands: 200.0,
            adjacency_baseline: 0.5,
            stake_overlap_sessions: 20.0,
            arrival_sync_baseline: 0.3,
            chip_flow_threshold: 5_000.0,
            transfer_frequency_threshold: 0.3,
            ev_loss_threshold: 50.0,
            ip_match_threshold: 10.0,
            device_match_threshold: 3.0,
            subnet_match_threshold: 20.0,
            fair_mutual_win_rate: 0.5,
            min_head_to_head: 10,
            evidence_threshold: 0.5,
            squeeze_soft_play: 0.5,
            squeeze_chip_flow: 0.4,
            community_method: CommunityMethod::Louvain,
            strong_edge_weight: 20.0,
            ring_min_density: 0.5,
            ring_min_hands: 100,
            louvain_max_passes: 20,
        }
    }
}

// ── Multi-account detector ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiAccountConfig {
    pub lookback_days: i64,
    pub min_session_overlap: f64,
    pub flag_threshold: f64,
    pub review_threshold: f64,
    pub device_weight: f64,
    pub ip_weight: f64,
    pub network_weight: f64,
    pub behavioral_weight: f64,
    pub device_similarity: f64,
    pub ip_similarity: f64,
    pub subnet_similarity: f64,
    /// Upper bound on players scanned for session overlap per call.
    pub max_overlap_candidates: usize,
}

impl Default for MultiAccountConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            min_session_overlap: 0.5,
            flag_threshold: 0.7,
            review_threshold: 0.4,
            device_weight: 0.5,
            ip_weight: 0.3,
            network_weight: 0.2,
            behavioral_weight: 0.1,
            device_similarity: 1.0,
            ip_similarity: 0.8,
            subnet_similarity: 0.5,
            max_overlap_candidates: 5_000,
        }
    }
}

// ── Rule engine ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Rule names disabled at startup. Unknown names fail engine construction.
    pub disabled: Vec<String>,
}

// ── Risk scorer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub bot: f64,
    pub collusion: f64,
    pub multi_account: f64,
    pub rule_violation: f64,
    pub alert_history: f64,
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.bot + self.collusion + self.multi_account + self.rule_violation + self.alert_history
    }
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self { bot: 0.30, collusion: 0.25, multi_account: 0.20, rule_violation: 0.15, alert_history: 0.10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub cache_ttl_secs: u64,
    pub review_threshold: f64,
    pub weights: RiskWeights,
    pub rule_violation_cap: f64,
    pub history_24h_cap: f64,
    pub history_30d_cap: f64,
    pub window_days: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            review_threshold: 0.6,
            weights: RiskWeights::default(),
            rule_violation_cap: 5.0,
            history_24h_cap: 3.0,
            history_30d_cap: 20.0,
            window_days: 30,
        }
    }
}

// ── Publisher ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    None,
    Leader,
    /// All in-sync replicas; enables idempotent delivery.
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Comma-separated broker list (e.g. "kafka1:9092,kafka2:9092")
    pub brokers: String,
    pub topic: String,
    pub partitions: u32,
    pub replication: u16,
    pub ack: AckMode,
    /// Bounded outbound queue for fire-and-forget publishing
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Recent delivery failures kept for inspection
    pub max_errors: usize,
    pub send_timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "feltwatch.alerts".to_string(),
            partitions: 12,
            replication: 3,
            ack: AckMode::All,
            queue_capacity: 1024,
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            max_errors: 100,
            send_timeout_ms: 5_000,
        }
    }
}

// ── Fraud service ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub detector_timeout_ms: u64,
    pub feature_window_secs: i64,
    pub bot_high_risk: f64,
    pub collusion_high_risk: f64,
    pub multi_account_high_risk: f64,
    pub overall_high_risk: f64,
    pub ring_sweep_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            detector_timeout_ms: 2_000,
            feature_window_secs: 24 * 60 * 60,
            bot_high_risk: 0.75,
            collusion_high_risk: 0.70,
            multi_account_high_risk: 0.70,
            overall_high_risk: 0.70,
            ring_sweep_interval_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_overrides_only_named_keys() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [bot]
            flag_threshold = 0.8

            [publisher]
            ack = "leader"
            queue_capacity = 16
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bot.flag_threshold, 0.8);
        assert_eq!(cfg.bot.review_threshold, 0.5);
        assert_eq!(cfg.publisher.ack, AckMode::Leader);
        assert_eq!(cfg.publisher.queue_capacity, 16);
        assert_eq!(cfg.publisher.topic, "feltwatch.alerts");
    }

    #[test]
    fn rejects_unbalanced_weights() {
        let err = EngineConfig::from_toml_str("[risk.weights]\nbot = 0.9\n").unwrap_err();
        assert!(matches!(err, FraudError::Config(_)));
    }

    #[test]
    fn rejects_review_above_flag() {
        let err = EngineConfig::from_toml_str("[bot]\nreview_threshold = 0.9\n").unwrap_err();
        assert!(matches!(err, FraudError::Config(_)));
    }
}

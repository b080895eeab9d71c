// feltwatch/src/workers/collusion/mod.rs
//
// Collusion detector.
//
// Pair scoring reads one edge under the graph's read lock, clones it, and
// does all arithmetic outside the lock. Edge merges take the write lock for
// the counter update only. Ring detection snapshots strong edges under the
// read lock, runs community detection on the copy, and replaces the stored
// ring list only after a complete, uncancelled run.
//
// Pair overall score weights:
//   co-occurrence 0.10  seating 0.05  stake overlap 0.05  arrival sync 0.10
//   soft-play     0.25  chip flow 0.25  network 0.20

pub mod community;
pub mod graph;
pub mod scorer;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{CollusionConfig, CommunityMethod};
use crate::context::Context;
use crate::error::Result;
use crate::events::Severity;
use graph::{EdgeUpdate, InteractionEdge, InteractionGraph, PairKey};
use scorer::{LinearSoftPlayScorer, SoftPlayScorer};

const W_CO_OCCURRENCE: f64 = 0.10;
const W_SEATING: f64 = 0.05;
const W_STAKE_OVERLAP: f64 = 0.05;
const W_ARRIVAL_SYNC: f64 = 0.10;
const W_SOFT_PLAY: f64 = 0.25;
const W_CHIP_FLOW: f64 = 0.25;
const W_NETWORK: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollusionType {
    None,
    /// Repeatedly sitting together / arriving together.
    Teaming,
    SoftPlay,
    ChipDumping,
    SharedNetwork,
    /// Soft-play and chip flow at once: a pair working a third player.
    SqueezeRing,
}

impl std::fmt::Display for CollusionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Teaming => "teaming",
            Self::SoftPlay => "soft_play",
            Self::ChipDumping => "chip_dumping",
            Self::SharedNetwork => "shared_network",
            Self::SqueezeRing => "squeeze_ring",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollusionSubScores {
    pub co_occurrence: f64,
    pub seating_adjacency: f64,
    pub stake_overlap: f64,
    pub arrival_sync: f64,
    pub soft_play: f64,
    pub chip_flow: f64,
    pub network: f64,
}

impl CollusionSubScores {
    fn weighted(&self) -> f64 {
        (self.co_occurrence * W_CO_OCCURRENCE
            + self.seating_adjacency * W_SEATING
            + self.stake_overlap * W_STAKE_OVERLAP
            + self.arrival_sync * W_ARRIVAL_SYNC
            + self.soft_play * W_SOFT_PLAY
            + self.chip_flow * W_CHIP_FLOW
            + self.network * W_NETWORK)
            .clamp(0.0, 1.0)
    }

    fn named(&self) -> [(&'static str, f64); 7] {
        [
            ("co_occurrence", self.co_occurrence),
            ("seating_adjacency", self.seating_adjacency),
            ("stake_overlap", self.stake_overlap),
            ("arrival_sync", self.arrival_sync),
            ("soft_play", self.soft_play),
            ("chip_flow", self.chip_flow),
            ("network", self.network),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollusionEvidence {
    pub kind: String,
    pub description: String,
    pub observed: f64,
    pub threshold: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairAnalysis {
    pub pair: PairKey,
    pub score: f64,
    pub confidence: f64,
    pub collusion_type: CollusionType,
    pub sub_scores: CollusionSubScores,
    pub evidence: Vec<CollusionEvidence>,
    pub hands_together: u64,
}

impl PairAnalysis {
    fn empty(pair: PairKey) -> Self {
        Self {
            pair,
            score: 0.0,
            confidence: 0.0,
            collusion_type: CollusionType::None,
            sub_scores: CollusionSubScores::default(),
            evidence: Vec::new(),
            hands_together: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollusionRing {
    pub members: Vec<String>,
    pub density: f64,
    pub total_hands: u64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerCollusionResult {
    pub player_id: String,
    /// Max of the best pair score and ring confidence.
    pub score: f64,
    pub best_pair: Option<PairAnalysis>,
    pub ring_score: f64,
    pub rings: Vec<CollusionRing>,
}

/// Evidence severity from how far a sub-score clears its threshold.
fn evidence_severity(value: f64, threshold: f64) -> Severity {
    let ratio = if threshold > 0.0 { value / threshold } else { f64::INFINITY };
    if ratio >= 1.8 {
        Severity::Critical
    } else if ratio >= 1.5 {
        Severity::High
    } else if ratio >= 1.2 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn ratio(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 || !value.is_finite() {
        return 0.0;
    }
    (value / threshold).clamp(0.0, 1.0)
}

/// Rate above `baseline`, stretched to fill [0,1].
fn above_baseline(rate: f64, baseline: f64) -> f64 {
    if !rate.is_finite() || baseline >= 1.0 {
        return 0.0;
    }
    ((rate - baseline) / (1.0 - baseline)).clamp(0.0, 1.0)
}

pub struct CollusionDetector {
    cfg: CollusionConfig,
    graph: RwLock<InteractionGraph>,
    rings: RwLock<Vec<CollusionRing>>,
    scorer: Arc<dyn SoftPlayScorer>,
}

impl CollusionDetector {
    pub fn new(cfg: CollusionConfig) -> Self {
        Self::with_scorer(cfg, Arc::new(LinearSoftPlayScorer::default()))
    }

    pub fn with_scorer(cfg: CollusionConfig, scorer: Arc<dyn SoftPlayScorer>) -> Self {
        Self { cfg, graph: RwLock::new(InteractionGraph::new()), rings: RwLock::new(Vec::new()), scorer }
    }

    pub fn record_interaction(&self, update: &EdgeUpdate) -> bool {
        self.graph.write().merge(update)
    }

    pub fn edge(&self, a: &str, b: &str) -> Option<InteractionEdge> {
        self.graph.read().edge(a, b)
    }

    pub fn graph_size(&self) -> (usize, usize) {
        let g = self.graph.read();
        (g.node_count(), g.edge_count())
    }

    // ── Pair analysis ─────────────────────────────────────────────────────────

    pub fn analyze_pair(&self, a: &str, b: &str) -> PairAnalysis {
        let key = PairKey::new(a, b);
        match self.edge(a, b) {
            Some(edge) => self.score_edge(key, &edge),
            None => PairAnalysis::empty(key),
        }
    }

    /// Normalized soft-play features for one edge.
    pub fn soft_play_features(&self, e: &InteractionEdge) -> HashMap<String, f64> {
        let hands = e.hands_together.max(1) as f64;
        let mut f = HashMap::new();
        f.insert(scorer::F_AGGRESSION_DROP.to_string(), e.aggression_drop / hands);
        f.insert(scorer::F_CHECK_DOWN.to_string(), e.check_downs as f64 / hands);
        f.insert(scorer::F_POT_SIZE.to_string(), e.pot_size_delta / hands);
        f.insert(scorer::F_SHOWDOWN.to_string(), e.showdown_delta / hands);
        f.insert(scorer::F_VPIP.to_string(), e.vpip_delta / hands);
        f.insert(scorer::F_PFR.to_string(), e.pfr_delta / hands);
        f.insert(scorer::F_THREE_BET.to_string(), e.three_bet_delta / hands);
        let deficit = if e.head_to_head >= self.cfg.min_head_to_head {
            let wins = e.wins_first.saturating_add(e.wins_second) as f64;
            // Head-to-head pots split between the pair; independent players
            // each win about half of them, colluders rarely contest.
            let share = wins / (2.0 * e.head_to_head as f64);
            let fair = self.cfg.fair_mutual_win_rate;
            if fair > 0.0 {
                ((fair - share) / fair).clamp(0.0, 1.0)
            } else {
                0.0
            }
        } else {
            0.0
        };
        f.insert(scorer::F_MUTUAL_WIN_DEFICIT.to_string(), deficit);
        f
    }

    fn sub_scores(&self, e: &InteractionEdge) -> CollusionSubScores {
        let c = &self.cfg;
        let enough_hands = e.hands_together >= c.min_hands;
        let hands = e.hands_together.max(1) as f64;

        let mut s = CollusionSubScores::default();
        if enough_hands {
            s.co_occurrence = ratio(e.hands_together as f64, c.co_occurrence_hands);
            s.seating_adjacency = above_baseline(e.adjacent_seats as f64 / hands, c.adjacency_baseline);
            s.soft_play = self.scorer.score(&self.soft_play_features(e)).clamp(0.0, 1.0);
        }
        s.stake_overlap = ratio(e.sessions_together as f64, c.stake_overlap_sessions);
        if e.sessions_together > 0 {
            s.arrival_sync =
                above_baseline(e.synced_arrivals as f64 / e.sessions_together as f64, c.arrival_sync_baseline);
        }

        if e.transfers > 0 {
            let net = (e.chips_first_to_second - e.chips_second_to_first).abs();
            let magnitude = ratio(net, c.chip_flow_threshold);
            let frequency = if enough_hands { ratio(e.transfers as f64 / hands, c.transfer_frequency_threshold) } else { 0.0 };
            let ev_rate = ratio(e.ev_loss / e.transfers as f64, c.ev_loss_threshold);
            s.chip_flow = (0.4 * magnitude + 0.3 * frequency + 0.3 * ev_rate).clamp(0.0, 1.0);
        }

        s.network = ratio(e.device_matches as f64, c.device_match_threshold)
            .max(ratio(e.ip_matches as f64, c.ip_match_threshold))
            .max(0.6 * ratio(e.subnet_matches as f64, c.subnet_match_threshold));
        s
    }

    fn classify(&self, s: &CollusionSubScores) -> CollusionType {
        if s.soft_play > self.cfg.squeeze_soft_play && s.chip_flow > self.cfg.squeeze_chip_flow {
            return CollusionType::SqueezeRing;
        }
        let (name, value) = s
            .named()
            .into_iter()
            .fold(("", 0.0), |best, cur| if cur.1 > best.1 { cur } else { best });
        if value <= 0.0 {
            return CollusionType::None;
        }
        match name {
            "soft_play" => CollusionType::SoftPlay,
            "chip_flow" => CollusionType::ChipDumping,
            "network" => CollusionType::SharedNetwork,
            _ => CollusionType::Teaming,
        }
    }

    fn evidence(&self, key: &PairKey, e: &InteractionEdge, s: &CollusionSubScores) -> Vec<CollusionEvidence> {
        let threshold = self.cfg.evidence_threshold;
        let mut out: Vec<CollusionEvidence> = s
            .named()
            .into_iter()
            .filter(|(_, v)| *v >= threshold)
            .map(|(kind, v)| {
                let description = match kind {
                    "co_occurrence" => format!("{} hands together", e.hands_together),
                    "seating_adjacency" => format!("adjacent seats in {} of {} hands", e.adjacent_seats, e.hands_together),
                    "stake_overlap" => format!("{} sessions at the same stakes", e.sessions_together),
                    "arrival_sync" => format!("{} synchronized arrivals", e.synced_arrivals),
                    "soft_play" => format!("soft play between {} ({} head-to-head pots)", key, e.head_to_head),
                    "chip_flow" => format!(
                        "{} transfers, net {:.0} chips, EV loss {:.0}",
                        e.transfers,
                        (e.chips_first_to_second - e.chips_second_to_first).abs(),
                        e.ev_loss
                    ),
                    _ => format!(
                        "{} shared devices, {} shared IPs, {} shared subnets",
                        e.device_matches, e.ip_matches, e.subnet_matches
                    ),
                };
                CollusionEvidence {
                    kind: kind.to_string(),
                    description,
                    observed: v,
                    threshold,
                    severity: evidence_severity(v, threshold),
                }
            })
            .collect();
        out.sort_by(|a, b| b.severity.cmp(&a.severity));
        out
    }

    fn score_edge(&self, key: PairKey, e: &InteractionEdge) -> PairAnalysis {
        let s = self.sub_scores(e);
        let confidence = if e.hands_together < self.cfg.min_hands {
            0.0
        } else {
            0.5 + 0.5 * ratio(e.hands_together as f64, self.cfg.co_occurrence_hands)
        };
        PairAnalysis {
            score: s.weighted(),
            confidence,
            collusion_type: self.classify(&s),
            evidence: self.evidence(&key, e, &s),
            hands_together: e.hands_together,
            sub_scores: s,
            pair: key,
        }
    }

    // ── Player analysis ───────────────────────────────────────────────────────

    pub fn analyze_player(&self, ctx: &Context, player: &str) -> Result<PlayerCollusionResult> {
        // Copy the neighborhood out, then score without holding the lock.
        let edges: Vec<(String, InteractionEdge)> = {
            let g = self.graph.read();
            g.neighbors(player).into_iter().filter_map(|n| g.edge(player, &n).map(|e| (n, e))).collect()
        };
        let mut best: Option<PairAnalysis> = None;
        for (i, (other, edge)) in edges.iter().enumerate() {
            if i % 64 == 0 {
                ctx.check()?;
            }
            let pa = self.score_edge(PairKey::new(player, other), edge);
            if best.as_ref().map_or(true, |b| pa.score > b.score) {
                best = Some(pa);
            }
        }
        let rings: Vec<CollusionRing> =
            self.rings.read().iter().filter(|r| r.members.iter().any(|m| m == player)).cloned().collect();
        let ring_score = rings.iter().map(|r| r.confidence).fold(0.0, f64::max);
        let pair_score = best.as_ref().map(|b| b.score).unwrap_or(0.0);
        Ok(PlayerCollusionResult {
            player_id: player.to_string(),
            score: pair_score.max(ring_score),
            best_pair: best,
            ring_score,
            rings,
        })
    }

    // ── Rings ─────────────────────────────────────────────────────────────────

    pub fn detect_rings(&self, ctx: &Context) -> Result<Vec<CollusionRing>> {
        let c = &self.cfg;
        let strong = self.graph.read().strong_edges(c.strong_edge_weight);
        ctx.check()?;

        let groups = match c.community_method {
            CommunityMethod::Louvain => community::louvain(ctx, &strong, c.louvain_max_passes)?,
            CommunityMethod::ConnectedComponents => community::connected_components(ctx, &strong)?,
        };

        let index: HashMap<PairKey, u64> =
            strong.iter().map(|e| (PairKey::new(&e.a, &e.b), e.hands)).collect();
        let mut rings = Vec::new();
        for members in groups {
            ctx.check()?;
            let n = members.len();
            let possible = (n * (n - 1) / 2) as f64;
            let mut internal = 0usize;
            let mut hands = 0u64;
            for i in 0..n {
                for j in (i + 1)..n {
                    if let Some(h) = index.get(&PairKey::new(&members[i], &members[j])) {
                        internal += 1;
                        hands = hands.saturating_add(*h);
                    }
                }
            }
            let density = internal as f64 / possible;
            if density <= c.ring_min_density || hands <= c.ring_min_hands {
                debug!(size = n, density, hands, "community below ring thresholds");
                continue;
            }
            let mut confidence = 0.6 * density + 0.4 * ratio(hands as f64, (c.ring_min_hands * 5) as f64);
            if n >= 4 {
                confidence *= 1.2;
            }
            rings.push(CollusionRing { members, density, total_hands: hands, confidence: confidence.clamp(0.0, 1.0) });
        }
        rings.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        ctx.check()?;
        *self.rings.write() = rings.clone();
        info!(rings = rings.len(), strong_edges = strong.len(), method = ?c.community_method, "ring sweep complete");
        Ok(rings)
    }

    pub fn rings(&self) -> Vec<CollusionRing> {
        self.rings.read().clone()
    }

    /// Max confidence across stored rings containing the player.
    pub fn player_ring_score(&self, player: &str) -> f64 {
        self.rings
            .read()
            .iter()
            .filter(|r| r.members.iter().any(|m| m == player))
            .map(|r| r.confidence)
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::cancellable;
    use crate::error::FraudError;

    fn detector() -> CollusionDetector {
        CollusionDetector::new(CollusionConfig::default())
    }

    #[test]
    fn missing_edge_is_zero_not_error() {
        let r = detector().analyze_pair("a", "b");
        assert_eq!(r.score, 0.0);
        assert_eq!(r.collusion_type, CollusionType::None);
        assert!(r.evidence.is_empty());
    }

    #[test]
    fn few_hands_keeps_hand_analyzers_neutral() {
        let d = detector();
        d.record_interaction(&EdgeUpdate::new("a", "b").with(|e| {
            e.hands_together = 5;
            e.aggression_drop = 5.0;
            e.check_downs = 5;
        }));
        let r = d.analyze_pair("a", "b");
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.sub_scores.soft_play, 0.0);
        assert_eq!(r.sub_scores.co_occurrence, 0.0);
    }

    #[test]
    fn soft_play_with_dumping_is_a_squeeze_ring() {
        let d = detector();
        d.record_interaction(&EdgeUpdate::new("a", "b").with(|e| {
            e.hands_together = 100;
            e.aggression_drop = 100.0;
            e.check_downs = 90;
            e.pot_size_delta = 80.0;
            e.showdown_delta = 60.0;
            e.vpip_delta = 50.0;
            e.pfr_delta = 50.0;
            e.head_to_head = 40;
            e.wins_first = 2;
            e.chips_first_to_second = 9_000.0;
            e.transfers = 20;
            e.ev_loss = 2_000.0;
        }));
        let r = d.analyze_pair("b", "a");
        assert!(r.sub_scores.soft_play > 0.5, "{:?}", r.sub_scores);
        assert!(r.sub_scores.chip_flow > 0.4, "{:?}", r.sub_scores);
        assert_eq!(r.collusion_type, CollusionType::SqueezeRing);
        // ordered critical → low
        for w in r.evidence.windows(2) {
            assert!(w[0].severity >= w[1].severity);
        }
    }

    #[test]
    fn frequent_tablemates_on_one_ip_get_high_evidence() {
        let d = detector();
        // 150 hands, 8 shared IPs (threshold 10), 5 wins in 33 head-to-head pots
        d.record_interaction(&EdgeUpdate::new("kim", "lee").with(|e| {
            e.hands_together = 150;
            e.ip_matches = 8;
            e.head_to_head = 33;
            e.wins_first = 3;
            e.wins_second = 2;
        }));
        let r = d.analyze_pair("kim", "lee");
        let share: f64 = 5.0 / 33.0;
        assert!((share - 0.15).abs() < 0.01);

        assert!(r.score > 0.0);
        assert!((r.sub_scores.network - 0.8).abs() < 1e-9);
        assert!((r.sub_scores.co_occurrence - 0.75).abs() < 1e-9);
        assert!(r.evidence.iter().any(|e| e.severity >= Severity::High), "{:?}", r.evidence);
        let network = r.evidence.iter().find(|e| e.kind == "network").unwrap();
        assert_eq!(network.severity, Severity::High);
        assert!(network.description.contains("8 shared IPs"));
        assert!(r.evidence.iter().any(|e| e.kind == "co_occurrence" && e.severity == Severity::High));
    }

    #[test]
    fn dense_heavy_group_becomes_a_ring() {
        let d = detector();
        for (a, b) in [("p1", "p2"), ("p1", "p3"), ("p2", "p3"), ("p3", "p4"), ("p1", "p4"), ("p2", "p4")] {
            d.record_interaction(&EdgeUpdate::new(a, b).with(|e| e.hands_together = 40));
        }
        // Weak pair never reaches the strong-edge cut.
        d.record_interaction(&EdgeUpdate::new("p9", "p8").with(|e| e.hands_together = 3));

        let rings = d.detect_rings(&Context::background()).unwrap();
        assert_eq!(rings.len(), 1);
        assert_eq!(rings[0].members, vec!["p1", "p2", "p3", "p4"]);
        assert_eq!(rings[0].total_hands, 240);
        assert!((rings[0].density - 1.0).abs() < 1e-9);
        assert!(d.player_ring_score("p3") > 0.9);
        assert_eq!(d.player_ring_score("p9"), 0.0);
    }

    #[test]
    fn cancelled_sweep_keeps_previous_rings() {
        let d = detector();
        for (a, b) in [("x", "y"), ("y", "z"), ("x", "z")] {
            d.record_interaction(&EdgeUpdate::new(a, b).with(|e| e.hands_together = 50));
        }
        let first = d.detect_rings(&Context::background()).unwrap();
        assert_eq!(first.len(), 1);

        d.record_interaction(&EdgeUpdate::new("x", "w").with(|e| e.hands_together = 500));
        let (handle, ctx) = cancellable();
        handle.cancel();
        assert!(matches!(d.detect_rings(&ctx), Err(FraudError::Cancelled)));
        assert_eq!(d.rings(), first);
    }
}

// feltwatch/src/workers/collusion/graph.rs
//
// Player interaction graph.
//
// Nodes are players, edges are undirected and keyed by an order-independent
// PairKey. Every counter on an edge only ever grows: updates are folded in by
// addition, so the order in which two updates arrive never changes the result.
//
// Directional counters (wins, chips) are stored relative to the PairKey order
// ("first" = lexicographically smaller id) and swapped on the way in.

use std::collections::HashMap;

use petgraph::graph::{EdgeIndex, NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey(String, String);

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }

    pub fn first(&self) -> &str {
        &self.0
    }

    pub fn second(&self) -> &str {
        &self.1
    }

}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<->{}", self.0, self.1)
    }
}

/// Cumulative counters between two players.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionEdge {
    // co-occurrence
    pub hands_together: u64,
    pub adjacent_seats: u64,
    pub sessions_together: u64,
    pub synced_arrivals: u64,

    // head-to-head
    pub head_to_head: u64,
    pub wins_first: u64,
    pub wins_second: u64,

    // behavioral deltas, summed per hand (vs. the same players' play against others)
    pub aggression_drop: f64,
    pub pot_size_delta: f64,
    pub showdown_delta: f64,
    pub check_downs: u64,
    pub vpip_delta: f64,
    pub pfr_delta: f64,
    pub three_bet_delta: f64,

    // chip flow
    pub chips_first_to_second: f64,
    pub chips_second_to_first: f64,
    pub transfers: u64,
    pub ev_loss: f64,

    // network
    pub ip_matches: u64,
    pub device_matches: u64,
    pub subnet_matches: u64,
}

impl InteractionEdge {
    /// Strength used for "strong edge" filtering in ring detection.
    pub fn weight(&self) -> f64 {
        self.hands_together as f64
    }

    fn absorb(&mut self, d: &InteractionEdge, swapped: bool) {
        // Negative or non-finite deltas would break monotonicity. Counters saturate.
        fn pos(v: f64) -> f64 {
            if v.is_finite() && v > 0.0 {
                v
            } else {
                0.0
            }
        }
        let (wins_f, wins_s) = if swapped { (d.wins_second, d.wins_first) } else { (d.wins_first, d.wins_second) };
        let (chips_fs, chips_sf) = if swapped {
            (d.chips_second_to_first, d.chips_first_to_second)
        } else {
            (d.chips_first_to_second, d.chips_second_to_first)
        };

        self.hands_together = self.hands_together.saturating_add(d.hands_together);
        self.adjacent_seats = self.adjacent_seats.saturating_add(d.adjacent_seats);
        self.sessions_together = self.sessions_together.saturating_add(d.sessions_together);
        self.synced_arrivals = self.synced_arrivals.saturating_add(d.synced_arrivals);
        self.head_to_head = self.head_to_head.saturating_add(d.head_to_head);
        self.wins_first = self.wins_first.saturating_add(wins_f);
        self.wins_second = self.wins_second.saturating_add(wins_s);
        self.aggression_drop += pos(d.aggression_drop);
        self.pot_size_delta += pos(d.pot_size_delta);
        self.showdown_delta += pos(d.showdown_delta);
        self.check_downs = self.check_downs.saturating_add(d.check_downs);
        self.vpip_delta += pos(d.vpip_delta);
        self.pfr_delta += pos(d.pfr_delta);
        self.three_bet_delta += pos(d.three_bet_delta);
        self.chips_first_to_second += pos(chips_fs);
        self.chips_second_to_first += pos(chips_sf);
        self.transfers = self.transfers.saturating_add(d.transfers);
        self.ev_loss += pos(d.ev_loss);
        self.ip_matches = self.ip_matches.saturating_add(d.ip_matches);
        self.device_matches = self.device_matches.saturating_add(d.device_matches);
        self.subnet_matches = self.subnet_matches.saturating_add(d.subnet_matches);
    }
}

/// Increment between `a` and `b`. Directional fields in `delta` read
/// "first" as `a` and "second" as `b`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeUpdate {
    pub a: String,
    pub b: String,
    #[serde(default)]
    pub delta: InteractionEdge,
}

impl EdgeUpdate {
    pub fn new(a: &str, b: &str) -> Self {
        Self { a: a.to_string(), b: b.to_string(), delta: InteractionEdge::default() }
    }

    pub fn with(mut self, f: impl FnOnce(&mut InteractionEdge)) -> Self {
        f(&mut self.delta);
        self
    }
}

#[derive(Debug, Clone)]
pub struct StrongEdge {
    pub a: String,
    pub b: String,
    pub weight: f64,
    pub hands: u64,
}

#[derive(Default)]
pub struct InteractionGraph {
    graph: UnGraph<String, InteractionEdge>,
    nodes: HashMap<String, NodeIndex>,
    edges: HashMap<PairKey, EdgeIndex>,
}

impl InteractionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, player: &str) -> NodeIndex {
        if let Some(&ix) = self.nodes.get(player) {
            return ix;
        }
        let ix = self.graph.add_node(player.to_string());
        self.nodes.insert(player.to_string(), ix);
        ix
    }

    /// Fold an update in. Self-pairs are ignored. Returns false for those.
    pub fn merge(&mut self, update: &EdgeUpdate) -> bool {
        if update.a == update.b {
            return false;
        }
        let key = PairKey::new(&update.a, &update.b);
        let swapped = key.first() != update.a;
        let ix = match self.edges.get(&key) {
            Some(&ix) => ix,
            None => {
                let (na, nb) = (self.node(key.first()), self.node(key.second()));
                let ix = self.graph.add_edge(na, nb, InteractionEdge::default());
                self.edges.insert(key, ix);
                ix
            }
        };
        if let Some(edge) = self.graph.edge_weight_mut(ix) {
            edge.absorb(&update.delta, swapped);
        }
        true
    }

    pub fn edge(&self, a: &str, b: &str) -> Option<InteractionEdge> {
        let ix = self.edges.get(&PairKey::new(a, b))?;
        self.graph.edge_weight(*ix).cloned()
    }

    pub fn neighbors(&self, player: &str) -> Vec<String> {
        let Some(&ix) = self.nodes.get(player) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self.graph.neighbors(ix).map(|n| self.graph[n].clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Copy of every edge at or above `min_weight`, sorted by pair.
    pub fn strong_edges(&self, min_weight: f64) -> Vec<StrongEdge> {
        let mut out: Vec<StrongEdge> = self
            .graph
            .edge_references()
            .filter(|e| e.weight().weight() >= min_weight)
            .map(|e| StrongEdge {
                a: self.graph[e.source()].clone(),
                b: self.graph[e.target()].clone(),
                weight: e.weight().weight(),
                hands: e.weight().hands_together,
            })
            .collect();
        out.sort_by(|x, y| (&x.a, &x.b).cmp(&(&y.a, &y.b)));
        out
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_ignores_order() {
        assert_eq!(PairKey::new("bob", "alice"), PairKey::new("alice", "bob"));
        assert_eq!(PairKey::new("bob", "alice").first(), "alice");
    }

    #[test]
    fn merge_order_does_not_matter() {
        let five = EdgeUpdate::new("a", "b").with(|d| d.hands_together = 5);
        let three = EdgeUpdate::new("b", "a").with(|d| d.hands_together = 3);

        let mut g1 = InteractionGraph::new();
        g1.merge(&five);
        g1.merge(&three);
        let mut g2 = InteractionGraph::new();
        g2.merge(&three);
        g2.merge(&five);

        assert_eq!(g1.edge("a", "b"), g2.edge("b", "a"));
        assert_eq!(g1.edge("a", "b").map(|e| e.hands_together), Some(8));
        assert_eq!(g1.edge_count(), 1);
    }

    #[test]
    fn directional_counters_follow_pair_order() {
        let mut g = InteractionGraph::new();
        // "z" sends 100 chips to "a"; stored as second -> first
        g.merge(&EdgeUpdate::new("z", "a").with(|d| {
            d.chips_first_to_second = 100.0;
            d.wins_first = 2;
        }));
        let e = g.edge("a", "z").unwrap();
        assert_eq!(e.chips_second_to_first, 100.0);
        assert_eq!(e.chips_first_to_second, 0.0);
        assert_eq!(e.wins_second, 2);
    }

    #[test]
    fn negative_deltas_never_decrease_counters() {
        let mut g = InteractionGraph::new();
        g.merge(&EdgeUpdate::new("a", "b").with(|d| d.aggression_drop = 2.0));
        g.merge(&EdgeUpdate::new("a", "b").with(|d| d.aggression_drop = -5.0));
        assert_eq!(g.edge("a", "b").unwrap().aggression_drop, 2.0);
        assert!(!g.merge(&EdgeUpdate::new("a", "a")));
    }

    #[test]
    fn huge_feed_counters_saturate_instead_of_wrapping() {
        let line = r#"{"a":"x","b":"y","delta":{"hands_together":18446744073709551615,"ip_matches":18446744073709551615}}"#;
        let update: EdgeUpdate = serde_json::from_str(line).unwrap();
        let mut g = InteractionGraph::new();
        g.merge(&update);
        g.merge(&update);
        g.merge(&EdgeUpdate::new("y", "x").with(|d| d.wins_first = u64::MAX));
        g.merge(&EdgeUpdate::new("y", "x").with(|d| d.wins_first = 1));
        let e = g.edge("x", "y").unwrap();
        assert_eq!(e.hands_together, u64::MAX);
        assert_eq!(e.ip_matches, u64::MAX);
        assert_eq!(e.wins_second, u64::MAX);
    }
}

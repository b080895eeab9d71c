// feltwatch/src/state/window.rs
//
// Sliding-window player state.
// DashMap = sharded concurrent HashMap, so independent players never contend.
//
// Layout:
//   - Per-player action ring (24h) and hand/result logs (7d)
//   - Per-table last-activity map for concurrent-table counting
//   - Hand roster: hand → (player, seat) for co-occurrence updates
//
// Feature extraction reads one window under its read lock and builds a
// PlayerBehavioralFeatures value owned by the caller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::events::{HandPhase, HandResult, PlayerAction, PlayerBehavioralFeatures};

// ── Window durations ──────────────────────────────────────────────────────────

pub const W_5MIN: i64 = 5 * 60;
pub const W_1HR: i64 = 60 * 60;
pub const W_24HR: i64 = 24 * 60 * 60;
pub const W_7D: i64 = 7 * W_24HR;

/// Results per block when measuring win-rate variance.
const WIN_RATE_BLOCK: usize = 10;

// ── Small statistics helpers ──────────────────────────────────────────────────

pub(crate) fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population variance.
pub(crate) fn variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64
}

/// Coefficient of variation; 0 when the mean is 0.
pub(crate) fn cv(xs: &[f64]) -> f64 {
    let m = mean(xs);
    if m.abs() < f64::EPSILON {
        return 0.0;
    }
    variance(xs).sqrt() / m.abs()
}

// ── Per-player window ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct HandEntry {
    hand_id: String,
    table_id: String,
    seen_at: DateTime<Utc>,
    voluntary_preflop: bool,
    raised_preflop: bool,
    saw_preflop: bool,
}

#[derive(Debug)]
pub struct PlayerWindow {
    pub player_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    actions: VecDeque<PlayerAction>,
    hands: VecDeque<HandEntry>,
    hand_index: HashSet<String>,
    results: VecDeque<HandResult>,
    tables: HashMap<String, DateTime<Utc>>,
}

impl PlayerWindow {
    pub fn new(player_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            player_id: player_id.to_string(),
            first_seen: now,
            last_seen: now,
            actions: VecDeque::new(),
            hands: VecDeque::new(),
            hand_index: HashSet::new(),
            results: VecDeque::new(),
            tables: HashMap::new(),
        }
    }

    /// Append an action. Returns true when this is the player's first action in the hand.
    pub fn ingest(&mut self, action: &PlayerAction) -> bool {
        self.last_seen = self.last_seen.max(action.timestamp);
        let last = self.tables.entry(action.table_id.clone()).or_insert(action.timestamp);
        *last = (*last).max(action.timestamp);

        let new_hand = self.hand_index.insert(action.hand_id.clone());
        if new_hand {
            self.hands.push_back(HandEntry {
                hand_id: action.hand_id.clone(),
                table_id: action.table_id.clone(),
                seen_at: action.timestamp,
                voluntary_preflop: false,
                raised_preflop: false,
                saw_preflop: false,
            });
        }
        if action.phase == HandPhase::Preflop {
            if let Some(h) = self.hands.iter_mut().rev().find(|h| h.hand_id == action.hand_id) {
                h.saw_preflop = true;
                h.voluntary_preflop |= action.action_type.is_voluntary();
                h.raised_preflop |= action.action_type.is_raise();
            }
        }
        self.actions.push_back(action.clone());
        new_hand
    }

    pub fn record_result(&mut self, result: &HandResult) {
        self.last_seen = self.last_seen.max(result.timestamp);
        self.results.push_back(result.clone());
    }

    pub fn actions_in(&self, now: DateTime<Utc>, seconds: i64) -> impl Iterator<Item = &PlayerAction> {
        let cutoff = now - Duration::seconds(seconds);
        self.actions.iter().filter(move |a| a.timestamp >= cutoff && a.timestamp <= now)
    }

    fn hands_in(&self, now: DateTime<Utc>, seconds: i64) -> impl Iterator<Item = &HandEntry> {
        let cutoff = now - Duration::seconds(seconds);
        self.hands.iter().filter(move |h| h.seen_at >= cutoff && h.seen_at <= now)
    }

    fn results_in(&self, now: DateTime<Utc>, seconds: i64) -> Vec<&HandResult> {
        let cutoff = now - Duration::seconds(seconds);
        self.results.iter().filter(|r| r.timestamp >= cutoff && r.timestamp <= now).collect()
    }

    /// Tables with any activity in the last five minutes.
    pub fn concurrent_tables(&self, now: DateTime<Utc>) -> u32 {
        let cutoff = now - Duration::seconds(W_5MIN);
        self.tables.values().filter(|&&t| t >= cutoff && t <= now).count() as u32
    }

    pub fn features(&self, now: DateTime<Utc>, window_secs: i64) -> PlayerBehavioralFeatures {
        let mut f = PlayerBehavioralFeatures {
            player_id: self.player_id.clone(),
            window_secs,
            ..Default::default()
        };

        // timing
        let actions: Vec<&PlayerAction> = self.actions_in(now, window_secs).collect();
        let latencies: Vec<f64> = actions.iter().map(|a| a.decision_time_ms as f64 / 1000.0).collect();
        if !latencies.is_empty() {
            f.mean_action_time = mean(&latencies);
            f.action_time_stddev = variance(&latencies).sqrt();
            f.min_action_time = latencies.iter().cloned().fold(f64::INFINITY, f64::min);
            f.max_action_time = latencies.iter().cloned().fold(0.0, f64::max);
        }

        // bet sizing
        let ratios: Vec<f64> = actions
            .iter()
            .filter(|a| a.action_type.is_sized() && a.pot_size > 0.0 && a.amount > 0.0)
            .map(|a| a.amount / a.pot_size)
            .collect();
        if !ratios.is_empty() {
            f.bet_to_pot_ratio = mean(&ratios);
            f.bet_size_variance = variance(&ratios);
        }
        if ratios.len() >= 2 {
            f.bet_precision = 1.0 - cv(&ratios).min(1.0);
        }

        // volume
        let hands: Vec<&HandEntry> = self.hands_in(now, window_secs).collect();
        f.hands_played = hands.len() as u64;
        if let (Some(first), Some(last)) = (hands.iter().map(|h| h.seen_at).min(), hands.iter().map(|h| h.seen_at).max()) {
            let span = (last - first).num_seconds().max(60) as f64;
            f.hands_per_hour = hands.len() as f64 * 3600.0 / span;
        }
        f.concurrent_tables = self.concurrent_tables(now);

        // preflop tendencies
        let preflop: Vec<&&HandEntry> = hands.iter().filter(|h| h.saw_preflop).collect();
        if !preflop.is_empty() {
            let n = preflop.len() as f64;
            f.vpip = preflop.iter().filter(|h| h.voluntary_preflop).count() as f64 / n;
            f.pfr = preflop.iter().filter(|h| h.raised_preflop).count() as f64 / n;
        }

        // performance
        let results = self.results_in(now, window_secs);
        if !results.is_empty() {
            let n = results.len() as f64;
            f.win_rate = results.iter().filter(|r| r.won).count() as f64 / n;
            f.showdown_rate = results.iter().filter(|r| r.went_to_showdown).count() as f64 / n;
            let blocks: Vec<f64> = results
                .chunks_exact(WIN_RATE_BLOCK)
                .map(|c| c.iter().filter(|r| r.won).count() as f64 / WIN_RATE_BLOCK as f64)
                .collect();
            f.win_rate_variance = variance(&blocks);
        }

        // derived
        if !latencies.is_empty() {
            f.consistency_score = 0.5 * (1.0 - cv(&latencies).min(1.0)) + 0.5 * f.bet_precision;
        }
        f
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> WindowStats {
        let decisions: Vec<f64> = self.actions_in(now, W_24HR).map(|a| a.decision_time_ms as f64).collect();
        let results_24h = self.results_in(now, W_24HR);
        let results_7d = self.results_in(now, W_7D);
        let rate = |rs: &[&HandResult]| {
            if rs.is_empty() {
                0.0
            } else {
                rs.iter().filter(|r| r.won).count() as f64 / rs.len() as f64
            }
        };
        WindowStats {
            hands_24h: self.hands_in(now, W_24HR).count() as u64,
            hands_7d: self.hands_in(now, W_7D).count() as u64,
            results_24h: results_24h.len() as u64,
            results_7d: results_7d.len() as u64,
            win_rate_24h: rate(&results_24h),
            win_rate_7d: rate(&results_7d),
            avg_decision_ms: mean(&decisions),
            decision_stddev_ms: variance(&decisions).sqrt(),
            decisions: decisions.len() as u64,
            concurrent_tables: self.concurrent_tables(now),
        }
    }

    pub fn expire_old(&mut self, now: DateTime<Utc>) {
        let action_cutoff = now - Duration::seconds(W_24HR);
        let log_cutoff = now - Duration::seconds(W_7D);
        while self.actions.front().map(|a| a.timestamp < action_cutoff).unwrap_or(false) {
            self.actions.pop_front();
        }
        while let Some(h) = self.hands.front() {
            if h.seen_at >= log_cutoff {
                break;
            }
            self.hand_index.remove(&h.hand_id);
            self.hands.pop_front();
        }
        while self.results.front().map(|r| r.timestamp < log_cutoff).unwrap_or(false) {
            self.results.pop_front();
        }
        self.tables.retain(|_, t| *t >= action_cutoff);
    }

    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.actions.is_empty() && self.hands.is_empty() && self.results.is_empty()
            && now - self.last_seen > Duration::seconds(W_7D)
    }
}

/// Rolling aggregates consumed by the rule engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowStats {
    pub hands_24h: u64,
    pub hands_7d: u64,
    pub results_24h: u64,
    pub results_7d: u64,
    pub win_rate_24h: f64,
    pub win_rate_7d: f64,
    pub avg_decision_ms: f64,
    pub decision_stddev_ms: f64,
    pub decisions: u64,
    pub concurrent_tables: u32,
}

/// What one ingested action changed.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    pub new_hand: bool,
    /// Players (and seats) already seen in the same hand.
    pub tablemates: Vec<(String, u8)>,
}

// ── Global state store ────────────────────────────────────────────────────────

struct Roster {
    opened_at: DateTime<Utc>,
    seats: Vec<(String, u8)>,
}

pub struct StateStore {
    players: DashMap<String, Arc<RwLock<PlayerWindow>>>,
    hand_roster: DashMap<String, Roster>,

    pub total_actions: AtomicU64,
    pub total_results: AtomicU64,
    pub total_players: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            players: DashMap::new(),
            hand_roster: DashMap::new(),
            total_actions: AtomicU64::new(0),
            total_results: AtomicU64::new(0),
            total_players: AtomicU64::new(0),
        }
    }

    fn window(&self, player_id: &str, now: DateTime<Utc>) -> Arc<RwLock<PlayerWindow>> {
        if let Some(w) = self.players.get(player_id) {
            return w.clone();
        }
        self.players
            .entry(player_id.to_string())
            .or_insert_with(|| {
                self.total_players.fetch_add(1, Ordering::Relaxed);
                Arc::new(RwLock::new(PlayerWindow::new(player_id, now)))
            })
            .clone()
    }

    pub fn ingest(&self, action: &PlayerAction) -> IngestOutcome {
        self.total_actions.fetch_add(1, Ordering::Relaxed);
        let window = self.window(&action.player_id, action.timestamp);
        let new_hand = window.write().ingest(action);
        if !new_hand {
            return IngestOutcome::default();
        }

        let mut roster = self.hand_roster.entry(action.hand_id.clone()).or_insert_with(|| Roster {
            opened_at: action.timestamp,
            seats: Vec::new(),
        });
        let tablemates: Vec<(String, u8)> =
            roster.seats.iter().filter(|(p, _)| p != &action.player_id).cloned().collect();
        if !roster.seats.iter().any(|(p, _)| p == &action.player_id) {
            roster.seats.push((action.player_id.clone(), action.seat_position));
        }
        IngestOutcome { new_hand: true, tablemates }
    }

    pub fn record_hand_result(&self, result: &HandResult) {
        self.total_results.fetch_add(1, Ordering::Relaxed);
        self.window(&result.player_id, result.timestamp).write().record_result(result);
    }

    pub fn get_window(&self, player_id: &str) -> Option<Arc<RwLock<PlayerWindow>>> {
        self.players.get(player_id).map(|w| w.clone())
    }

    /// Features for a player; an unknown player yields an all-zero vector.
    pub fn features(&self, player_id: &str, now: DateTime<Utc>, window_secs: i64) -> PlayerBehavioralFeatures {
        match self.get_window(player_id) {
            Some(w) => w.read().features(now, window_secs),
            None => PlayerBehavioralFeatures {
                player_id: player_id.to_string(),
                window_secs,
                ..Default::default()
            },
        }
    }

    pub fn rule_snapshot(&self, player_id: &str, now: DateTime<Utc>) -> WindowStats {
        self.get_window(player_id).map(|w| w.read().snapshot(now)).unwrap_or_default()
    }

    pub fn n_players(&self) -> usize {
        self.players.len()
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    pub fn expire(&self, now: DateTime<Utc>) {
        for entry in self.players.iter() {
            entry.value().write().expire_old(now);
        }
        self.players.retain(|_, w| !w.read().is_idle(now));
        let roster_cutoff = now - Duration::seconds(W_24HR);
        self.hand_roster.retain(|_, r| r.opened_at >= roster_cutoff);
        debug!(players = self.players.len(), hands = self.hand_roster.len(), "state expired");
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ActionType;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn action(player: &str, hand: u32, secs: i64, kind: ActionType, latency_ms: u64) -> PlayerAction {
        PlayerAction {
            player_id: player.into(),
            table_id: "t1".into(),
            hand_id: format!("h{hand}"),
            agent_id: "ag".into(),
            club_id: "cl".into(),
            action_type: kind,
            amount: 50.0,
            seat_position: (player.len() % 9) as u8,
            timestamp: t0() + Duration::seconds(secs),
            decision_time_ms: latency_ms,
            phase: HandPhase::Preflop,
            pot_size: 100.0,
            stack_size: 1000.0,
            visible_cards: vec![],
            ip_address: None,
            device_id: None,
            session_id: None,
        }
    }

    #[test]
    fn timing_and_sizing_features() {
        let store = StateStore::new();
        for i in 0..10 {
            store.ingest(&action("p", i, i as i64 * 60, ActionType::Bet, 1000 + (i as u64 % 2) * 1000));
        }
        let f = store.features("p", t0() + Duration::seconds(600), W_24HR);
        assert_eq!(f.hands_played, 10);
        assert!((f.mean_action_time - 1.5).abs() < 1e-9);
        assert!((f.action_time_stddev - 0.5).abs() < 1e-9);
        assert_eq!(f.min_action_time, 1.0);
        assert_eq!(f.max_action_time, 2.0);
        // every bet is exactly half pot
        assert!((f.bet_precision - 1.0).abs() < 1e-9);
        assert!((f.bet_to_pot_ratio - 0.5).abs() < 1e-9);
        assert!((f.vpip - 1.0).abs() < 1e-9);
        assert_eq!(f.pfr, 0.0);
        assert!((f.hands_per_hour - 10.0 * 3600.0 / 540.0).abs() < 1e-9);
    }

    #[test]
    fn tablemates_reported_once_per_hand() {
        let store = StateStore::new();
        assert!(store.ingest(&action("alice", 1, 0, ActionType::Call, 900)).tablemates.is_empty());
        let out = store.ingest(&action("bob", 1, 1, ActionType::Raise, 900));
        assert!(out.new_hand);
        assert_eq!(out.tablemates.len(), 1);
        assert_eq!(out.tablemates[0].0, "alice");
        // second action by bob in the same hand changes nothing
        assert!(!store.ingest(&action("bob", 1, 2, ActionType::Bet, 900)).new_hand);
    }

    #[test]
    fn win_rate_variance_uses_blocks_of_ten() {
        let store = StateStore::new();
        for i in 0..20 {
            store.record_hand_result(&HandResult {
                player_id: "p".into(),
                table_id: "t1".into(),
                hand_id: format!("h{i}"),
                timestamp: t0() + Duration::seconds(i),
                // first block wins 10/10, second 0/10
                won: i < 10,
                went_to_showdown: i % 2 == 0,
                net_chips: 0.0,
                big_blind: 2.0,
            });
        }
        let f = store.features("p", t0() + Duration::seconds(100), W_24HR);
        assert!((f.win_rate - 0.5).abs() < 1e-9);
        assert!((f.win_rate_variance - 0.25).abs() < 1e-9);
        assert!((f.showdown_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn expiry_drops_old_actions_but_keeps_week_of_hands() {
        let store = StateStore::new();
        store.ingest(&action("p", 1, 0, ActionType::Call, 800));
        let later = t0() + Duration::seconds(W_24HR + 10);
        store.expire(later);
        let stats = store.rule_snapshot("p", later);
        assert_eq!(stats.decisions, 0);
        assert_eq!(stats.hands_7d, 1);
        assert_eq!(stats.hands_24h, 0);
    }

    #[test]
    fn unknown_player_has_empty_features() {
        let f = StateStore::new().features("ghost", t0(), W_24HR);
        assert_eq!(f.hands_played, 0);
        assert_eq!(f.consistency_score, 0.0);
    }
}

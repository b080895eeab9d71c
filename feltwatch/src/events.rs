// feltwatch/src/events.rs
//
// Shared event types and all domain types flowing through Feltwatch.
//
// Inputs arrive from the game engine (PlayerAction, HandResult, session and
// login records). The engine never sends hidden cards or another player's
// private state; `visible_cards` holds only what the acting player may see.
// Outputs leave as AntiCheatAlert (persisted) and AlertMessage (published).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

// ── Game-engine input ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Fold,
    Check,
    Call,
    Bet,
    Raise,
    AllIn,
    PostBlind,
}

impl ActionType {
    /// Money put in by choice. Blinds do not count toward VPIP.
    pub fn is_voluntary(self) -> bool {
        matches!(self, Self::Call | Self::Bet | Self::Raise | Self::AllIn)
    }

    /// Actions whose amount is chosen by the player relative to the pot.
    pub fn is_sized(self) -> bool {
        matches!(self, Self::Bet | Self::Raise)
    }

    pub fn is_raise(self) -> bool {
        matches!(self, Self::Raise | Self::AllIn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandPhase {
    Preflop,
    Flop,
    Turn,
    River,
    Showdown,
}

/// One decision by one player, as emitted by the table engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerAction {
    pub player_id: String,
    pub table_id: String,
    pub hand_id: String,
    pub agent_id: String,
    pub club_id: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub amount: f64,
    pub seat_position: u8,
    pub timestamp: DateTime<Utc>,
    pub decision_time_ms: u64,
    pub phase: HandPhase,
    #[serde(default)]
    pub pot_size: f64,
    #[serde(default)]
    pub stack_size: f64,
    #[serde(default)]
    pub visible_cards: Vec<String>,
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Per-player outcome of a finished hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandResult {
    pub player_id: String,
    pub table_id: String,
    pub hand_id: String,
    pub timestamp: DateTime<Utc>,
    pub won: bool,
    pub went_to_showdown: bool,
    #[serde(default)]
    pub net_chips: f64,
    #[serde(default)]
    pub big_blind: f64,
}

// ── Device / session / transfer records (store contracts) ─────────────────────

/// Append-only record written on every login / connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub player_id: String,
    pub fingerprint: String,
    pub ip_address: Option<IpAddr>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSession {
    pub session_id: String,
    pub player_id: String,
    pub table_id: String,
    pub connected_at: DateTime<Utc>,
    /// None while the session is still open.
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub chips_in: f64,
    #[serde(default)]
    pub chips_out: f64,
}

impl PlayerSession {
    pub fn end_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.disconnected_at.unwrap_or(now)
    }

    pub fn duration_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.end_or(now) - self.connected_at).num_seconds().max(0)
    }

    /// Seconds both sessions were online at the same time.
    pub fn overlap_secs(&self, other: &PlayerSession, now: DateTime<Utc>) -> i64 {
        let start = self.connected_at.max(other.connected_at);
        let end = self.end_or(now).min(other.end_or(now));
        (end - start).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipTransfer {
    pub from_player: String,
    pub to_player: String,
    pub table_id: String,
    pub hand_id: String,
    pub amount: f64,
    /// Expected-value lost by the sender on this transfer (≥ 0).
    #[serde(default)]
    pub ev_impact: f64,
    #[serde(default)]
    pub context: String,
    pub timestamp: DateTime<Utc>,
}

// ── Behavioral features ───────────────────────────────────────────────────────

/// Fixed-shape feature vector for one player over one window.
/// Times are in seconds, rates in [0,1].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerBehavioralFeatures {
    pub player_id: String,
    pub window_secs: i64,
    // timing
    pub mean_action_time: f64,
    pub action_time_stddev: f64,
    pub min_action_time: f64,
    pub max_action_time: f64,
    // bet sizing
    pub bet_precision: f64,
    pub bet_to_pot_ratio: f64,
    pub bet_size_variance: f64,
    // volume
    pub hands_played: u64,
    pub hands_per_hour: f64,
    pub concurrent_tables: u32,
    // performance
    pub win_rate: f64,
    pub win_rate_variance: f64,
    pub showdown_rate: f64,
    pub vpip: f64,
    pub pfr: f64,
    // derived
    pub consistency_score: f64,
}

// ── Alerts ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Bot,
    Collusion,
    MultiAccount,
    ChipDumping,
    Fraud,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bot => write!(f, "bot"),
            Self::Collusion => write!(f, "collusion"),
            Self::MultiAccount => write!(f, "multi_account"),
            Self::ChipDumping => write!(f, "chip_dumping"),
            Self::Fraud => write!(f, "fraud"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Numeric score carried by rule-engine alerts.
    pub fn score(self) -> f64 {
        match self {
            Self::Critical => 1.0,
            Self::High => 0.8,
            Self::Medium => 0.5,
            Self::Low => 0.25,
        }
    }

    pub fn is_severe(self) -> bool {
        self >= Self::High
    }

    /// Map a 0–1 score onto a severity band.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Self::Critical
        } else if score >= 0.75 {
            Self::High
        } else if score >= 0.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Reviewed,
    Dismissed,
    Confirmed,
}

impl AlertStatus {
    /// Reviewers may only move an alert out of `Pending`.
    pub fn can_transition_to(self, next: AlertStatus) -> bool {
        self == Self::Pending && next != Self::Pending
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Reviewed => write!(f, "reviewed"),
            Self::Dismissed => write!(f, "dismissed"),
            Self::Confirmed => write!(f, "confirmed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiCheatAlert {
    pub id: String,
    pub player_id: String,
    pub agent_id: String,
    pub club_id: String,
    pub table_id: Option<String>,
    pub hand_id: Option<String>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub score: f64,
    pub evidence: Vec<String>,
    pub status: AlertStatus,
    /// Detector or rule name that raised the alert.
    pub source: String,
    pub risk_breakdown: HashMap<String, f64>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
}

impl AntiCheatAlert {
    pub fn new(
        player_id: &str,
        alert_type: AlertType,
        severity: Severity,
        score: f64,
        source: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            player_id: player_id.to_string(),
            agent_id: String::new(),
            club_id: String::new(),
            table_id: None,
            hand_id: None,
            alert_type,
            severity,
            score: score.clamp(0.0, 1.0),
            evidence: Vec::new(),
            status: AlertStatus::Pending,
            source: source.to_string(),
            risk_breakdown: HashMap::new(),
            created_at,
            reviewed_at: None,
            reviewed_by: None,
        }
    }

    /// Attach table / hand / tenant context from the triggering action.
    pub fn with_action(mut self, action: &PlayerAction) -> Self {
        self.agent_id = action.agent_id.clone();
        self.club_id = action.club_id.clone();
        self.table_id = Some(action.table_id.clone());
        self.hand_id = Some(action.hand_id.clone());
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }
}

// ── Recommended actions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    CaptchaVerification,
    DeviceFingerprintVerification,
    TableSeparation,
    ChipTransferFreeze,
    ManualReview,
    AccountSuspension,
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CaptchaVerification => write!(f, "CAPTCHA verification"),
            Self::DeviceFingerprintVerification => write!(f, "device fingerprint verification"),
            Self::TableSeparation => write!(f, "table separation"),
            Self::ChipTransferFreeze => write!(f, "chip transfer freeze"),
            Self::ManualReview => write!(f, "manual review"),
            Self::AccountSuspension => write!(f, "account suspension"),
        }
    }
}

/// Three-way verdict shared by the bot and multi-account detectors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Flag,
    Review,
    Clear,
}

impl Verdict {
    pub fn from_thresholds(score: f64, flag: f64, review: f64) -> Self {
        if score >= flag {
            Self::Flag
        } else if score >= review {
            Self::Review
        } else {
            Self::Clear
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flag => write!(f, "flag"),
            Self::Review => write!(f, "review"),
            Self::Clear => write!(f, "clear"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(start: i64, end: Option<i64>) -> PlayerSession {
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        PlayerSession {
            session_id: format!("s{start}"),
            player_id: "p".into(),
            table_id: "t".into(),
            connected_at: base + Duration::seconds(start),
            disconnected_at: end.map(|e| base + Duration::seconds(e)),
            chips_in: 0.0,
            chips_out: 0.0,
        }
    }

    #[test]
    fn overlap_of_disjoint_sessions_is_zero() {
        let now = DateTime::from_timestamp(1_700_010_000, 0).unwrap();
        assert_eq!(session(0, Some(100)).overlap_secs(&session(200, Some(300)), now), 0);
    }

    #[test]
    fn open_session_overlaps_until_now() {
        let now = DateTime::from_timestamp(1_700_000_500, 0).unwrap();
        assert_eq!(session(0, None).overlap_secs(&session(100, Some(400)), now), 300);
        assert_eq!(session(0, None).duration_secs(now), 500);
    }

    #[test]
    fn only_pending_alerts_transition() {
        assert!(AlertStatus::Pending.can_transition_to(AlertStatus::Confirmed));
        assert!(!AlertStatus::Pending.can_transition_to(AlertStatus::Pending));
        assert!(!AlertStatus::Dismissed.can_transition_to(AlertStatus::Confirmed));
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High.is_severe());
        assert!(!Severity::Medium.is_severe());
        assert_eq!(Severity::Low.score(), 0.25);
        assert_eq!(serde_json::to_string(&AlertType::MultiAccount).unwrap(), "\"multi_account\"");
    }
}

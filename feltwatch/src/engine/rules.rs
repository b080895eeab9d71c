// feltwatch/src/engine/rules.rs
//
// Deterministic, cooldown-gated rule engine.
//
// Standard catalog:
//   excessive_hands_24h   volume       high      > 500 hands in 24h          1h
//   excessive_hands_7d    volume       medium    > 2500 hands in 7d          6h
//   abnormal_win_rate     performance  critical  > 95% over ≥ 50 hands       1h
//   sustained_win_rate    performance  high      > 75% over ≥ 500 hands (7d) 24h
//   superhuman_reaction   timing       high      avg decision < 300 ms       1h
//   robotic_timing        timing       high      decision stddev < 50 ms     1h
//   shared_device         network      critical  ≥ 3 accounts on one device  24h
//   shared_ip             network      medium    ≥ 5 accounts on one IP      24h
//   marathon_session      session      medium    session ≥ 12h               6h
//   excessive_tables      volume       high      > 12 concurrent tables      1h
//   one_way_transfers     transfer     high      ≥ 5 outgoing, 0 incoming    6h
//   repeat_offender       history      high      ≥ 10 alerts in 30d          24h
//
// The catalog is an explicit value: build one, hand it to a RuleEngine.
// Cooldowns live in the engine, keyed by (player, rule).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RuleConfig;
use crate::error::{FraudError, Result};
use crate::events::{AlertType, AntiCheatAlert, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Volume,
    Performance,
    Timing,
    Network,
    Session,
    Transfer,
    History,
}

/// Rolling statistics a rule may look at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCheckData {
    pub player_id: String,
    pub agent_id: String,
    pub club_id: String,
    pub table_id: Option<String>,
    pub hand_id: Option<String>,

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

    pub accounts_on_device: usize,
    pub accounts_on_ip: usize,

    pub longest_session_secs: i64,

    pub outgoing_transfers: u64,
    pub incoming_transfers: u64,
    pub outgoing_chips: f64,

    pub alerts_24h: u64,
    pub alerts_30d: u64,
}

pub type RuleCheck = fn(&RuleCheckData) -> bool;
pub type RuleEvidence = fn(&RuleCheckData) -> String;

#[derive(Clone)]
pub struct Rule {
    pub name: &'static str,
    pub description: &'static str,
    pub category: RuleCategory,
    pub severity: Severity,
    pub alert_type: AlertType,
    pub cooldown: Option<Duration>,
    pub check: RuleCheck,
    pub evidence: RuleEvidence,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("severity", &self.severity)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

// ── Catalog ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    rules: Vec<Rule>,
}

impl RuleCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds a rule; names must be unique.
    pub fn register(&mut self, rule: Rule) -> Result<()> {
        if self.get(rule.name).is_some() {
            return Err(FraudError::Config(format!("duplicate rule {}", rule.name)));
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn standard() -> Self {
        let h = Duration::hours;
        let rules = vec![
            Rule {
                name: "excessive_hands_24h",
                description: "More than 500 hands in 24 hours",
                category: RuleCategory::Volume,
                severity: Severity::High,
                alert_type: AlertType::Bot,
                cooldown: Some(h(1)),
                check: |d| d.hands_24h > 500,
                evidence: |d| format!("{} hands in 24h", d.hands_24h),
            },
            Rule {
                name: "excessive_hands_7d",
                description: "More than 2500 hands in 7 days",
                category: RuleCategory::Volume,
                severity: Severity::Medium,
                alert_type: AlertType::Bot,
                cooldown: Some(h(6)),
                check: |d| d.hands_7d > 2500,
                evidence: |d| format!("{} hands in 7d", d.hands_7d),
            },
            Rule {
                name: "abnormal_win_rate",
                description: "Win rate above 95% over at least 50 hands",
                category: RuleCategory::Performance,
                severity: Severity::Critical,
                alert_type: AlertType::Fraud,
                cooldown: Some(h(1)),
                check: |d| d.results_24h >= 50 && d.win_rate_24h > 0.95,
                evidence: |d| format!("win rate {:.1}% over {} hands", d.win_rate_24h * 100.0, d.results_24h),
            },
            Rule {
                name: "sustained_win_rate",
                description: "Win rate above 75% over at least 500 hands in 7 days",
                category: RuleCategory::Performance,
                severity: Severity::High,
                alert_type: AlertType::Fraud,
                cooldown: Some(h(24)),
                check: |d| d.results_7d >= 500 && d.win_rate_7d > 0.75,
                evidence: |d| format!("7d win rate {:.1}% over {} hands", d.win_rate_7d * 100.0, d.results_7d),
            },
            Rule {
                name: "superhuman_reaction",
                description: "Average decision time under 300 ms",
                category: RuleCategory::Timing,
                severity: Severity::High,
                alert_type: AlertType::Bot,
                cooldown: Some(h(1)),
                check: |d| d.decisions >= 20 && d.avg_decision_ms < 300.0,
                evidence: |d| format!("avg decision {:.0} ms over {} decisions", d.avg_decision_ms, d.decisions),
            },
            Rule {
                name: "robotic_timing",
                description: "Decision-time stddev under 50 ms",
                category: RuleCategory::Timing,
                severity: Severity::High,
                alert_type: AlertType::Bot,
                cooldown: Some(h(1)),
                check: |d| d.decisions >= 50 && d.decision_stddev_ms < 50.0,
                evidence: |d| format!("decision stddev {:.1} ms over {} decisions", d.decision_stddev_ms, d.decisions),
            },
            Rule {
                name: "shared_device",
                description: "Three or more accounts on one device",
                category: RuleCategory::Network,
                severity: Severity::Critical,
                alert_type: AlertType::MultiAccount,
                cooldown: Some(h(24)),
                check: |d| d.accounts_on_device >= 3,
                evidence: |d| format!("{} accounts share a device", d.accounts_on_device),
            },
            Rule {
                name: "shared_ip",
                description: "Five or more accounts on one IP",
                category: RuleCategory::Network,
                severity: Severity::Medium,
                alert_type: AlertType::MultiAccount,
                cooldown: Some(h(24)),
                check: |d| d.accounts_on_ip >= 5,
                evidence: |d| format!("{} accounts share an IP", d.accounts_on_ip),
            },
            Rule {
                name: "marathon_session",
                description: "Single session of 12 hours or more",
                category: RuleCategory::Session,
                severity: Severity::Medium,
                alert_type: AlertType::Bot,
                cooldown: Some(h(6)),
                check: |d| d.longest_session_secs >= 12 * 3600,
                evidence: |d| format!("session of {:.1}h", d.longest_session_secs as f64 / 3600.0),
            },
            Rule {
                name: "excessive_tables",
                description: "More than 12 concurrent tables",
                category: RuleCategory::Volume,
                severity: Severity::High,
                alert_type: AlertType::Bot,
                cooldown: Some(h(1)),
                check: |d| d.concurrent_tables > 12,
                evidence: |d| format!("{} concurrent tables", d.concurrent_tables),
            },
            Rule {
                name: "one_way_transfers",
                description: "Five or more outgoing chip transfers with none coming back",
                category: RuleCategory::Transfer,
                severity: Severity::High,
                alert_type: AlertType::ChipDumping,
                cooldown: Some(h(6)),
                check: |d| d.outgoing_transfers >= 5 && d.incoming_transfers == 0,
                evidence: |d| format!("{} outgoing transfers ({:.0} chips), none incoming", d.outgoing_transfers, d.outgoing_chips),
            },
            Rule {
                name: "repeat_offender",
                description: "Ten or more alerts in 30 days",
                category: RuleCategory::History,
                severity: Severity::High,
                alert_type: AlertType::Fraud,
                cooldown: Some(h(24)),
                check: |d| d.alerts_30d >= 10,
                evidence: |d| format!("{} alerts in 30d", d.alerts_30d),
            },
        ];
        Self { rules }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct RuleEngine {
    catalog: RuleCatalog,
    disabled: RwLock<HashSet<&'static str>>,
    last_fired: RwLock<HashMap<(String, &'static str), DateTime<Utc>>>,
}

impl RuleEngine {
    pub fn new(catalog: RuleCatalog, cfg: &RuleConfig) -> Result<Self> {
        let engine = Self { catalog, disabled: RwLock::new(HashSet::new()), last_fired: RwLock::new(HashMap::new()) };
        for name in &cfg.disabled {
            engine.set_enabled(name, false)?;
        }
        Ok(engine)
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let rule = self.catalog.get(name).ok_or_else(|| FraudError::UnknownRule(name.to_string()))?;
        let mut disabled = self.disabled.write();
        if enabled {
            disabled.remove(rule.name);
        } else {
            disabled.insert(rule.name);
        }
        info!(rule = rule.name, enabled, "rule toggled");
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.catalog.get(name).is_some() && !self.disabled.read().contains(name)
    }

    fn cooling(&self, map: &HashMap<(String, &'static str), DateTime<Utc>>, player: &str, rule: &Rule, now: DateTime<Utc>) -> bool {
        let Some(cd) = rule.cooldown else { return false };
        map.get(&(player.to_string(), rule.name)).map(|&t| now < t + cd).unwrap_or(false)
    }

    /// Alerts for every enabled rule whose predicate holds and whose cooldown
    /// has lapsed. Cooldowns are read, never written.
    pub fn candidates(&self, data: &RuleCheckData, now: DateTime<Utc>) -> Vec<AntiCheatAlert> {
        let disabled = self.disabled.read().clone();
        let fired = self.last_fired.read();
        let mut alerts = Vec::new();
        for rule in &self.catalog.rules {
            if disabled.contains(rule.name) {
                continue;
            }
            if self.cooling(&fired, &data.player_id, rule, now) {
                debug!(rule = rule.name, player = %data.player_id, "rule in cooldown");
                continue;
            }
            if !(rule.check)(data) {
                continue;
            }
            let mut alert = AntiCheatAlert::new(&data.player_id, rule.alert_type, rule.severity, rule.severity.score(), rule.name, now)
                .with_evidence(vec![rule.description.to_string(), (rule.evidence)(data)]);
            alert.agent_id = data.agent_id.clone();
            alert.club_id = data.club_id.clone();
            alert.table_id = data.table_id.clone();
            alert.hand_id = data.hand_id.clone();
            alert.risk_breakdown.insert(format!("rule:{}", rule.name), rule.severity.score());
            alerts.push(alert);
        }
        alerts
    }

    /// Record trigger times for `alerts` and keep the ones this call won.
    /// A concurrent claim may have fired the same rule since `candidates`.
    pub fn claim(&self, alerts: Vec<AntiCheatAlert>, now: DateTime<Utc>) -> Vec<AntiCheatAlert> {
        if alerts.is_empty() {
            return alerts;
        }
        let mut fired = self.last_fired.write();
        alerts
            .into_iter()
            .filter(|a| {
                let Some(rule) = self.catalog.get(&a.source) else { return false };
                if self.cooling(&fired, &a.player_id, rule, now) {
                    return false;
                }
                fired.insert((a.player_id.clone(), rule.name), now);
                true
            })
            .collect()
    }

    /// Drop cooldown entries that can no longer suppress anything.
    pub fn purge_cooldowns(&self, now: DateTime<Utc>) -> usize {
        let mut fired = self.last_fired.write();
        let before = fired.len();
        let longest: HashMap<&'static str, Duration> =
            self.catalog.rules.iter().map(|r| (r.name, r.cooldown.unwrap_or_else(Duration::zero))).collect();
        fired.retain(|(_, name), t| longest.get(name).map(|cd| *t + *cd > now).unwrap_or(false));
        before - fired.len()
    }
}

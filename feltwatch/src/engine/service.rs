// feltwatch/src/engine/service.rs
//
// Fraud service: the per-action join-then-decide pipeline.
//
//   ingest → features → spawn { bot, collusion, multi-account, rules, risk }
//          → join (per-detector timeout) → combine → requires_action?
//          → persist alerts → publish (high / critical sync, rest queued)
//
// A failed or slow detector is recorded in `failures` and its sub-score is
// treated as missing; the others still count. Persistence always happens
// before publishing, so a broker outage never loses an alert.
//
// Side inputs (hand results, logins, sessions, transfers) feed the
// interaction graph and the stores the detectors read from.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::Context;
use crate::engine::alerts::{AlertService, Notifier};
use crate::engine::risk::{RiskScore, RiskScorer, RiskSignals};
use crate::engine::rules::{RuleCatalog, RuleCheckData, RuleEngine};
use crate::error::{FraudError, Result};
use crate::events::{
    AlertType, AntiCheatAlert, ChipTransfer, DeviceFingerprint, HandResult, PlayerAction, PlayerSession,
    RecommendedAction, Severity,
};
use crate::publisher::{AlertPublisher, Broker, PublisherStats};
use crate::state::window::StateStore;
use crate::store::memory::{MemoryAlertStorage, MemoryFingerprintDb, MemorySessionStore, MemoryTransferDb};
use crate::store::{subnet_of, AlertStorage, FingerprintDatabase, SessionStore, TransferDatabase};
use crate::workers::collusion::graph::{EdgeUpdate, InteractionEdge, PairKey};
use crate::workers::collusion::CollusionType;
use crate::workers::{
    BotDetectionResult, BotDetector, CollusionDetector, CollusionRing, DeviceAttributes, MultiAccountDetector,
    MultiAccountResult, PlayerCollusionResult,
};

/// Connections this close together count as a synchronized arrival.
const ARRIVAL_SYNC_SECS: i64 = 60;

// ── Stores ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Stores {
    pub fingerprints: Arc<dyn FingerprintDatabase>,
    pub sessions: Arc<dyn SessionStore>,
    pub transfers: Arc<dyn TransferDatabase>,
    pub alerts: Arc<dyn AlertStorage>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            fingerprints: Arc::new(MemoryFingerprintDb::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            transfers: Arc::new(MemoryTransferDb::new()),
            alerts: Arc::new(MemoryAlertStorage::new()),
        }
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorFailure {
    pub detector: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudDetectionResult {
    pub player_id: String,
    pub agent_id: String,
    pub club_id: String,
    pub table_id: String,
    pub hand_id: String,
    pub bot: Option<BotDetectionResult>,
    pub collusion: Option<PlayerCollusionResult>,
    pub multi_account: Option<MultiAccountResult>,
    pub rule_alerts: Vec<AntiCheatAlert>,
    pub risk: RiskScore,
    pub overall_score: f64,
    pub requires_action: bool,
    pub recommended_actions: Vec<RecommendedAction>,
    /// Alerts persisted for this action.
    pub alerts: Vec<AntiCheatAlert>,
    pub failures: Vec<DetectorFailure>,
    pub processed_at: DateTime<Utc>,
    pub latency_us: u64,
}

#[derive(Default)]
pub struct ServiceStats {
    pub actions: AtomicU64,
    pub flagged: AtomicU64,
    pub alerts_persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub published_sync: AtomicU64,
    pub queued_async: AtomicU64,
    pub publish_failures: AtomicU64,
    pub detector_failures: AtomicU64,
    pub detector_timeouts: AtomicU64,
    pub hand_results: AtomicU64,
    pub logins: AtomicU64,
    pub transfers: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStatsSnapshot {
    pub actions: u64,
    pub flagged: u64,
    pub alerts_persisted: u64,
    pub persist_failures: u64,
    pub published_sync: u64,
    pub queued_async: u64,
    pub publish_failures: u64,
    pub detector_failures: u64,
    pub detector_timeouts: u64,
    pub hand_results: u64,
    pub logins: u64,
    pub transfers: u64,
    pub players: usize,
    pub graph_nodes: usize,
    pub graph_edges: usize,
    pub rings: usize,
    pub risk_cache_hits: u64,
    pub risk_computations: u64,
    pub publisher: PublisherStats,
}

/// Showdown participants for one hand, waiting for the rest of the results.
struct Showdown {
    opened_at: DateTime<Utc>,
    seen: Vec<(String, bool)>,
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct FraudService {
    cfg: EngineConfig,
    stores: Stores,
    state: Arc<StateStore>,
    bot: Arc<BotDetector>,
    collusion: Arc<CollusionDetector>,
    multi_account: Arc<MultiAccountDetector>,
    rules: Arc<RuleEngine>,
    risk: Arc<RiskScorer>,
    alerts: Arc<AlertService>,
    publisher: Arc<AlertPublisher>,
    showdowns: DashMap<String, Showdown>,
    pub stats: ServiceStats,
}

async fn guarded<T>(name: &'static str, timeout: StdDuration, mut handle: JoinHandle<Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(res)) => res,
        Ok(Err(join)) => Err(FraudError::Detector(name, join.to_string())),
        Err(_) => {
            handle.abort();
            Err(FraudError::Detector(name, "timed out".into()))
        }
    }
}

fn is_timeout(err: &FraudError) -> bool {
    match err {
        FraudError::DeadlineExceeded => true,
        FraudError::Detector(_, msg) => msg == "timed out",
        _ => false,
    }
}

impl FraudService {
    pub fn new(
        cfg: EngineConfig,
        stores: Stores,
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Arc<Self>> {
        Self::with_catalog(cfg, stores, broker, notifier, RuleCatalog::standard())
    }

    pub fn with_catalog(
        cfg: EngineConfig,
        stores: Stores,
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        catalog: RuleCatalog,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let rules = RuleEngine::new(catalog, &cfg.rules)?;
        let svc = Self {
            state: Arc::new(StateStore::new()),
            bot: Arc::new(BotDetector::new(cfg.bot.clone())),
            collusion: Arc::new(CollusionDetector::new(cfg.collusion.clone())),
            multi_account: Arc::new(MultiAccountDetector::new(
                cfg.multi_account.clone(),
                stores.fingerprints.clone(),
                stores.sessions.clone(),
            )),
            rules: Arc::new(rules),
            risk: Arc::new(RiskScorer::new(cfg.risk.clone(), stores.alerts.clone())),
            alerts: Arc::new(AlertService::new(stores.alerts.clone(), notifier)),
            publisher: AlertPublisher::new(cfg.publisher.clone(), broker),
            showdowns: DashMap::new(),
            stats: ServiceStats::default(),
            stores,
            cfg,
        };
        info!(
            rules = svc.rules.catalog().len(),
            detector_timeout_ms = svc.cfg.service.detector_timeout_ms,
            "fraud service ready"
        );
        Ok(Arc::new(svc))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }
    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }
    pub fn collusion(&self) -> &Arc<CollusionDetector> {
        &self.collusion
    }
    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }
    pub fn risk(&self) -> &Arc<RiskScorer> {
        &self.risk
    }
    pub fn alerts(&self) -> &Arc<AlertService> {
        &self.alerts
    }
    pub fn publisher(&self) -> &Arc<AlertPublisher> {
        &self.publisher
    }

    /// Publisher drain, ring sweep and housekeeping, all bound to `ctx`.
    pub fn spawn_background(self: &Arc<Self>, ctx: &Context) -> Vec<JoinHandle<()>> {
        let every = StdDuration::from_secs(self.cfg.service.ring_sweep_interval_secs.max(1));
        vec![
            tokio::spawn(self.publisher.clone().drain_loop(ctx.clone())),
            tokio::spawn(self.clone().ring_sweep_loop(ctx.clone(), every)),
            tokio::spawn(self.clone().housekeeping_loop(ctx.clone(), StdDuration::from_secs(60))),
        ]
    }

    // ── Per-action pipeline ───────────────────────────────────────────────────

    pub async fn process_action(&self, ctx: &Context, action: PlayerAction) -> Result<FraudDetectionResult> {
        ctx.check()?;
        let started = Instant::now();
        let now = action.timestamp;
        let player = action.player_id.clone();
        let svc_cfg = &self.cfg.service;
        self.stats.actions.fetch_add(1, Ordering::Relaxed);

        let outcome = self.state.ingest(&action);
        for (mate, seat) in &outcome.tablemates {
            let adjacent = (i16::from(*seat) - i16::from(action.seat_position)).abs() == 1;
            self.collusion.record_interaction(&EdgeUpdate::new(&player, mate).with(|e| {
                e.hands_together = 1;
                e.adjacent_seats = u64::from(adjacent);
            }));
        }
        let features = self.state.features(&player, now, svc_cfg.feature_window_secs);

        // ── Fan out ───────────────────────────────────────────────────────────
        let timeout = StdDuration::from_millis(svc_cfg.detector_timeout_ms);
        let dctx = ctx.with_timeout(timeout);

        let bot_task = {
            let bot = self.bot.clone();
            tokio::spawn(async move { Ok::<_, FraudError>(bot.analyze(&features)) })
        };
        let collusion_task = {
            let (det, ctx, p) = (self.collusion.clone(), dctx.clone(), player.clone());
            tokio::spawn(async move { det.analyze_player(&ctx, &p) })
        };
        let multi_task = {
            let (det, ctx, p) = (self.multi_account.clone(), dctx.clone(), player.clone());
            tokio::spawn(async move { det.analyze(&ctx, &p, now).await })
        };
        let rule_task = {
            let (rules, state, stores, ctx, a) =
                (self.rules.clone(), self.state.clone(), self.stores.clone(), dctx.clone(), action.clone());
            tokio::spawn(async move {
                let data = gather_rule_data(&ctx, &state, &stores, &a, now).await?;
                Ok::<_, FraudError>(rules.candidates(&data, now))
            })
        };
        let risk_task = {
            let (risk, ctx, p, agent) = (self.risk.clone(), dctx.clone(), player.clone(), action.agent_id.clone());
            tokio::spawn(async move { risk.calculate_risk_score(&ctx, &p, &agent, now).await })
        };

        let (bot, collusion, multi, rule_alerts, cached_risk) = tokio::join!(
            guarded("bot", timeout, bot_task),
            guarded("collusion", timeout, collusion_task),
            guarded("multi_account", timeout, multi_task),
            guarded("rules", timeout, rule_task),
            guarded("risk", timeout, risk_task),
        );

        // ── Join ──────────────────────────────────────────────────────────────
        let mut failures = Vec::new();
        let mut settle = |name: &str, err: FraudError| {
            if is_timeout(&err) {
                self.stats.detector_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.detector_failures.fetch_add(1, Ordering::Relaxed);
            warn!(detector = name, player = %player, error = %err, "detector failed; continuing without it");
            failures.push(DetectorFailure { detector: name.to_string(), error: err.to_string() });
        };
        let bot = bot.map_err(|e| settle("bot", e)).ok();
        let collusion = collusion.map_err(|e| settle("collusion", e)).ok();
        let multi = multi.map_err(|e| settle("multi_account", e)).ok();
        let rule_candidates = rule_alerts.map_err(|e| settle("rules", e)).ok().unwrap_or_default();
        let history = cached_risk.map_err(|e| settle("risk", e)).ok().map(|r| r.history()).unwrap_or_default();

        // Cooldowns are claimed only after the join; a timed-out rules task holds none.
        let rule_alerts = self.rules.claim(rule_candidates, now);

        let signals = RiskSignals {
            bot: bot.as_ref().map(|b| b.score),
            collusion: collusion.as_ref().map(|c| c.ring_score),
            multi_account: multi.as_ref().map(|m| m.score),
        };
        self.risk.record_signals(&player, signals);
        let risk = self.risk.combine(&player, &action.agent_id, signals, history, now);

        let requires_action = signals.bot.map_or(false, |s| s >= svc_cfg.bot_high_risk)
            || collusion.as_ref().map_or(false, |c| c.score >= svc_cfg.collusion_high_risk)
            || signals.multi_account.map_or(false, |s| s >= svc_cfg.multi_account_high_risk)
            || rule_alerts.iter().any(|a| a.severity.is_severe())
            || risk.overall >= svc_cfg.overall_high_risk;

        // ── Decide ────────────────────────────────────────────────────────────
        let mut to_persist: Vec<AntiCheatAlert> = rule_alerts
            .iter()
            .cloned()
            .map(|mut a| {
                a.risk_breakdown.extend(risk.breakdown());
                a
            })
            .collect();
        let mut recommended = Vec::new();
        if requires_action {
            self.stats.flagged.fetch_add(1, Ordering::Relaxed);
            let mut detector_alerts = self.detector_alerts(&action, &risk, bot.as_ref(), collusion.as_ref(), multi.as_ref());
            let pair = collusion.as_ref().and_then(|c| c.best_pair.as_ref()).map(|p| p.pair.clone());
            if let Some(pair) = pair {
                if let Some(line) = self.pair_transfer_evidence(ctx, &pair, now).await {
                    for a in detector_alerts.iter_mut().filter(|a| a.source == "collusion_detector") {
                        a.evidence.push(line.clone());
                    }
                }
            }
            recommended = self.recommended_actions(&risk, bot.as_ref(), collusion.as_ref(), multi.as_ref(), &to_persist, &detector_alerts);
            to_persist.extend(detector_alerts);
        }

        let alerts = self.persist_and_publish(ctx, to_persist, &mut failures).await;

        let latency = started.elapsed();
        debug!(
            player = %player,
            overall = risk.overall,
            requires_action,
            alerts = alerts.len(),
            latency_us = latency.as_micros() as u64,
            "action processed"
        );

        Ok(FraudDetectionResult {
            player_id: player,
            agent_id: action.agent_id.clone(),
            club_id: action.club_id.clone(),
            table_id: action.table_id.clone(),
            hand_id: action.hand_id.clone(),
            bot,
            collusion,
            multi_account: multi,
            rule_alerts,
            overall_score: risk.overall,
            risk,
            requires_action,
            recommended_actions: recommended,
            alerts,
            failures,
            processed_at: now,
            latency_us: latency.as_micros() as u64,
        })
    }

    fn detector_alerts(
        &self,
        action: &PlayerAction,
        risk: &RiskScore,
        bot: Option<&BotDetectionResult>,
        collusion: Option<&PlayerCollusionResult>,
        multi: Option<&MultiAccountResult>,
    ) -> Vec<AntiCheatAlert> {
        let c = &self.cfg.service;
        let now = action.timestamp;
        let breakdown = risk.breakdown();
        let alert = |kind: AlertType, score: f64, source: &str, evidence: Vec<String>| {
            let mut a = AntiCheatAlert::new(&action.player_id, kind, Severity::from_score(score), score, source, now)
                .with_action(action)
                .with_evidence(evidence);
            a.risk_breakdown = breakdown.clone();
            a
        };
        let mut out = Vec::new();

        if let Some(b) = bot.filter(|b| b.score >= c.bot_high_risk) {
            let mut ev = b.reasons.clone();
            ev.push(format!("confidence {:.2}, methods {:?}", b.confidence, b.triggered_methods));
            out.push(alert(AlertType::Bot, b.score, "bot_detector", ev));
        }
        if let Some(col) = collusion.filter(|r| r.score >= c.collusion_high_risk) {
            let kind = match col.best_pair.as_ref().map(|p| p.collusion_type) {
                Some(CollusionType::ChipDumping) => AlertType::ChipDumping,
                _ => AlertType::Collusion,
            };
            let mut ev: Vec<String> = col
                .best_pair
                .iter()
                .flat_map(|p| {
                    std::iter::once(format!("pair {} type {} score {:.2}", p.pair, p.collusion_type, p.score))
                        .chain(p.evidence.iter().map(|e| format!("[{}] {}", e.severity, e.description)))
                })
                .collect();
            ev.extend(col.rings.iter().map(|r| {
                format!("ring of {} (density {:.2}, {} hands): {}", r.members.len(), r.density, r.total_hands, r.members.join(", "))
            }));
            out.push(alert(kind, col.score, "collusion_detector", ev));
        }
        if let Some(m) = multi.filter(|m| m.score >= c.multi_account_high_risk) {
            out.push(alert(AlertType::MultiAccount, m.score, "multi_account_detector", m.evidence.clone()));
        }
        if out.is_empty() && risk.overall >= c.overall_high_risk {
            let ev = vec![format!(
                "overall risk {:.2} (bot {:.2}, collusion {:.2}, multi-account {:.2}, {} alerts in 24h)",
                risk.overall, risk.bot_score, risk.collusion_score, risk.multi_account_score, risk.alerts_24h
            )];
            out.push(alert(AlertType::Fraud, risk.overall, "risk_scorer", ev));
        }
        out
    }

    /// Last week's chip movement inside the pair. Lookup failures only cost the line.
    async fn pair_transfer_evidence(&self, ctx: &Context, pair: &PairKey, now: DateTime<Utc>) -> Option<String> {
        let since = now - Duration::days(7);
        let transfers =
            match ctx.run(self.stores.transfers.transfers_between(pair.first(), pair.second(), since, now)).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(pair = %pair, error = %e, "pair transfer lookup failed");
                    return None;
                }
            };
        if transfers.is_empty() {
            return None;
        }
        let (forward, back) = transfers.iter().fold((0.0, 0.0), |(f, b), t| {
            if t.from_player == pair.first() {
                (f + t.amount, b)
            } else {
                (f, b + t.amount)
            }
        });
        Some(format!(
            "{} transfers in 7d: {:.0} chips {} -> {}, {:.0} back",
            transfers.len(),
            forward,
            pair.first(),
            pair.second(),
            back
        ))
    }

    fn recommended_actions(
        &self,
        risk: &RiskScore,
        bot: Option<&BotDetectionResult>,
        collusion: Option<&PlayerCollusionResult>,
        multi: Option<&MultiAccountResult>,
        rule_alerts: &[AntiCheatAlert],
        detector_alerts: &[AntiCheatAlert],
    ) -> Vec<RecommendedAction> {
        let c = &self.cfg.service;
        let mut out = Vec::new();
        let mut add = |a: RecommendedAction| {
            if !out.contains(&a) {
                out.push(a);
            }
        };
        let any_rule = |t: AlertType| rule_alerts.iter().any(|a| a.alert_type == t && a.severity.is_severe());

        if bot.map_or(false, |b| b.score >= c.bot_high_risk) || any_rule(AlertType::Bot) {
            add(RecommendedAction::CaptchaVerification);
        }
        if multi.map_or(false, |m| m.score >= c.multi_account_high_risk) || any_rule(AlertType::MultiAccount) {
            add(RecommendedAction::DeviceFingerprintVerification);
        }
        if let Some(col) = collusion.filter(|r| r.score >= c.collusion_high_risk) {
            add(RecommendedAction::TableSeparation);
            let dumping = col.best_pair.as_ref().map_or(false, |p| {
                matches!(p.collusion_type, CollusionType::ChipDumping | CollusionType::SqueezeRing)
            });
            if dumping {
                add(RecommendedAction::ChipTransferFreeze);
            }
        }
        if any_rule(AlertType::ChipDumping) {
            add(RecommendedAction::ChipTransferFreeze);
        }
        add(RecommendedAction::ManualReview);
        let critical = rule_alerts.iter().chain(detector_alerts).any(|a| a.severity == Severity::Critical);
        if critical && risk.overall >= c.overall_high_risk {
            add(RecommendedAction::AccountSuspension);
        }
        out
    }

    async fn persist_and_publish(
        &self,
        ctx: &Context,
        alerts: Vec<AntiCheatAlert>,
        failures: &mut Vec<DetectorFailure>,
    ) -> Vec<AntiCheatAlert> {
        let mut persisted = Vec::with_capacity(alerts.len());
        for alert in alerts {
            if let Err(e) = self.alerts.create_alert(&alert).await {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(alert = %alert.id, error = %e, "alert not persisted; skipping publish");
                failures.push(DetectorFailure { detector: "alert_storage".into(), error: e.to_string() });
                continue;
            }
            self.stats.alerts_persisted.fetch_add(1, Ordering::Relaxed);

            let published = if alert.severity.is_severe() {
                self.publisher.publish_sync(ctx, &alert).await.map(|_| {
                    self.stats.published_sync.fetch_add(1, Ordering::Relaxed);
                })
            } else {
                self.publisher.publish_async(&alert).map(|_| {
                    self.stats.queued_async.fetch_add(1, Ordering::Relaxed);
                })
            };
            if let Err(e) = published {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                failures.push(DetectorFailure { detector: "publisher".into(), error: e.to_string() });
            }
            persisted.push(alert);
        }
        persisted
    }

    // ── Side inputs ───────────────────────────────────────────────────────────

    pub fn record_interaction(&self, update: &EdgeUpdate) -> bool {
        self.collusion.record_interaction(update)
    }

    /// Feeds win-rate / showdown statistics and head-to-head counts between
    /// players who reached showdown in the same hand.
    pub fn record_hand_result(&self, result: &HandResult) {
        self.stats.hand_results.fetch_add(1, Ordering::Relaxed);
        self.state.record_hand_result(result);
        if !result.went_to_showdown {
            return;
        }
        let mut entry = self
            .showdowns
            .entry(result.hand_id.clone())
            .or_insert_with(|| Showdown { opened_at: result.timestamp, seen: Vec::new() });
        if entry.seen.iter().any(|(p, _)| p == &result.player_id) {
            return;
        }
        for (other, other_won) in &entry.seen {
            let (me_won, them_won) = (result.won, *other_won);
            self.collusion.record_interaction(&EdgeUpdate::new(&result.player_id, other).with(|e| {
                e.head_to_head = 1;
                e.wins_first = u64::from(me_won);
                e.wins_second = u64::from(them_won);
            }));
        }
        entry.seen.push((result.player_id.clone(), result.won));
    }

    /// Stores the login fingerprint and links the player to every account
    /// already seen on the same device, IP or network.
    pub async fn record_login(
        &self,
        ctx: &Context,
        player_id: &str,
        device: &DeviceAttributes,
        ip: Option<IpAddr>,
        at: DateTime<Utc>,
    ) -> Result<String> {
        self.stats.logins.fetch_add(1, Ordering::Relaxed);
        let fp = device.fingerprint();
        let db = &self.stores.fingerprints;

        let mut links: HashMap<String, EdgeUpdate> = HashMap::new();
        let mut link = |other: String, f: fn(&mut InteractionEdge)| {
            if other != player_id {
                let u = links.entry(other.clone()).or_insert_with(|| EdgeUpdate::new(player_id, &other));
                f(&mut u.delta);
            }
        };
        for other in ctx.run(db.accounts_with_fingerprint(&fp)).await? {
            link(other, |e| e.device_matches += 1);
        }
        if let Some(ip) = ip {
            for other in ctx.run(db.accounts_with_ip(ip)).await? {
                link(other, |e| e.ip_matches += 1);
            }
            for other in ctx.run(db.accounts_in_subnet(&subnet_of(ip))).await? {
                link(other, |e| e.subnet_matches += 1);
            }
        }

        let first_seen = ctx
            .run(db.fingerprint_history(player_id))
            .await?
            .iter()
            .filter(|h| h.fingerprint == fp)
            .map(|h| h.first_seen)
            .min()
            .unwrap_or(at);
        ctx.run(db.store_fingerprint(DeviceFingerprint {
            player_id: player_id.to_string(),
            fingerprint: fp.clone(),
            ip_address: ip,
            first_seen,
            last_seen: at,
        }))
        .await?;

        for update in links.values() {
            self.collusion.record_interaction(update);
        }
        if !links.is_empty() {
            info!(player = player_id, linked = links.len(), "login shares device or network with other accounts");
        }
        Ok(fp)
    }

    /// Records the session and links players already seated at the table.
    pub async fn start_session(&self, ctx: &Context, session: PlayerSession) -> Result<()> {
        let active = ctx.run(self.stores.sessions.active_sessions()).await?;
        for other in active.iter().filter(|s| s.table_id == session.table_id && s.player_id != session.player_id) {
            let synced = (other.connected_at - session.connected_at).num_seconds().abs() <= ARRIVAL_SYNC_SECS;
            self.collusion.record_interaction(&EdgeUpdate::new(&session.player_id, &other.player_id).with(|e| {
                e.sessions_together = 1;
                e.synced_arrivals = u64::from(synced);
            }));
        }
        ctx.run(self.stores.sessions.record_session(session)).await
    }

    pub async fn end_session(&self, ctx: &Context, session_id: &str, at: DateTime<Utc>, chips_out: f64) -> Result<()> {
        ctx.run(self.stores.sessions.end_session(session_id, at, chips_out)).await
    }

    pub async fn record_transfer(&self, ctx: &Context, transfer: ChipTransfer) -> Result<()> {
        self.stats.transfers.fetch_add(1, Ordering::Relaxed);
        let update = EdgeUpdate::new(&transfer.from_player, &transfer.to_player).with(|e| {
            e.chips_first_to_second = transfer.amount;
            e.transfers = 1;
            e.ev_loss = transfer.ev_impact;
        });
        ctx.run(self.stores.transfers.record_transfer(transfer)).await?;
        self.collusion.record_interaction(&update);
        Ok(())
    }

    // ── Background work ───────────────────────────────────────────────────────

    pub fn detect_rings(&self, ctx: &Context) -> Result<Vec<CollusionRing>> {
        self.collusion.detect_rings(ctx)
    }

    pub async fn ring_sweep_loop(self: Arc<Self>, ctx: Context, every: StdDuration) {
        loop {
            tokio::select! {
                _ = ctx.done() => return,
                _ = tokio::time::sleep(every) => {}
            }
            match self.detect_rings(&ctx) {
                Ok(rings) if !rings.is_empty() => {
                    info!(rings = rings.len(), largest = rings[0].members.len(), "collusion rings detected")
                }
                Ok(_) => {}
                Err(FraudError::Cancelled) => return,
                Err(e) => warn!(error = %e, "ring sweep failed"),
            }
        }
    }

    /// Expire windows, cooldowns, cached scores and stale showdown rosters.
    pub fn housekeeping(&self, now: DateTime<Utc>) {
        self.state.expire(now);
        let cooldowns = self.rules.purge_cooldowns(now);
        let cached = self.risk.purge_expired();
        let cutoff = now - Duration::hours(24);
        self.showdowns.retain(|_, s| s.opened_at >= cutoff);
        debug!(cooldowns, cached, "housekeeping");
    }

    pub async fn housekeeping_loop(self: Arc<Self>, ctx: Context, every: StdDuration) {
        loop {
            tokio::select! {
                _ = ctx.done() => return,
                _ = tokio::time::sleep(every) => self.housekeeping(Utc::now()),
            }
        }
    }

    pub fn stats(&self) -> ServiceStatsSnapshot {
        let s = &self.stats;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let (graph_nodes, graph_edges) = self.collusion.graph_size();
        ServiceStatsSnapshot {
            actions: load(&s.actions),
            flagged: load(&s.flagged),
            alerts_persisted: load(&s.alerts_persisted),
            persist_failures: load(&s.persist_failures),
            published_sync: load(&s.published_sync),
            queued_async: load(&s.queued_async),
            publish_failures: load(&s.publish_failures),
            detector_failures: load(&s.detector_failures),
            detector_timeouts: load(&s.detector_timeouts),
            hand_results: load(&s.hand_results),
            logins: load(&s.logins),
            transfers: load(&s.transfers),
            players: self.state.n_players(),
            graph_nodes,
            graph_edges,
            rings: self.collusion.rings().len(),
            risk_cache_hits: load(&self.risk.cache_hits),
            risk_computations: load(&self.risk.computations),
            publisher: self.publisher.stats(),
        }
    }
}

/// Rolling statistics plus store lookups the rule catalog needs.
pub async fn gather_rule_data(
    ctx: &Context,
    state: &StateStore,
    stores: &Stores,
    action: &PlayerAction,
    now: DateTime<Utc>,
) -> Result<RuleCheckData> {
    let player = action.player_id.as_str();
    let w = state.rule_snapshot(player, now);
    let day_ago = now - Duration::hours(24);

    let accounts_on_device = match &action.device_id {
        Some(fp) => ctx.run(stores.fingerprints.accounts_with_fingerprint(fp)).await?.len(),
        None => {
            let mut max = 0;
            let history = ctx.run(stores.fingerprints.fingerprint_history(player)).await?;
            if let Some(latest) = history.iter().max_by_key(|h| h.last_seen) {
                max = ctx.run(stores.fingerprints.accounts_with_fingerprint(&latest.fingerprint)).await?.len();
            }
            max
        }
    };
    let accounts_on_ip = match action.ip_address {
        Some(ip) => ctx.run(stores.fingerprints.accounts_with_ip(ip)).await?.len(),
        None => 0,
    };

    let longest_session_secs = ctx
        .run(stores.sessions.sessions_in_range(player, day_ago, now))
        .await?
        .iter()
        .map(|s| s.duration_secs(now))
        .max()
        .unwrap_or(0);

    let transfers = ctx.run(stores.transfers.transfers_for_player(player, day_ago, now)).await?;
    let outgoing: Vec<&ChipTransfer> = transfers.iter().filter(|t| t.from_player == player).collect();
    let incoming = transfers.iter().filter(|t| t.to_player == player).count() as u64;

    let alerts_24h = ctx.run(stores.alerts.count_alerts(player, day_ago)).await?;
    let alerts_30d = ctx.run(stores.alerts.count_alerts(player, now - Duration::days(30))).await?;

    Ok(RuleCheckData {
        player_id: player.to_string(),
        agent_id: action.agent_id.clone(),
        club_id: action.club_id.clone(),
        table_id: Some(action.table_id.clone()),
        hand_id: Some(action.hand_id.clone()),
        hands_24h: w.hands_24h,
        hands_7d: w.hands_7d,
        results_24h: w.results_24h,
        results_7d: w.results_7d,
        win_rate_24h: w.win_rate_24h,
        win_rate_7d: w.win_rate_7d,
        avg_decision_ms: w.avg_decision_ms,
        decision_stddev_ms: w.decision_stddev_ms,
        decisions: w.decisions,
        concurrent_tables: w.concurrent_tables,
        accounts_on_device,
        accounts_on_ip,
        longest_session_secs,
        outgoing_transfers: outgoing.len() as u64,
        incoming_transfers: incoming,
        outgoing_chips: outgoing.iter().map(|t| t.amount).sum(),
        alerts_24h,
        alerts_30d,
    })
}

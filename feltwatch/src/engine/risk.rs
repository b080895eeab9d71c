// feltwatch/src/engine/risk.rs
//
// Weighted risk aggregation with a short-TTL cache.
//
// Weight distribution (sum = 1.00):
//   Bot            0.30  latest bot-detector score
//   Collusion      0.25  max confidence across rings containing the player
//   MultiAccount   0.20  linked-account score
//   RuleViolation  0.15  alerts in the last 24h / cap
//   AlertHistory   0.10  0.6·recent + 0.4·30-day, each capped
//
// Missing signals contribute nothing; the overall score degrades instead of
// failing. Cache entries are keyed by (player, agent) and never served past
// their expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::RiskConfig;
use crate::context::Context;
use crate::error::Result;
use crate::store::AlertStorage;

/// Latest detector outputs for one player. `None` means "never observed".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskSignals {
    pub bot: Option<f64>,
    pub collusion: Option<f64>,
    pub multi_account: Option<f64>,
}

impl RiskSignals {
    /// Fills gaps in `self` from `older`.
    pub fn or(self, older: RiskSignals) -> RiskSignals {
        RiskSignals {
            bot: self.bot.or(older.bot),
            collusion: self.collusion.or(older.collusion),
            multi_account: self.multi_account.or(older.multi_account),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertHistory {
    pub alerts_24h: u64,
    pub alerts_7d: u64,
    pub alerts_30d: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    pub player_id: String,
    pub agent_id: String,
    pub overall: f64,
    pub bot_score: f64,
    pub collusion_score: f64,
    pub multi_account_score: f64,
    pub rule_violation_score: f64,
    pub alert_history_score: f64,
    pub computed_at: DateTime<Utc>,
    pub window_days: i64,
    pub alerts_24h: u64,
    pub alerts_7d: u64,
    pub alerts_30d: u64,
    pub review_recommended: bool,
}

impl RiskScore {
    pub fn history(&self) -> AlertHistory {
        AlertHistory { alerts_24h: self.alerts_24h, alerts_7d: self.alerts_7d, alerts_30d: self.alerts_30d }
    }

    pub fn breakdown(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("bot".to_string(), self.bot_score),
            ("collusion".to_string(), self.collusion_score),
            ("multi_account".to_string(), self.multi_account_score),
            ("rule_violation".to_string(), self.rule_violation_score),
            ("alert_history".to_string(), self.alert_history_score),
        ])
    }
}

struct CacheEntry {
    score: Arc<RiskScore>,
    expires: Instant,
}

pub struct RiskScorer {
    cfg: RiskConfig,
    alerts: Arc<dyn AlertStorage>,
    signals: DashMap<String, RiskSignals>,
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
    pub computations: AtomicU64,
    pub cache_hits: AtomicU64,
}

fn capped(value: f64, cap: f64) -> f64 {
    if cap <= 0.0 {
        return 0.0;
    }
    (value / cap).clamp(0.0, 1.0)
}

fn unit(v: Option<f64>) -> f64 {
    v.filter(|x| x.is_finite()).map(|x| x.clamp(0.0, 1.0)).unwrap_or(0.0)
}

impl RiskScorer {
    pub fn new(cfg: RiskConfig, alerts: Arc<dyn AlertStorage>) -> Self {
        Self {
            cfg,
            alerts,
            signals: DashMap::new(),
            cache: RwLock::new(HashMap::new()),
            computations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.cfg
    }

    /// Record the newest detector outputs; absent fields keep their old value.
    pub fn record_signals(&self, player_id: &str, signals: RiskSignals) {
        let mut entry = self.signals.entry(player_id.to_string()).or_default();
        *entry = signals.or(*entry);
    }

    pub fn signals(&self, player_id: &str) -> RiskSignals {
        self.signals.get(player_id).map(|s| *s).unwrap_or_default()
    }

    pub fn review_recommended(&self, overall: f64) -> bool {
        overall >= self.cfg.review_threshold
    }

    /// Alert counts over 24h, 7d and the configured window.
    pub async fn history(&self, ctx: &Context, player_id: &str, now: DateTime<Utc>) -> Result<AlertHistory> {
        let counts = async {
            let alerts_24h = self.alerts.count_alerts(player_id, now - Duration::hours(24)).await?;
            let alerts_7d = self.alerts.count_alerts(player_id, now - Duration::days(7)).await?;
            let alerts_30d = self.alerts.count_alerts(player_id, now - Duration::days(self.cfg.window_days)).await?;
            Ok::<_, crate::error::StoreError>(AlertHistory { alerts_24h, alerts_7d, alerts_30d })
        };
        tokio::select! {
            res = counts => Ok(res?),
            _ = ctx.done() => Err(ctx.reason()),
        }
    }

    /// Pure aggregation; no caching, no I/O.
    pub fn combine(
        &self,
        player_id: &str,
        agent_id: &str,
        signals: RiskSignals,
        history: AlertHistory,
        now: DateTime<Utc>,
    ) -> RiskScore {
        let w = &self.cfg.weights;
        let bot_score = unit(signals.bot);
        let collusion_score = unit(signals.collusion);
        let multi_account_score = unit(signals.multi_account);
        let rule_violation_score = capped(history.alerts_24h as f64, self.cfg.rule_violation_cap);
        let alert_history_score = 0.6 * capped(history.alerts_24h as f64, self.cfg.history_24h_cap)
            + 0.4 * capped(history.alerts_30d as f64, self.cfg.history_30d_cap);

        let overall = (bot_score * w.bot
            + collusion_score * w.collusion
            + multi_account_score * w.multi_account
            + rule_violation_score * w.rule_violation
            + alert_history_score * w.alert_history)
            .clamp(0.0, 1.0);

        RiskScore {
            player_id: player_id.to_string(),
            agent_id: agent_id.to_string(),
            overall,
            bot_score,
            collusion_score,
            multi_account_score,
            rule_violation_score,
            alert_history_score,
            computed_at: now,
            window_days: self.cfg.window_days,
            alerts_24h: history.alerts_24h,
            alerts_7d: history.alerts_7d,
            alerts_30d: history.alerts_30d,
            review_recommended: self.review_recommended(overall),
        }
    }

    fn cached(&self, key: &(String, String)) -> Option<Arc<RiskScore>> {
        let cache = self.cache.read();
        cache.get(key).filter(|e| Instant::now() < e.expires).map(|e| e.score.clone())
    }

    pub async fn calculate_risk_score(
        &self,
        ctx: &Context,
        player_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Arc<RiskScore>> {
        let key = (player_id.to_string(), agent_id.to_string());
        if let Some(hit) = self.cached(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        ctx.check()?;

        let history = self.history(ctx, player_id, now).await?;
        let score = Arc::new(self.combine(player_id, agent_id, self.signals(player_id), history, now));
        self.computations.fetch_add(1, Ordering::Relaxed);

        let expires = Instant::now() + StdDuration::from_secs(self.cfg.cache_ttl_secs);
        self.cache.write().insert(key, CacheEntry { score: score.clone(), expires });
        debug!(player = player_id, overall = score.overall, "risk score computed");
        Ok(score)
    }

    /// Drop the cached score so the next lookup recomputes.
    pub fn invalidate(&self, player_id: &str) {
        self.cache.write().retain(|(p, _), _| p != player_id);
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, e| now < e.expires);
        before - cache.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AlertType, AntiCheatAlert, Severity};
    use crate::store::memory::MemoryAlertStorage;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn scorer() -> (Arc<MemoryAlertStorage>, RiskScorer) {
        let store = Arc::new(MemoryAlertStorage::new());
        let s = RiskScorer::new(RiskConfig::default(), store.clone());
        (store, s)
    }

    #[test]
    fn combine_applies_weights() {
        let (_, s) = scorer();
        let sig = RiskSignals { bot: Some(1.0), collusion: Some(1.0), multi_account: Some(1.0) };
        let r = s.combine("p", "a", sig, AlertHistory::default(), now());
        assert!((r.overall - 0.75).abs() < 1e-9);
        assert!(r.review_recommended);

        let hist = AlertHistory { alerts_24h: 5, alerts_7d: 5, alerts_30d: 20 };
        let r = s.combine("p", "a", sig, hist, now());
        assert!((r.overall - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_signals_degrade_not_fail() {
        let (_, s) = scorer();
        let r = s.combine("p", "a", RiskSignals { bot: Some(0.9), ..Default::default() }, AlertHistory::default(), now());
        assert!((r.overall - 0.27).abs() < 1e-9);
        assert_eq!(r.collusion_score, 0.0);
        assert!(!r.review_recommended);
    }

    #[test]
    fn newer_signals_keep_older_fields() {
        let (_, s) = scorer();
        s.record_signals("p", RiskSignals { bot: Some(0.4), collusion: Some(0.2), multi_account: None });
        s.record_signals("p", RiskSignals { bot: Some(0.9), ..Default::default() });
        assert_eq!(s.signals("p"), RiskSignals { bot: Some(0.9), collusion: Some(0.2), multi_account: None });
    }

    #[tokio::test(start_paused = true)]
    async fn cache_serves_until_ttl_then_recomputes() {
        let (_, s) = scorer();
        let ctx = Context::background();
        s.record_signals("p", RiskSignals { bot: Some(1.0), ..Default::default() });

        let first = s.calculate_risk_score(&ctx, "p", "agent", now()).await.unwrap();
        s.record_signals("p", RiskSignals { bot: Some(0.0), ..Default::default() });

        tokio::time::advance(StdDuration::from_secs(299)).await;
        let second = s.calculate_risk_score(&ctx, "p", "agent", now()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(s.computations.load(Ordering::Relaxed), 1);

        tokio::time::advance(StdDuration::from_secs(2)).await;
        let third = s.calculate_risk_score(&ctx, "p", "agent", now()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.bot_score, 0.0);
        assert_eq!(s.computations.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_is_keyed_by_agent_too() {
        let (_, s) = scorer();
        let ctx = Context::background();
        s.calculate_risk_score(&ctx, "p", "a1", now()).await.unwrap();
        s.calculate_risk_score(&ctx, "p", "a2", now()).await.unwrap();
        assert_eq!(s.computations.load(Ordering::Relaxed), 2);
        tokio::time::advance(StdDuration::from_secs(400)).await;
        assert_eq!(s.purge_expired(), 2);
    }

    #[tokio::test]
    async fn history_counts_alert_windows() {
        let (store, s) = scorer();
        for hours in [1, 30, 24 * 10] {
            let a = AntiCheatAlert::new("p", AlertType::Bot, Severity::High, 0.8, "test", now() - Duration::hours(hours));
            store.create_alert(&a).await.unwrap();
        }
        let h = s.history(&Context::background(), "p", now()).await.unwrap();
        assert_eq!(h, AlertHistory { alerts_24h: 1, alerts_7d: 2, alerts_30d: 3 });
    }

    #[tokio::test]
    async fn store_outage_surfaces() {
        let (store, s) = scorer();
        store.outage.set(true);
        assert!(s.calculate_risk_score(&Context::background(), "p", "a", now()).await.is_err());
        assert_eq!(s.cache_len(), 0);
    }
}

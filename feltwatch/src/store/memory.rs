// feltwatch/src/store/memory.rs
//
// In-process store implementations.
// DashMap reverse indexes (fingerprint → players, ip → players, subnet →
// players) mirror how the durable stores are expected to be indexed.
// Each store carries an `Outage` switch so tests can simulate backend loss.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{
    subnet_of, AlertQuery, AlertStats, AlertStorage, FingerprintDatabase, SessionStore, StoreResult,
    TransferDatabase,
};
use crate::error::StoreError;
use crate::events::{AlertStatus, AntiCheatAlert, ChipTransfer, DeviceFingerprint, PlayerSession};

/// Simulated backend outage.
#[derive(Debug, Default)]
pub struct Outage(AtomicBool);

impl Outage {
    pub fn set(&self, down: bool) {
        self.0.store(down, Ordering::Relaxed);
    }

    fn check(&self, store: &str) -> StoreResult<()> {
        if self.0.load(Ordering::Relaxed) {
            return Err(StoreError::Backend(format!("{store} unavailable")));
        }
        Ok(())
    }
}

fn sorted(set: Option<HashSet<String>>) -> Vec<String> {
    let mut v: Vec<String> = set.unwrap_or_default().into_iter().collect();
    v.sort();
    v
}

// ── Fingerprints ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryFingerprintDb {
    history: DashMap<String, Vec<DeviceFingerprint>>,
    by_fingerprint: DashMap<String, HashSet<String>>,
    by_ip: DashMap<IpAddr, HashSet<String>>,
    by_subnet: DashMap<String, HashSet<String>>,
    pub outage: Outage,
}

impl MemoryFingerprintDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintDatabase for MemoryFingerprintDb {
    async fn store_fingerprint(&self, record: DeviceFingerprint) -> StoreResult<()> {
        self.outage.check("fingerprint db")?;
        self.by_fingerprint
            .entry(record.fingerprint.clone())
            .or_default()
            .insert(record.player_id.clone());
        if let Some(ip) = record.ip_address {
            self.by_ip.entry(ip).or_default().insert(record.player_id.clone());
            self.by_subnet.entry(subnet_of(ip)).or_default().insert(record.player_id.clone());
        }
        self.history.entry(record.player_id.clone()).or_default().push(record);
        Ok(())
    }

    async fn accounts_with_fingerprint(&self, fingerprint: &str) -> StoreResult<Vec<String>> {
        self.outage.check("fingerprint db")?;
        Ok(sorted(self.by_fingerprint.get(fingerprint).map(|s| s.clone())))
    }

    async fn accounts_with_ip(&self, ip: IpAddr) -> StoreResult<Vec<String>> {
        self.outage.check("fingerprint db")?;
        Ok(sorted(self.by_ip.get(&ip).map(|s| s.clone())))
    }

    async fn accounts_in_subnet(&self, subnet: &str) -> StoreResult<Vec<String>> {
        self.outage.check("fingerprint db")?;
        Ok(sorted(self.by_subnet.get(subnet).map(|s| s.clone())))
    }

    async fn fingerprint_history(&self, player_id: &str) -> StoreResult<Vec<DeviceFingerprint>> {
        self.outage.check("fingerprint db")?;
        Ok(self.history.get(player_id).map(|h| h.clone()).unwrap_or_default())
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySessionStore {
    by_player: DashMap<String, Vec<PlayerSession>>,
    owner: DashMap<String, String>, // session_id → player_id
    pub outage: Outage,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn record_session(&self, session: PlayerSession) -> StoreResult<()> {
        self.outage.check("session store")?;
        if self.owner.contains_key(&session.session_id) {
            return Err(StoreError::Conflict(format!("session {} exists", session.session_id)));
        }
        self.owner.insert(session.session_id.clone(), session.player_id.clone());
        self.by_player.entry(session.player_id.clone()).or_default().push(session);
        Ok(())
    }

    async fn end_session(&self, session_id: &str, at: DateTime<Utc>, chips_out: f64) -> StoreResult<()> {
        self.outage.check("session store")?;
        let player = self
            .owner
            .get(session_id)
            .map(|p| p.clone())
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        let mut sessions = self
            .by_player
            .get_mut(&player)
            .ok_or_else(|| StoreError::NotFound(format!("sessions for {player}")))?;
        let session = sessions
            .iter_mut()
            .find(|s| s.session_id == session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        if session.disconnected_at.is_some() {
            return Err(StoreError::Conflict(format!("session {session_id} already ended")));
        }
        session.disconnected_at = Some(at.max(session.connected_at));
        session.chips_out = chips_out;
        Ok(())
    }

    async fn sessions_in_range(
        &self,
        player_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<PlayerSession>> {
        self.outage.check("session store")?;
        Ok(self
            .by_player
            .get(player_id)
            .map(|ss| {
                ss.iter()
                    .filter(|s| s.connected_at <= to && s.disconnected_at.map_or(true, |d| d >= from))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn all_player_ids(&self) -> StoreResult<Vec<String>> {
        self.outage.check("session store")?;
        let mut ids: Vec<String> = self.by_player.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn active_sessions(&self) -> StoreResult<Vec<PlayerSession>> {
        self.outage.check("session store")?;
        Ok(self
            .by_player
            .iter()
            .flat_map(|e| e.value().iter().filter(|s| s.disconnected_at.is_none()).cloned().collect::<Vec<_>>())
            .collect())
    }
}

// ── Transfers ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryTransferDb {
    transfers: RwLock<Vec<ChipTransfer>>,
    pub outage: Outage,
}

impl MemoryTransferDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferDatabase for MemoryTransferDb {
    async fn record_transfer(&self, transfer: ChipTransfer) -> StoreResult<()> {
        self.outage.check("transfer db")?;
        self.transfers.write().push(transfer);
        Ok(())
    }

    async fn transfers_for_player(
        &self,
        player_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ChipTransfer>> {
        self.outage.check("transfer db")?;
        Ok(self
            .transfers
            .read()
            .iter()
            .filter(|t| (t.from_player == player_id || t.to_player == player_id) && t.timestamp >= from && t.timestamp <= to)
            .cloned()
            .collect())
    }

    async fn transfers_between(
        &self,
        a: &str,
        b: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ChipTransfer>> {
        self.outage.check("transfer db")?;
        Ok(self
            .transfers
            .read()
            .iter()
            .filter(|t| {
                ((t.from_player == a && t.to_player == b) || (t.from_player == b && t.to_player == a))
                    && t.timestamp >= from
                    && t.timestamp <= to
            })
            .cloned()
            .collect())
    }
}

// ── Alerts ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryAlertStorage {
    alerts: RwLock<HashMap<String, AntiCheatAlert>>,
    pub outage: Outage,
}

impl MemoryAlertStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }
}

#[async_trait]
impl AlertStorage for MemoryAlertStorage {
    async fn create_alert(&self, alert: &AntiCheatAlert) -> StoreResult<()> {
        self.outage.check("alert storage")?;
        let mut alerts = self.alerts.write();
        if alerts.contains_key(&alert.id) {
            return Err(StoreError::Conflict(format!("alert {} exists", alert.id)));
        }
        alerts.insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn update_alert(&self, alert: &AntiCheatAlert) -> StoreResult<()> {
        self.outage.check("alert storage")?;
        let mut alerts = self.alerts.write();
        match alerts.get_mut(&alert.id) {
            Some(slot) => {
                *slot = alert.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("alert {}", alert.id))),
        }
    }

    async fn get_alert(&self, id: &str) -> StoreResult<Option<AntiCheatAlert>> {
        self.outage.check("alert storage")?;
        Ok(self.alerts.read().get(id).cloned())
    }

    async fn query_alerts(&self, query: &AlertQuery) -> StoreResult<Vec<AntiCheatAlert>> {
        self.outage.check("alert storage")?;
        let mut hits: Vec<AntiCheatAlert> =
            self.alerts.read().values().filter(|a| query.matches(a)).cloned().collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    async fn bulk_update_status(
        &self,
        ids: &[String],
        status: AlertStatus,
        reviewer: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.outage.check("alert storage")?;
        let mut alerts = self.alerts.write();
        let mut updated = 0;
        for id in ids {
            if let Some(alert) = alerts.get_mut(id) {
                if alert.status.can_transition_to(status) {
                    alert.status = status;
                    alert.reviewed_at = Some(at);
                    alert.reviewed_by = Some(reviewer.to_string());
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn count_alerts(&self, player_id: &str, since: DateTime<Utc>) -> StoreResult<u64> {
        self.outage.check("alert storage")?;
        Ok(self
            .alerts
            .read()
            .values()
            .filter(|a| a.player_id == player_id && a.created_at >= since)
            .count() as u64)
    }

    async fn stats(&self, since: DateTime<Utc>) -> StoreResult<AlertStats> {
        self.outage.check("alert storage")?;
        let mut stats = AlertStats::default();
        for a in self.alerts.read().values().filter(|a| a.created_at >= since) {
            stats.total += 1;
            *stats.by_type.entry(a.alert_type.to_string()).or_default() += 1;
            *stats.by_severity.entry(a.severity.to_string()).or_default() += 1;
            *stats.by_status.entry(a.status.to_string()).or_default() += 1;
        }
        Ok(stats)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.outage.check("alert storage")?;
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|_, a| a.created_at >= cutoff);
        Ok(before - alerts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AlertType, Severity};
    use chrono::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn fingerprint_indexes_cover_ip_and_subnet() {
        let db = MemoryFingerprintDb::new();
        for (player, ip) in [("a", "10.0.0.1"), ("b", "10.0.0.2"), ("c", "10.0.0.1")] {
            db.store_fingerprint(DeviceFingerprint {
                player_id: player.into(),
                fingerprint: "fp1".into(),
                ip_address: Some(ip.parse().unwrap()),
                first_seen: ts(0),
                last_seen: ts(0),
            })
            .await
            .unwrap();
        }
        assert_eq!(db.accounts_with_fingerprint("fp1").await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(db.accounts_with_ip("10.0.0.1".parse().unwrap()).await.unwrap(), vec!["a", "c"]);
        assert_eq!(db.accounts_in_subnet("10.0.0.0/24").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn ending_a_session_twice_conflicts() {
        let store = MemorySessionStore::new();
        store
            .record_session(PlayerSession {
                session_id: "s1".into(),
                player_id: "a".into(),
                table_id: "t".into(),
                connected_at: ts(0),
                disconnected_at: None,
                chips_in: 100.0,
                chips_out: 0.0,
            })
            .await
            .unwrap();
        assert_eq!(store.active_sessions().await.unwrap().len(), 1);
        store.end_session("s1", ts(60), 80.0).await.unwrap();
        assert!(store.active_sessions().await.unwrap().is_empty());
        assert!(matches!(store.end_session("s1", ts(90), 0.0).await, Err(StoreError::Conflict(_))));
        assert!(matches!(store.end_session("nope", ts(90), 0.0).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn pair_transfers_match_both_directions_only() {
        let db = MemoryTransferDb::new();
        for (from, to, at) in [("a", "b", 0), ("b", "a", 60), ("a", "c", 90), ("a", "b", 7200)] {
            db.record_transfer(ChipTransfer {
                from_player: from.into(),
                to_player: to.into(),
                table_id: "t".into(),
                hand_id: format!("h{at}"),
                amount: 10.0,
                ev_impact: 0.0,
                context: String::new(),
                timestamp: ts(at),
            })
            .await
            .unwrap();
        }
        let pair = db.transfers_between("b", "a", ts(0), ts(3600)).await.unwrap();
        assert_eq!(pair.len(), 2);
        assert!(pair.iter().all(|t| t.to_player != "c"));
        assert_eq!(db.transfers_for_player("a", ts(0), ts(3600)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn retention_sweep_and_bulk_review() {
        let storage = MemoryAlertStorage::new();
        let old = AntiCheatAlert::new("p", AlertType::Bot, Severity::Low, 0.3, "t", ts(0));
        let new = AntiCheatAlert::new("p", AlertType::Bot, Severity::High, 0.8, "t", ts(3600));
        storage.create_alert(&old).await.unwrap();
        storage.create_alert(&new).await.unwrap();

        let n = storage
            .bulk_update_status(&[new.id.clone(), new.id.clone()], AlertStatus::Confirmed, "rev", ts(4000))
            .await
            .unwrap();
        assert_eq!(n, 1);

        assert_eq!(storage.delete_before(ts(0) + Duration::seconds(10)).await.unwrap(), 1);
        let left = storage.query_alerts(&AlertQuery::for_player("p")).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status, AlertStatus::Confirmed);
    }

    #[tokio::test]
    async fn outage_surfaces_backend_error() {
        let storage = MemoryAlertStorage::new();
        storage.outage.set(true);
        let alert = AntiCheatAlert::new("p", AlertType::Bot, Severity::Low, 0.3, "t", ts(0));
        assert!(matches!(storage.create_alert(&alert).await, Err(StoreError::Backend(_))));
    }
}

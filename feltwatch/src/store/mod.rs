// feltwatch/src/store/mod.rs
//
// Contracts Feltwatch requires from the external storage services.
// Production deployments back these with durable databases; `memory`
// provides in-process implementations for the CLI harness and tests.

pub mod memory;

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::events::{
    AlertStatus, AlertType, AntiCheatAlert, ChipTransfer, DeviceFingerprint, PlayerSession, Severity,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Network prefix used for "same network" linking: /24 for IPv4, /48 for IPv6.
pub fn subnet_of(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.0/24", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return subnet_of(IpAddr::V4(v4));
            }
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}::/48", s[0], s[1], s[2])
        }
    }
}

#[async_trait]
pub trait FingerprintDatabase: Send + Sync {
    /// Append a login/connect record. History is never rewritten.
    async fn store_fingerprint(&self, record: DeviceFingerprint) -> StoreResult<()>;
    async fn accounts_with_fingerprint(&self, fingerprint: &str) -> StoreResult<Vec<String>>;
    async fn accounts_with_ip(&self, ip: IpAddr) -> StoreResult<Vec<String>>;
    async fn accounts_in_subnet(&self, subnet: &str) -> StoreResult<Vec<String>>;
    async fn fingerprint_history(&self, player_id: &str) -> StoreResult<Vec<DeviceFingerprint>>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn record_session(&self, session: PlayerSession) -> StoreResult<()>;
    async fn end_session(&self, session_id: &str, at: DateTime<Utc>, chips_out: f64) -> StoreResult<()>;
    /// Sessions intersecting [from, to]; open sessions included.
    async fn sessions_in_range(
        &self,
        player_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<PlayerSession>>;
    async fn all_player_ids(&self) -> StoreResult<Vec<String>>;
    async fn active_sessions(&self) -> StoreResult<Vec<PlayerSession>>;
}

#[async_trait]
pub trait TransferDatabase: Send + Sync {
    async fn record_transfer(&self, transfer: ChipTransfer) -> StoreResult<()>;
    /// Transfers where the player is sender or receiver.
    async fn transfers_for_player(
        &self,
        player_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ChipTransfer>>;
    /// Transfers in either direction between the pair.
    async fn transfers_between(
        &self,
        a: &str,
        b: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ChipTransfer>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertQuery {
    pub player_id: Option<String>,
    pub alert_type: Option<AlertType>,
    pub severity: Option<Severity>,
    pub status: Option<AlertStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AlertQuery {
    pub fn for_player(player_id: &str) -> Self {
        Self { player_id: Some(player_id.to_string()), ..Default::default() }
    }

    pub fn since(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn matches(&self, alert: &AntiCheatAlert) -> bool {
        self.player_id.as_deref().map_or(true, |p| alert.player_id == p)
            && self.alert_type.map_or(true, |t| alert.alert_type == t)
            && self.severity.map_or(true, |s| alert.severity == s)
            && self.status.map_or(true, |s| alert.status == s)
            && self.from.map_or(true, |f| alert.created_at >= f)
            && self.to.map_or(true, |t| alert.created_at <= t)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total: u64,
    pub by_type: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    pub by_status: HashMap<String, u64>,
}

#[async_trait]
pub trait AlertStorage: Send + Sync {
    async fn create_alert(&self, alert: &AntiCheatAlert) -> StoreResult<()>;
    async fn update_alert(&self, alert: &AntiCheatAlert) -> StoreResult<()>;
    async fn get_alert(&self, id: &str) -> StoreResult<Option<AntiCheatAlert>>;
    /// Newest first.
    async fn query_alerts(&self, query: &AlertQuery) -> StoreResult<Vec<AntiCheatAlert>>;
    /// Moves the listed alerts that are still `pending` to `status`.
    /// Returns how many were updated.
    async fn bulk_update_status(
        &self,
        ids: &[String],
        status: AlertStatus,
        reviewer: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<usize>;
    async fn count_alerts(&self, player_id: &str, since: DateTime<Utc>) -> StoreResult<u64>;
    async fn stats(&self, since: DateTime<Utc>) -> StoreResult<AlertStats>;
    /// Retention sweep. Returns how many alerts were removed.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_prefixes() {
        assert_eq!(subnet_of("10.1.2.3".parse().unwrap()), "10.1.2.0/24");
        assert_eq!(subnet_of("::ffff:10.1.2.3".parse().unwrap()), "10.1.2.0/24");
        assert_eq!(subnet_of("2001:db8:aa::1".parse().unwrap()), "2001:db8:aa::/48");
    }
}

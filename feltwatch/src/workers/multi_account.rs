// feltwatch/src/workers/multi_account.rs
//
// Multi-account linker.
//
// Links accounts through four kinds of connection:
//   device      same device fingerprint         similarity 1.0
//   ip          same IP address                 similarity 0.8
//   network     same /24 (v4) or /48 (v6)       similarity 0.5
//   behavioral  session-time overlap            similarity = overlap ratio
//
// Overlap is asymmetric: intersection of the two players' online time
// divided by THIS player's online time over the lookback window.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MultiAccountConfig;
use crate::context::Context;
use crate::error::Result;
use crate::events::{PlayerSession, Verdict};
use crate::store::{subnet_of, FingerprintDatabase, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Device,
    Ip,
    Network,
    Behavioral,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Ip => write!(f, "ip"),
            Self::Network => write!(f, "network"),
            Self::Behavioral => write!(f, "behavioral"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedAccount {
    pub player_id: String,
    pub connection_type: ConnectionType,
    pub similarity: f64,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiAccountResult {
    pub player_id: String,
    pub score: f64,
    pub action: Verdict,
    /// Strongest link first.
    pub related_accounts: Vec<RelatedAccount>,
    pub evidence: Vec<String>,
    /// Accounts (this one included) on the most-shared fingerprint / IP.
    pub max_accounts_per_device: usize,
    pub max_accounts_per_ip: usize,
    /// Known players left out of the overlap scan by `max_overlap_candidates`.
    pub overlap_candidates_skipped: usize,
}

/// Union of half-open [start, end) intervals in epoch seconds.
fn merge_intervals(mut iv: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    iv.retain(|(s, e)| e > s);
    iv.sort_unstable();
    let mut out: Vec<(i64, i64)> = Vec::with_capacity(iv.len());
    for (s, e) in iv {
        match out.last_mut() {
            Some(last) if s <= last.1 => last.1 = last.1.max(e),
            _ => out.push((s, e)),
        }
    }
    out
}

fn total(iv: &[(i64, i64)]) -> i64 {
    iv.iter().map(|(s, e)| e - s).sum()
}

fn intersection(a: &[(i64, i64)], b: &[(i64, i64)]) -> i64 {
    let (mut i, mut j, mut acc) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        let lo = a[i].0.max(b[j].0);
        let hi = a[i].1.min(b[j].1);
        if hi > lo {
            acc += hi - lo;
        }
        if a[i].1 < b[j].1 {
            i += 1;
        } else {
            j += 1;
        }
    }
    acc
}

fn online(sessions: &[PlayerSession], from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<(i64, i64)> {
    merge_intervals(
        sessions
            .iter()
            .map(|s| (s.connected_at.max(from).timestamp(), s.end_or(to).min(to).timestamp()))
            .collect(),
    )
}

/// Fraction of `own` online time during which `other` was also online.
pub fn session_overlap(own: &[PlayerSession], other: &[PlayerSession], from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let mine = online(own, from, to);
    let denom = total(&mine);
    if denom <= 0 {
        return 0.0;
    }
    intersection(&mine, &online(other, from, to)) as f64 / denom as f64
}

pub struct MultiAccountDetector {
    cfg: MultiAccountConfig,
    fingerprints: Arc<dyn FingerprintDatabase>,
    sessions: Arc<dyn SessionStore>,
}

impl MultiAccountDetector {
    pub fn new(cfg: MultiAccountConfig, fingerprints: Arc<dyn FingerprintDatabase>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { cfg, fingerprints, sessions }
    }

    fn weight(&self, t: ConnectionType) -> f64 {
        match t {
            ConnectionType::Device => self.cfg.device_weight,
            ConnectionType::Ip => self.cfg.ip_weight,
            ConnectionType::Network => self.cfg.network_weight,
            ConnectionType::Behavioral => self.cfg.behavioral_weight,
        }
    }

    pub async fn analyze(&self, ctx: &Context, player_id: &str, now: DateTime<Utc>) -> Result<MultiAccountResult> {
        let c = &self.cfg;
        let mut links: HashMap<String, RelatedAccount> = HashMap::new();
        // Keep only the strongest link per account.
        let keep = |r: RelatedAccount, links: &mut HashMap<String, RelatedAccount>| {
            let w = self.weight(r.connection_type);
            let weaker = links
                .get(&r.player_id)
                .map_or(true, |cur| cur.similarity * self.weight(cur.connection_type) < r.similarity * w);
            if weaker {
                links.insert(r.player_id.clone(), r);
            }
        };

        // ── Device / IP / subnet ─────────────────────────────────────────────
        let history = self.fingerprints.fingerprint_history(player_id).await?;
        let fps: BTreeSet<String> = history.iter().map(|h| h.fingerprint.clone()).collect();
        let ips: BTreeSet<_> = history.iter().filter_map(|h| h.ip_address).collect();
        let subnets: BTreeSet<String> = ips.iter().map(|ip| subnet_of(*ip)).collect();

        let mut max_per_device = 0;
        for fp in &fps {
            ctx.check()?;
            let accounts = self.fingerprints.accounts_with_fingerprint(fp).await?;
            max_per_device = max_per_device.max(accounts.len());
            for other in accounts.into_iter().filter(|a| a != player_id) {
                keep(
                    RelatedAccount {
                        player_id: other,
                        connection_type: ConnectionType::Device,
                        similarity: c.device_similarity,
                        detail: format!("shared device {}", fp.chars().take(12).collect::<String>()),
                    },
                    &mut links,
                );
            }
        }
        let mut max_per_ip = 0;
        for ip in &ips {
            ctx.check()?;
            let accounts = self.fingerprints.accounts_with_ip(*ip).await?;
            max_per_ip = max_per_ip.max(accounts.len());
            for other in accounts.into_iter().filter(|a| a != player_id) {
                keep(
                    RelatedAccount {
                        player_id: other,
                        connection_type: ConnectionType::Ip,
                        similarity: c.ip_similarity,
                        detail: format!("shared ip {ip}"),
                    },
                    &mut links,
                );
            }
        }
        for subnet in &subnets {
            ctx.check()?;
            for other in self.fingerprints.accounts_in_subnet(subnet).await?.into_iter().filter(|a| a != player_id) {
                keep(
                    RelatedAccount {
                        player_id: other,
                        connection_type: ConnectionType::Network,
                        similarity: c.subnet_similarity,
                        detail: format!("shared network {subnet}"),
                    },
                    &mut links,
                );
            }
        }

        // ── Session overlap ───────────────────────────────────────────────────
        let from = now - Duration::days(c.lookback_days);
        let own = self.sessions.sessions_in_range(player_id, from, now).await?;
        let mut skipped = 0;
        if !own.is_empty() {
            let candidates: Vec<String> =
                self.sessions.all_player_ids().await?.into_iter().filter(|p| p != player_id).collect();
            if candidates.len() > c.max_overlap_candidates {
                skipped = candidates.len() - c.max_overlap_candidates;
                warn!(
                    player = player_id,
                    scanned = c.max_overlap_candidates,
                    skipped,
                    "session-overlap scan capped"
                );
            }
            for (i, other) in candidates.iter().take(c.max_overlap_candidates).enumerate() {
                if i % 128 == 0 {
                    ctx.check()?;
                }
                let theirs = self.sessions.sessions_in_range(other, from, now).await?;
                if theirs.is_empty() {
                    continue;
                }
                let overlap = session_overlap(&own, &theirs, from, now);
                if overlap >= c.min_session_overlap {
                    keep(
                        RelatedAccount {
                            player_id: other.clone(),
                            connection_type: ConnectionType::Behavioral,
                            similarity: overlap.min(1.0),
                            detail: format!("online together {:.0}% of sessions", overlap * 100.0),
                        },
                        &mut links,
                    );
                }
            }
        }

        let mut related: Vec<RelatedAccount> = links.into_values().collect();
        related.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then_with(|| a.player_id.cmp(&b.player_id)));

        let score = related.iter().map(|r| r.similarity * self.weight(r.connection_type)).sum::<f64>().min(1.0);
        let action = Verdict::from_thresholds(score, c.flag_threshold, c.review_threshold);
        let evidence = related
            .iter()
            .map(|r| format!("{} via {} ({:.2}): {}", r.player_id, r.connection_type, r.similarity, r.detail))
            .collect();
        debug!(player = player_id, related = related.len(), score, "multi-account analysis");

        Ok(MultiAccountResult {
            player_id: player_id.to_string(),
            score,
            action,
            related_accounts: related,
            evidence,
            max_accounts_per_device: max_per_device,
            max_accounts_per_ip: max_per_ip,
            overlap_candidates_skipped: skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeviceFingerprint;
    use crate::store::memory::{MemoryFingerprintDb, MemorySessionStore};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn session(id: &str, player: &str, start: i64, end: i64) -> PlayerSession {
        PlayerSession {
            session_id: id.into(),
            player_id: player.into(),
            table_id: "t".into(),
            connected_at: ts(start),
            disconnected_at: Some(ts(end)),
            chips_in: 0.0,
            chips_out: 0.0,
        }
    }

    #[test]
    fn overlap_is_asymmetric() {
        let a = vec![session("a1", "a", 0, 100)];
        let b = vec![session("b1", "b", 50, 250)];
        let (from, to) = (ts(-1000), ts(1000));
        assert!((session_overlap(&a, &b, from, to) - 0.5).abs() < 1e-9);
        assert!((session_overlap(&b, &a, from, to) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn own_overlapping_sessions_count_once() {
        let a = vec![session("a1", "a", 0, 100), session("a2", "a", 50, 100)];
        let b = vec![session("b1", "b", 0, 100)];
        assert!((session_overlap(&a, &b, ts(-10), ts(1000)) - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn device_link_outranks_ip_link() {
        let fps = Arc::new(MemoryFingerprintDb::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let rec = |p: &str, fp: &str, ip: &str| DeviceFingerprint {
            player_id: p.into(),
            fingerprint: fp.into(),
            ip_address: Some(ip.parse().unwrap()),
            first_seen: ts(0),
            last_seen: ts(0),
        };
        fps.store_fingerprint(rec("main", "fpA", "10.0.0.1")).await.unwrap();
        fps.store_fingerprint(rec("alt", "fpA", "10.0.0.1")).await.unwrap();
        fps.store_fingerprint(rec("flatmate", "fpB", "10.0.0.1")).await.unwrap();
        fps.store_fingerprint(rec("neighbor", "fpC", "10.0.0.77")).await.unwrap();

        let d = MultiAccountDetector::new(MultiAccountConfig::default(), fps, sessions);
        let r = d.analyze(&Context::background(), "main", ts(10)).await.unwrap();

        let names: Vec<&str> = r.related_accounts.iter().map(|a| a.player_id.as_str()).collect();
        assert_eq!(names, vec!["alt", "flatmate", "neighbor"]);
        assert_eq!(r.related_accounts[0].connection_type, ConnectionType::Device);
        assert_eq!(r.related_accounts[1].connection_type, ConnectionType::Ip);
        assert_eq!(r.related_accounts[2].connection_type, ConnectionType::Network);
        // 1.0·0.5 + 0.8·0.3 + 0.5·0.2
        assert!((r.score - 0.84).abs() < 1e-9);
        assert_eq!(r.action, Verdict::Flag);
        assert_eq!(r.max_accounts_per_device, 2);
        assert_eq!(r.max_accounts_per_ip, 3);
    }

    #[tokio::test]
    async fn overlap_scan_cap_reports_skipped_players() {
        let sessions = Arc::new(MemorySessionStore::new());
        for (id, player) in [("s0", "me"), ("s1", "aa"), ("s2", "bb"), ("s3", "cc")] {
            sessions.record_session(session(id, player, 0, 3600)).await.unwrap();
        }
        let cfg = MultiAccountConfig { max_overlap_candidates: 1, ..Default::default() };
        let d = MultiAccountDetector::new(cfg, Arc::new(MemoryFingerprintDb::new()), sessions.clone());
        let r = d.analyze(&Context::background(), "me", ts(7200)).await.unwrap();

        // ids come back sorted, so only "aa" is scanned
        assert_eq!(r.overlap_candidates_skipped, 2);
        let names: Vec<&str> = r.related_accounts.iter().map(|a| a.player_id.as_str()).collect();
        assert_eq!(names, vec!["aa"]);
        assert_eq!(r.related_accounts[0].connection_type, ConnectionType::Behavioral);

        let d = MultiAccountDetector::new(MultiAccountConfig::default(), Arc::new(MemoryFingerprintDb::new()), sessions);
        let r = d.analyze(&Context::background(), "me", ts(7200)).await.unwrap();
        assert_eq!(r.overlap_candidates_skipped, 0);
        assert_eq!(r.related_accounts.len(), 3);
    }

    #[tokio::test]
    async fn store_failure_surfaces() {
        let fps = Arc::new(MemoryFingerprintDb::new());
        fps.outage.set(true);
        let d = MultiAccountDetector::new(MultiAccountConfig::default(), fps, Arc::new(MemorySessionStore::new()));
        assert!(d.analyze(&Context::background(), "p", ts(0)).await.is_err());
    }
}

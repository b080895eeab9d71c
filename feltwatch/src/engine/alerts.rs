// feltwatch/src/engine/alerts.rs
//
// Alert lifecycle: persist, notify, review, retain.
//
//   create_alert   persist first; high / critical then notify on-call.
//                  A failed notification is logged, a failed write is returned.
//   review_alert   pending → reviewed | dismissed | confirmed, nothing else
//   purge_before   retention sweep, the only way an alert is deleted

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{FraudError, Result, StoreError};
use crate::events::{AlertStatus, AntiCheatAlert};
use crate::store::{AlertQuery, AlertStats, AlertStorage};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &AntiCheatAlert) -> std::result::Result<(), String>;
}

/// Writes severe alerts to the log. Default when no pager is wired.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &AntiCheatAlert) -> std::result::Result<(), String> {
        warn!(
            "ALERT {} player={} type={} score={:.3}",
            alert.severity, alert.player_id, alert.alert_type, alert.score
        );
        Ok(())
    }
}

pub struct AlertService {
    storage: Arc<dyn AlertStorage>,
    notifier: Arc<dyn Notifier>,
    pub created: AtomicU64,
    pub notified: AtomicU64,
    pub notify_failures: AtomicU64,
}

impl AlertService {
    pub fn new(storage: Arc<dyn AlertStorage>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            storage,
            notifier,
            created: AtomicU64::new(0),
            notified: AtomicU64::new(0),
            notify_failures: AtomicU64::new(0),
        }
    }

    pub fn storage(&self) -> &Arc<dyn AlertStorage> {
        &self.storage
    }

    pub async fn create_alert(&self, alert: &AntiCheatAlert) -> Result<()> {
        self.storage.create_alert(alert).await?;
        self.created.fetch_add(1, Ordering::Relaxed);

        if alert.severity.is_severe() {
            match self.notifier.notify(alert).await {
                Ok(()) => {
                    self.notified.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.notify_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(alert = %alert.id, error = %e, "notification failed; alert persisted");
                }
            }
        }
        Ok(())
    }

    pub async fn review_alert(
        &self,
        id: &str,
        status: AlertStatus,
        reviewer: &str,
        at: DateTime<Utc>,
    ) -> Result<AntiCheatAlert> {
        let mut alert = self
            .storage
            .get_alert(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("alert {id}")))?;
        if !alert.status.can_transition_to(status) {
            return Err(FraudError::InvalidTransition { from: alert.status, to: status });
        }
        alert.status = status;
        alert.reviewed_at = Some(at);
        alert.reviewed_by = Some(reviewer.to_string());
        self.storage.update_alert(&alert).await?;
        info!(alert = id, %status, reviewer, "alert reviewed");
        Ok(alert)
    }

    /// Transitions every listed alert that is still pending; returns the count.
    pub async fn bulk_update_status(
        &self,
        ids: &[String],
        status: AlertStatus,
        reviewer: &str,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        if status == AlertStatus::Pending {
            return Err(FraudError::InvalidTransition { from: AlertStatus::Pending, to: status });
        }
        Ok(self.storage.bulk_update_status(ids, status, reviewer, at).await?)
    }

    pub async fn alerts_for_player(&self, player_id: &str, limit: Option<usize>) -> Result<Vec<AntiCheatAlert>> {
        let query = AlertQuery { limit, ..AlertQuery::for_player(player_id) };
        Ok(self.storage.query_alerts(&query).await?)
    }

    pub async fn query(&self, query: &AlertQuery) -> Result<Vec<AntiCheatAlert>> {
        Ok(self.storage.query_alerts(query).await?)
    }

    pub async fn stats(&self, since: DateTime<Utc>) -> Result<AlertStats> {
        Ok(self.storage.stats(since).await?)
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.storage.delete_before(cutoff).await?;
        if removed > 0 {
            info!(removed, %cutoff, "alert retention sweep");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AlertType, Severity};
    use crate::store::memory::MemoryAlertStorage;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, alert: &AntiCheatAlert) -> std::result::Result<(), String> {
            if self.fail {
                return Err("pager down".into());
            }
            self.seen.lock().push(alert.id.clone());
            Ok(())
        }
    }

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn alert(sev: Severity) -> AntiCheatAlert {
        AntiCheatAlert::new("p", AlertType::Bot, sev, sev.score(), "test", at())
    }

    #[tokio::test]
    async fn only_severe_alerts_notify() {
        let rec = Arc::new(Recorder::default());
        let svc = AlertService::new(Arc::new(MemoryAlertStorage::new()), rec.clone());
        let high = alert(Severity::High);
        svc.create_alert(&high).await.unwrap();
        svc.create_alert(&alert(Severity::Medium)).await.unwrap();
        assert_eq!(*rec.seen.lock(), vec![high.id]);
        assert_eq!(svc.created.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn notify_failure_keeps_alert() {
        let store = Arc::new(MemoryAlertStorage::new());
        let rec = Arc::new(Recorder { fail: true, ..Default::default() });
        let svc = AlertService::new(store.clone(), rec);
        svc.create_alert(&alert(Severity::Critical)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(svc.notify_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn persistence_failure_is_returned() {
        let store = Arc::new(MemoryAlertStorage::new());
        store.outage.set(true);
        let svc = AlertService::new(store, Arc::new(LogNotifier));
        assert!(matches!(svc.create_alert(&alert(Severity::High)).await, Err(FraudError::Store(_))));
    }

    #[tokio::test]
    async fn review_moves_out_of_pending_once() {
        let svc = AlertService::new(Arc::new(MemoryAlertStorage::new()), Arc::new(LogNotifier));
        let a = alert(Severity::Low);
        svc.create_alert(&a).await.unwrap();

        let reviewed = svc.review_alert(&a.id, AlertStatus::Confirmed, "ops", at()).await.unwrap();
        assert_eq!(reviewed.status, AlertStatus::Confirmed);
        assert_eq!(reviewed.reviewed_by.as_deref(), Some("ops"));

        let again = svc.review_alert(&a.id, AlertStatus::Dismissed, "ops", at()).await;
        assert!(matches!(again, Err(FraudError::InvalidTransition { .. })));
        assert!(svc.review_alert("missing", AlertStatus::Reviewed, "ops", at()).await.is_err());
    }

    #[tokio::test]
    async fn bulk_update_rejects_pending_target() {
        let svc = AlertService::new(Arc::new(MemoryAlertStorage::new()), Arc::new(LogNotifier));
        let r = svc.bulk_update_status(&[], AlertStatus::Pending, "ops", at()).await;
        assert!(matches!(r, Err(FraudError::InvalidTransition { .. })));
    }
}

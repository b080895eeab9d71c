// feltwatch/src/publisher.rs
//
// Alert publisher.
//
// Publishes persisted alerts to the alert topic for downstream consumers
// (case management, pagers, the data warehouse).
//
// Topic (configurable):
//   feltwatch.alerts  AlertMessage JSON, one message per alert
//
// Message format: UTF-8 JSON, RFC 3339 timestamps, no schema registry.
// Key: player_id (per-player ordering within a partition).
// Headers: alert_type, severity, agent_id, club_id.
//
// Two paths:
//   publish_sync   retries transient broker errors with bounded exponential
//                  backoff, then surfaces the failure
//   publish_async  bounded queue drained by `drain_loop`; fails fast when full
//
// The `Broker` trait is the transport seam. `InMemoryBroker` backs the CLI
// harness and tests; a production deployment plugs a Kafka producer in.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{AckMode, PublisherConfig};
use crate::context::Context;
use crate::error::{BrokerError, PublishError};
use crate::events::{AlertType, AntiCheatAlert, Severity};

// ── Wire format ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub id: String,
    pub player_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand_id: Option<String>,
    pub agent_id: String,
    pub club_id: String,
    pub evidence: Vec<String>,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
    /// When it was handed to the publisher.
    pub detected_at: DateTime<Utc>,
    pub risk_breakdown: BTreeMap<String, f64>,
}

impl AlertMessage {
    pub fn from_alert(alert: &AntiCheatAlert, detected_at: DateTime<Utc>) -> Self {
        Self {
            id: alert.id.clone(),
            player_id: alert.player_id.clone(),
            alert_type: alert.alert_type,
            severity: alert.severity,
            score: alert.score,
            table_id: alert.table_id.clone(),
            hand_id: alert.hand_id.clone(),
            agent_id: alert.agent_id.clone(),
            club_id: alert.club_id.clone(),
            evidence: alert.evidence.clone(),
            timestamp: alert.created_at,
            detected_at,
            risk_breakdown: alert.risk_breakdown.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}

// ── Broker seam ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: String,
    pub headers: Vec<(String, String)>,
    pub payload: Bytes,
    /// Set when the broker should drop redeliveries of the same message.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    pub offset: u64,
    /// The broker already held this message; nothing new was appended.
    pub duplicate: bool,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn send(&self, record: ProducerRecord) -> Result<Delivery, BrokerError>;
    async fn create_topic(&self, topic: &str, partitions: u32, replication: u16) -> Result<(), BrokerError>;
}

// ── In-memory broker ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Topic {
    partitions: Vec<Vec<ProducerRecord>>,
    seen: HashMap<String, Delivery>,
}

/// Partitioned in-process broker with idempotent de-duplication and
/// failure injection.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: RwLock<HashMap<String, Topic>>,
    fail_remaining: AtomicU32,
    fail_with: Mutex<Option<BrokerError>>,
}

pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let h = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    h % partitions.max(1)
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` sends fail with `err`.
    pub fn fail_next(&self, n: u32, err: BrokerError) {
        *self.fail_with.lock() = Some(err);
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn records(&self, topic: &str) -> Vec<ProducerRecord> {
        self.topics
            .read()
            .get(topic)
            .map(|t| t.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map(|t| t.partitions.iter().map(Vec::len).sum()).unwrap_or(0)
    }

    fn injected(&self) -> Option<BrokerError> {
        let claimed = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if claimed {
            Some(self.fail_with.lock().clone().unwrap_or(BrokerError::Unavailable("injected".into())))
        } else {
            None
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn send(&self, record: ProducerRecord) -> Result<Delivery, BrokerError> {
        if let Some(err) = self.injected() {
            return Err(err);
        }
        let mut topics = self.topics.write();
        let topic = topics.get_mut(&record.topic).ok_or_else(|| BrokerError::UnknownTopic(record.topic.clone()))?;
        if let Some(id) = &record.idempotency_key {
            if let Some(prev) = topic.seen.get(id) {
                return Ok(Delivery { duplicate: true, ..*prev });
            }
        }
        let partition = partition_for(&record.key, topic.partitions.len() as u32);
        let log = &mut topic.partitions[partition as usize];
        let delivery = Delivery { partition, offset: log.len() as u64, duplicate: false };
        if let Some(id) = &record.idempotency_key {
            topic.seen.insert(id.clone(), delivery);
        }
        log.push(record);
        Ok(delivery)
    }

    async fn create_topic(&self, topic: &str, partitions: u32, _replication: u16) -> Result<(), BrokerError> {
        let mut topics = self.topics.write();
        if topics.contains_key(topic) {
            return Err(BrokerError::TopicExists(topic.to_string()));
        }
        let partitions = (0..partitions.max(1)).map(|_| Vec::new()).collect();
        topics.insert(topic.to_string(), Topic { partitions, seen: HashMap::new() });
        Ok(())
    }
}

// ── Publisher ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishFailure {
    pub alert_id: String,
    pub player_id: String,
    pub attempts: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub retries: u64,
    pub enqueued: u64,
    pub rejected_full: u64,
}

#[derive(Default)]
struct PublisherState {
    stats: PublisherStats,
    errors: VecDeque<PublishFailure>,
}

pub struct AlertPublisher {
    config: PublisherConfig,
    broker: Arc<dyn Broker>,
    tx: mpsc::Sender<AlertMessage>,
    rx: Mutex<Option<mpsc::Receiver<AlertMessage>>>,
    state: Mutex<PublisherState>,
}

impl AlertPublisher {
    pub fn new(config: PublisherConfig, broker: Arc<dyn Broker>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let publisher = Arc::new(Self {
            config,
            broker,
            tx,
            rx: Mutex::new(Some(rx)),
            state: Mutex::new(PublisherState::default()),
        });
        info!(
            "alert publisher configured, brokers={} topic={} ack={:?}",
            publisher.config.brokers, publisher.config.topic, publisher.config.ack
        );
        publisher
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Creates the alert topic; an existing topic is fine.
    pub async fn ensure_topic(&self) -> Result<(), PublishError> {
        let c = &self.config;
        match self.broker.create_topic(&c.topic, c.partitions, c.replication).await {
            Ok(()) => {
                info!(topic = %c.topic, partitions = c.partitions, "alert topic created");
                Ok(())
            }
            Err(BrokerError::TopicExists(_)) => Ok(()),
            Err(source) => Err(PublishError::Delivery { attempts: 1, source }),
        }
    }

    fn record(&self, msg: &AlertMessage) -> Result<ProducerRecord, PublishError> {
        let payload = Bytes::from(serde_json::to_vec(msg)?);
        Ok(ProducerRecord {
            topic: self.config.topic.clone(),
            key: msg.player_id.clone(),
            headers: vec![
                ("alert_type".into(), msg.alert_type.to_string()),
                ("severity".into(), msg.severity.to_string()),
                ("agent_id".into(), msg.agent_id.clone()),
                ("club_id".into(), msg.club_id.clone()),
            ],
            payload,
            idempotency_key: (self.config.ack == AckMode::All).then(|| msg.id.clone()),
        })
    }

    fn interrupted(ctx: &Context, attempts: u32) -> PublishError {
        if ctx.is_cancelled() {
            PublishError::Cancelled
        } else {
            PublishError::Delivery { attempts, source: BrokerError::Timeout }
        }
    }

    async fn deliver(&self, ctx: &Context, msg: &AlertMessage) -> Result<Delivery, PublishError> {
        let record = self.record(msg)?;
        let send_timeout = Duration::from_millis(self.config.send_timeout_ms);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let mut attempts = 0u32;

        loop {
            if ctx.check().is_err() {
                return Err(Self::interrupted(ctx, attempts));
            }
            attempts += 1;
            let send = tokio::time::timeout(send_timeout, self.broker.send(record.clone()));
            let outcome = tokio::select! {
                r = send => r.unwrap_or(Err(BrokerError::Timeout)),
                _ = ctx.done() => return Err(Self::interrupted(ctx, attempts)),
            };

            match outcome {
                Ok(delivery) => {
                    let mut st = self.state.lock();
                    if delivery.duplicate {
                        st.stats.duplicates += 1;
                    } else {
                        st.stats.published += 1;
                    }
                    debug!(alert = %msg.id, partition = delivery.partition, offset = delivery.offset, "alert published");
                    return Ok(delivery);
                }
                Err(e) if e.is_retryable() && attempts <= self.config.max_retries => {
                    self.state.lock().stats.retries += 1;
                    warn!(alert = %msg.id, attempt = attempts, error = %e, "publish failed, retrying in {:?}", backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = ctx.done() => return Err(Self::interrupted(ctx, attempts)),
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(source) => return Err(PublishError::Delivery { attempts, source }),
            }
        }
    }

    fn record_failure(&self, msg: &AlertMessage, err: &PublishError) {
        let attempts = match err {
            PublishError::Delivery { attempts, .. } => *attempts,
            _ => 0,
        };
        let mut st = self.state.lock();
        st.stats.failed += 1;
        if st.errors.len() >= self.config.max_errors {
            st.errors.pop_front();
        }
        st.errors.push_back(PublishFailure {
            alert_id: msg.id.clone(),
            player_id: msg.player_id.clone(),
            attempts,
            error: err.to_string(),
            at: Utc::now(),
        });
    }

    /// Deliver now, retrying transient failures.
    pub async fn publish_sync(&self, ctx: &Context, alert: &AntiCheatAlert) -> Result<Delivery, PublishError> {
        let msg = AlertMessage::from_alert(alert, Utc::now());
        let res = self.deliver(ctx, &msg).await;
        if let Err(e) = &res {
            warn!(alert = %msg.id, error = %e, "alert publish failed");
            self.record_failure(&msg, e);
        }
        res
    }

    /// Queue for the drain task. Fails fast when the queue is full.
    pub fn publish_async(&self, alert: &AntiCheatAlert) -> Result<(), PublishError> {
        let msg = AlertMessage::from_alert(alert, Utc::now());
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.state.lock().stats.enqueued += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.state.lock().stats.rejected_full += 1;
                warn!(alert = %msg.id, "alert queue full");
                Err(PublishError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PublishError::Closed),
        }
    }

    /// Background delivery of queued alerts. Runs until `ctx` is done.
    pub async fn drain_loop(self: Arc<Self>, ctx: Context) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("alert drain loop already running");
            return;
        };
        loop {
            let msg = tokio::select! {
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
                _ = ctx.done() => break,
            };
            if let Err(e) = self.deliver(&ctx, &msg).await {
                warn!(alert = %msg.id, error = %e, "queued alert publish failed");
                self.record_failure(&msg, &e);
            }
        }
        let left = self.queue_depth();
        if left > 0 {
            warn!(left, "alert drain loop stopped with queued alerts (already persisted)");
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.config.queue_capacity.max(1) - self.tx.capacity()
    }

    /// Recent delivery failures, oldest first.
    pub fn errors(&self) -> Vec<PublishFailure> {
        self.state.lock().errors.iter().cloned().collect()
    }

    pub fn stats(&self) -> PublisherStats {
        self.state.lock().stats.clone()
    }

    /// Failures and stats taken under one lock.
    pub fn snapshot(&self) -> (PublisherStats, Vec<PublishFailure>) {
        let st = self.state.lock();
        (st.stats.clone(), st.errors.iter().cloned().collect())
    }
}

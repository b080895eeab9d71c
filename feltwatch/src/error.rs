// feltwatch/src/error.rs
//
// Error taxonomy.
//   StoreError   : failures from the four consumed store contracts
//   BrokerError  : transport failures from the message broker
//   PublishError : what the publisher surfaces after retries / queueing
//   FraudError   : everything a detector or service entry point can return
//
// Insufficient data and rule cooldowns are NOT errors; they are ordinary
// outcomes carried in the detector results (confidence 0 / no alert).

use thiserror::Error;

use crate::events::AlertStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store conflict: {0}")]
    Conflict(String),
    #[error("store backend unavailable: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("topic already exists: {0}")]
    TopicExists(String),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker rejected record: {0}")]
    Rejected(String),
    #[error("broker timed out")]
    Timeout,
}

impl BrokerError {
    /// Transient errors are worth another attempt; rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("publisher closed")]
    Closed,
    #[error("serialize alert: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("delivery failed after {attempts} attempt(s): {source}")]
    Delivery {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
    #[error("publish cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum FraudError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("unknown rule: {0}")]
    UnknownRule(String),
    #[error("invalid alert transition {from} -> {to}")]
    InvalidTransition { from: AlertStatus, to: AlertStatus },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("detector {0} failed: {1}")]
    Detector(&'static str, String),
}

pub type Result<T, E = FraudError> = std::result::Result<T, E>;

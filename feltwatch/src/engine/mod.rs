pub mod alerts;
pub mod risk;
pub mod rules;
pub mod service;

pub use alerts::{AlertService, LogNotifier, Notifier};
pub use risk::{AlertHistory, RiskScore, RiskScorer, RiskSignals};
pub use rules::{Rule, RuleCatalog, RuleCategory, RuleCheckData, RuleEngine};
pub use service::{DetectorFailure, FraudDetectionResult, FraudService, ServiceStatsSnapshot, Stores};

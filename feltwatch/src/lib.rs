// feltwatch/src/lib.rs
//
// Feltwatch: real-time bot, collusion and multi-account detection for
// multiplayer card games.
//
//   events     domain types in and out
//   state      per-player sliding windows and feature extraction
//   workers    bot / collusion / multi-account detectors
//   engine     rules, risk aggregation, alert lifecycle, fraud service
//   publisher  alert wire format and broker delivery
//   store      contracts for the external stores + in-memory versions

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod publisher;
pub mod state;
pub mod store;
pub mod workers;

pub use config::EngineConfig;
pub use context::{cancellable, CancelHandle, Context};
pub use engine::{FraudDetectionResult, FraudService, Stores};
pub use error::{FraudError, Result};

pub mod bot;
pub mod collusion;
pub mod fingerprint;
pub mod isolation;
pub mod multi_account;

pub use bot::{BotDetectionResult, BotDetector, DetectionMethod};
pub use collusion::{CollusionDetector, CollusionRing, PairAnalysis, PlayerCollusionResult};
pub use fingerprint::DeviceAttributes;
pub use multi_account::{ConnectionType, MultiAccountDetector, MultiAccountResult, RelatedAccount};

pub mod config;
pub mod emotion;
pub mod events;
pub mod intervention;
pub mod logging;
pub mod recalibration;
pub mod session;
pub mod store;
pub mod visibility;

pub use config::{AffectConfig, ConfigError};
pub use emotion::{Emotion, EmotionPrediction, EmotionScores, EmotionState, PredictionSource};
pub use events::{AffectEvent, EventBus, EventEnvelope};
pub use intervention::{InterventionDecision, InterventionEngine, Tier};
pub use recalibration::{RecalibrationService, SampleProvider, SampleSlot};
pub use session::{CapturedFrame, FrameOutcome, SessionContext, SessionSnapshot};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use visibility::{VisibilityIssue, VisibilityMonitor, VisibilitySignal};

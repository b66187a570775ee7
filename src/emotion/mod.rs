pub mod temporal;
pub mod types;

pub use temporal::{TemporalStateEngine, TemporalStatistics};
pub use types::{
    ActionSuggestion, Emotion, EmotionPrediction, EmotionScores, EmotionState, EngagementState,
    PredictionError, PredictionSource,
};

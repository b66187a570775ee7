use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TemporalConfig;
use crate::emotion::types::{
    ActionSuggestion, Emotion, EmotionPrediction, EmotionScores, EmotionState, EngagementState,
    PredictionError,
};

const PATTERN_LENGTH: usize = 3;
const BREAK_LOOKBACK: usize = 5;
const BREAK_MIN_UNFOCUSED: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalStatistics {
    pub window_size: usize,
    /// Share of each class among the raw predictions in the window, in percent.
    pub distribution: EmotionScores,
    pub average_confidence: f64,
}

/// Sliding window over raw predictions plus an exponential moving average of
/// the class probabilities.
pub struct TemporalStateEngine {
    config: TemporalConfig,
    window: VecDeque<EmotionPrediction>,
    smoothed: EmotionScores,
}

impl TemporalStateEngine {
    pub fn new(config: TemporalConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_capacity),
            smoothed: EmotionScores::uniform(),
            config,
        }
    }

    pub fn add_prediction(&mut self, prediction: EmotionPrediction) -> Result<EmotionState, PredictionError> {
        if let Err(err) = prediction.validate() {
            warn!(error = %err, source = ?prediction.source, "dropping malformed prediction");
            return Err(err);
        }

        let alpha = self.config.smoothing_alpha;
        for emotion in Emotion::ALL {
            let previous = self.smoothed.get(emotion);
            let observed = prediction.probabilities.get(emotion);
            self.smoothed.set(emotion, (1.0 - alpha) * previous + alpha * observed);
        }

        if self.window.len() >= self.config.window_capacity {
            self.window.pop_front();
        }
        self.window.push_back(prediction);

        let state = self.state();
        debug!(
            emotion = %state.current_emotion,
            confidence = state.confidence_score,
            engagement = ?state.engagement_state,
            window = self.window.len(),
            "emotion state updated"
        );
        Ok(state)
    }

    pub fn state(&self) -> EmotionState {
        let current_emotion = self.smoothed.dominant();
        let confidence_score = self.window.back().map(|p| p.confidence).unwrap_or(0.0);

        EmotionState {
            current_emotion,
            confidence_score,
            emotion_scores: self.smoothed,
            engagement_state: self.engagement_for(current_emotion, confidence_score),
            action_suggestion: self.action_suggestion(),
            is_potential_confusion: self.is_potential_confusion(),
        }
    }

    pub fn history(&self) -> Vec<EmotionPrediction> {
        self.window.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn smoothed_scores(&self) -> EmotionScores {
        self.smoothed
    }

    pub fn statistics(&self) -> TemporalStatistics {
        let window_size = self.window.len();
        if window_size == 0 {
            return TemporalStatistics {
                window_size,
                distribution: EmotionScores::new(0.0, 0.0, 0.0, 0.0),
                average_confidence: 0.0,
            };
        }

        let mut distribution = EmotionScores::new(0.0, 0.0, 0.0, 0.0);
        for p in &self.window {
            distribution.set(p.emotion, distribution.get(p.emotion) + 1.0);
        }
        for emotion in Emotion::ALL {
            distribution.set(emotion, distribution.get(emotion) / window_size as f64 * 100.0);
        }

        let average_confidence =
            self.window.iter().map(|p| p.confidence).sum::<f64>() / window_size as f64;

        TemporalStatistics {
            window_size,
            distribution,
            average_confidence,
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.smoothed = EmotionScores::uniform();
    }

    fn engagement_for(&self, emotion: Emotion, confidence: f64) -> EngagementState {
        if confidence >= self.config.focused_confidence {
            EngagementState::Focused
        } else if confidence < self.config.uncertain_confidence {
            EngagementState::Uncertain
        } else if emotion.is_unfocused() {
            EngagementState::Unfocused
        } else {
            EngagementState::Focused
        }
    }

    /// Most recent `n` predictions, oldest first.
    fn recent(&self, n: usize) -> impl Iterator<Item = &EmotionPrediction> {
        self.window.iter().skip(self.window.len().saturating_sub(n))
    }

    fn is_potential_confusion(&self) -> bool {
        if self.window.len() < PATTERN_LENGTH {
            return false;
        }
        let recent: Vec<&EmotionPrediction> = self.recent(PATTERN_LENGTH).collect();
        recent.iter().all(|p| p.emotion == Emotion::Focused)
            && recent.windows(2).all(|pair| pair[1].confidence < pair[0].confidence)
    }

    fn action_suggestion(&self) -> ActionSuggestion {
        if self.window.len() < PATTERN_LENGTH {
            return ActionSuggestion::None;
        }

        if self.recent(PATTERN_LENGTH).all(|p| p.emotion.is_struggling()) {
            return ActionSuggestion::Simplify;
        }

        let all_tired = self.recent(PATTERN_LENGTH).all(|p| p.emotion == Emotion::Tired);
        let unfocused = self.recent(BREAK_LOOKBACK).filter(|p| p.emotion.is_unfocused()).count();
        if all_tired || unfocused >= BREAK_MIN_UNFOCUSED {
            return ActionSuggestion::Break;
        }

        ActionSuggestion::None
    }
}

impl Default for TemporalStateEngine {
    fn default() -> Self {
        Self::new(TemporalConfig::default())
    }
}

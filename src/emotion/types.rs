use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance applied when checking that a probability vector sums to one.
pub const PROBABILITY_SUM_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Emotion {
    #[serde(alias = "bored")]
    Bored,
    #[serde(alias = "confused")]
    Confused,
    #[serde(alias = "focused")]
    Focused,
    #[serde(alias = "tired")]
    Tired,
}

impl Emotion {
    pub const ALL: [Emotion; 4] = [
        Emotion::Bored,
        Emotion::Confused,
        Emotion::Focused,
        Emotion::Tired,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Emotion::Bored => "Bored",
            Emotion::Confused => "Confused",
            Emotion::Focused => "Focused",
            Emotion::Tired => "Tired",
        }
    }

    /// Bored or Tired: the classes that count towards disengagement.
    pub const fn is_unfocused(self) -> bool {
        matches!(self, Emotion::Bored | Emotion::Tired)
    }

    /// Confused or Bored: the classes that count towards a simplify prompt.
    pub const fn is_struggling(self) -> bool {
        matches!(self, Emotion::Confused | Emotion::Bored)
    }

    const fn index(self) -> usize {
        match self {
            Emotion::Bored => 0,
            Emotion::Confused => 1,
            Emotion::Focused => 2,
            Emotion::Tired => 3,
        }
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per emotion class, used both for raw classifier output and the
/// smoothed distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionScores {
    #[serde(rename = "Bored", alias = "bored")]
    pub bored: f64,
    #[serde(rename = "Confused", alias = "confused")]
    pub confused: f64,
    #[serde(rename = "Focused", alias = "focused")]
    pub focused: f64,
    #[serde(rename = "Tired", alias = "tired")]
    pub tired: f64,
}

impl EmotionScores {
    pub const fn new(bored: f64, confused: f64, focused: f64, tired: f64) -> Self {
        Self {
            bored,
            confused,
            focused,
            tired,
        }
    }

    pub const fn uniform() -> Self {
        Self::new(0.25, 0.25, 0.25, 0.25)
    }

    /// Puts `weight` on `emotion` and spreads the remainder evenly.
    pub fn peaked(emotion: Emotion, weight: f64) -> Self {
        let weight = weight.clamp(0.0, 1.0);
        let rest = (1.0 - weight) / 3.0;
        let mut scores = Self::new(rest, rest, rest, rest);
        scores.set(emotion, weight);
        scores
    }

    pub fn get(&self, emotion: Emotion) -> f64 {
        self.as_array()[emotion.index()]
    }

    pub fn set(&mut self, emotion: Emotion, value: f64) {
        match emotion {
            Emotion::Bored => self.bored = value,
            Emotion::Confused => self.confused = value,
            Emotion::Focused => self.focused = value,
            Emotion::Tired => self.tired = value,
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.bored, self.confused, self.focused, self.tired]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f64)> + '_ {
        Emotion::ALL.into_iter().map(move |e| (e, self.get(e)))
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }

    /// Class with the highest score. Ties go to Focused, then class order.
    pub fn dominant(&self) -> Emotion {
        let mut best = Emotion::Focused;
        let mut best_score = self.get(best);
        for (emotion, score) in self.iter() {
            if score > best_score {
                best = emotion;
                best_score = score;
            }
        }
        best
    }
}

impl Default for EmotionScores {
    fn default() -> Self {
        Self::uniform()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionSource {
    #[default]
    Local,
    Cloud,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionPrediction {
    pub emotion: Emotion,
    pub probabilities: EmotionScores,
    pub confidence: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub source: PredictionSource,
}

impl EmotionPrediction {
    pub fn local(emotion: Emotion, probabilities: EmotionScores, confidence: f64, timestamp: i64) -> Self {
        Self {
            emotion,
            probabilities,
            confidence,
            timestamp,
            source: PredictionSource::Local,
        }
    }

    pub fn validate(&self) -> Result<(), PredictionError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(PredictionError::ConfidenceOutOfRange(self.confidence));
        }

        for (emotion, p) in self.probabilities.iter() {
            if !p.is_finite() || p < 0.0 {
                return Err(PredictionError::InvalidProbability { emotion, value: p });
            }
        }

        let sum = self.probabilities.sum();
        if (sum - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
            return Err(PredictionError::ProbabilitySum(sum));
        }

        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictionError {
    #[error("probabilities sum to {0:.4}, expected 1")]
    ProbabilitySum(f64),
    #[error("invalid probability {value} for {emotion}")]
    InvalidProbability { emotion: Emotion, value: f64 },
    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngagementState {
    Focused,
    Unfocused,
    Uncertain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionSuggestion {
    None,
    Simplify,
    Break,
}

/// Derived view of the prediction window. Never stored, always recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionState {
    pub current_emotion: Emotion,
    pub confidence_score: f64,
    pub emotion_scores: EmotionScores,
    pub engagement_state: EngagementState,
    pub action_suggestion: ActionSuggestion,
    pub is_potential_confusion: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dominant_prefers_focused_on_tie() {
        assert_eq!(EmotionScores::uniform().dominant(), Emotion::Focused);
        assert_eq!(EmotionScores::new(0.4, 0.4, 0.1, 0.1).dominant(), Emotion::Bored);
    }

    #[test]
    fn test_peaked_sums_to_one() {
        let scores = EmotionScores::peaked(Emotion::Tired, 0.7);
        assert!((scores.sum() - 1.0).abs() < 1e-9);
        assert!((scores.get(Emotion::Tired) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_bad_sum() {
        let p = EmotionPrediction::local(Emotion::Bored, EmotionScores::new(0.5, 0.5, 0.5, 0.0), 0.6, 0);
        assert!(matches!(p.validate(), Err(PredictionError::ProbabilitySum(_))));
    }

    #[test]
    fn test_validate_rejects_confidence() {
        let p = EmotionPrediction::local(Emotion::Bored, EmotionScores::uniform(), 1.2, 0);
        assert_eq!(p.validate(), Err(PredictionError::ConfidenceOutOfRange(1.2)));
    }

    #[test]
    fn test_unknown_label_fails_to_deserialize() {
        let raw = r#"{"emotion":"Happy","probabilities":{"Bored":0.25,"Confused":0.25,"Focused":0.25,"Tired":0.25},"confidence":0.5,"timestamp":0}"#;
        assert!(serde_json::from_str::<EmotionPrediction>(raw).is_err());
    }

    #[test]
    fn test_lowercase_labels_accepted() {
        let raw = r#"{"emotion":"tired","probabilities":{"bored":0.1,"confused":0.1,"focused":0.1,"tired":0.7},"confidence":0.5,"timestamp":0,"source":"cloud"}"#;
        let p: EmotionPrediction = serde_json::from_str(raw).unwrap();
        assert_eq!(p.emotion, Emotion::Tired);
        assert_eq!(p.source, PredictionSource::Cloud);
        assert!(p.validate().is_ok());
    }
}

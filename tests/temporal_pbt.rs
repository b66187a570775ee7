//! Property-based tests for the temporal window and the visibility debounce.
//!
//! Invariants:
//! - Window length never exceeds capacity and holds the most recent entries in order
//! - Smoothed scores stay a probability distribution
//! - Window distribution percentages sum to 100
//! - A no-face issue is raised exactly from the third consecutive failing frame

mod common;

use proptest::prelude::*;

use danci_affect::config::{TemporalConfig, VisibilityConfig};
use danci_affect::emotion::{Emotion, EmotionPrediction, EmotionScores, TemporalStateEngine};
use danci_affect::visibility::VisibilityMonitor;

use common::{no_face_signal, visible_signal, FIXED_TIMESTAMP};

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_emotion() -> impl Strategy<Value = Emotion> {
    prop_oneof![
        Just(Emotion::Bored),
        Just(Emotion::Confused),
        Just(Emotion::Focused),
        Just(Emotion::Tired),
    ]
}

fn arb_prediction() -> impl Strategy<Value = (Emotion, f64, f64)> {
    (
        arb_emotion(),
        (250u64..=1000u64).prop_map(|v| v as f64 / 1000.0), // peak weight
        (0u64..=1000u64).prop_map(|v| v as f64 / 1000.0),   // confidence
    )
}

fn build(sequence: &[(Emotion, f64, f64)]) -> Vec<EmotionPrediction> {
    sequence
        .iter()
        .enumerate()
        .map(|(i, (emotion, weight, confidence))| {
            EmotionPrediction::local(
                *emotion,
                EmotionScores::peaked(*emotion, *weight),
                *confidence,
                FIXED_TIMESTAMP + i as i64 * 1_000,
            )
        })
        .collect()
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn window_keeps_most_recent_entries(sequence in prop::collection::vec(arb_prediction(), 0..60)) {
        let predictions = build(&sequence);
        let mut engine = TemporalStateEngine::new(TemporalConfig::default());
        for p in &predictions {
            prop_assert!(engine.add_prediction(p.clone()).is_ok());
        }

        let capacity = TemporalConfig::default().window_capacity;
        let expected: Vec<_> = predictions
            .iter()
            .skip(predictions.len().saturating_sub(capacity))
            .cloned()
            .collect();
        prop_assert_eq!(engine.len(), predictions.len().min(capacity));
        prop_assert_eq!(engine.history(), expected);
    }

    #[test]
    fn smoothed_scores_remain_a_distribution(sequence in prop::collection::vec(arb_prediction(), 1..40)) {
        let mut engine = TemporalStateEngine::new(TemporalConfig::default());
        for p in build(&sequence) {
            let state = engine.add_prediction(p).unwrap();
            prop_assert!((state.emotion_scores.sum() - 1.0).abs() < 1e-6);
            prop_assert!(state.emotion_scores.iter().all(|(_, v)| (0.0..=1.0).contains(&v)));
        }
    }

    #[test]
    fn distribution_percentages_sum_to_hundred(sequence in prop::collection::vec(arb_prediction(), 1..40)) {
        let mut engine = TemporalStateEngine::new(TemporalConfig::default());
        for p in build(&sequence) {
            engine.add_prediction(p).unwrap();
        }
        let stats = engine.statistics();
        prop_assert!((stats.distribution.sum() - 100.0).abs() < 1e-6);
        prop_assert!((0.0..=1.0).contains(&stats.average_confidence));
    }

    #[test]
    fn no_face_raised_from_third_frame(frames in 0usize..10) {
        let mut monitor = VisibilityMonitor::new(VisibilityConfig::default());
        let mut last = None;
        for i in 0..frames {
            last = monitor.check_at(&no_face_signal(), FIXED_TIMESTAMP + i as i64 * 100);
        }
        prop_assert_eq!(last.is_some(), frames >= 3);
        if let Some(issue) = last {
            prop_assert_eq!(issue.consecutive_frames as usize, frames);
        }

        prop_assert!(monitor.check_at(&visible_signal(), FIXED_TIMESTAMP + 10_000).is_none());
        prop_assert_eq!(monitor.state().no_face_frames, 0);
    }
}

use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::InterventionConfig;
use crate::emotion::{Emotion, EmotionPrediction, EmotionState};
use crate::intervention::state_machine::{TierEvent, TierPhase, TierStateMachine};

pub const TIER1_MESSAGE: &str = "Seems tough — shall I simplify this?";
pub const TIER2_MESSAGE: &str = "You've been at this for a while. How about a short break?";
pub const ESCALATION_MESSAGE: &str = "Still finding it hard going? A short break might help you reset.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Tier {
    One,
    Two,
}

impl Tier {
    pub const fn as_u8(self) -> u8 {
        match self {
            Tier::One => 1,
            Tier::Two => 2,
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.as_u8()
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::One),
            2 => Ok(Tier::Two),
            other => Err(format!("unknown intervention tier {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionReason {
    PersistentConfusion,
    ProlongedDisengagement,
    EscalationFromTier1,
    InsufficientHistory,
    NoConfusionPattern,
    #[serde(rename = "time_range_outside_1_3_minutes")]
    TimeRangeOutside1To3Minutes,
    Tier1Cooldown,
    Tier2Cooldown,
}

impl InterventionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PersistentConfusion => "persistent_confusion",
            Self::ProlongedDisengagement => "prolonged_disengagement",
            Self::EscalationFromTier1 => "escalation_from_tier1",
            Self::InsufficientHistory => "insufficient_history",
            Self::NoConfusionPattern => "no_confusion_pattern",
            Self::TimeRangeOutside1To3Minutes => "time_range_outside_1_3_minutes",
            Self::Tier1Cooldown => "tier1_cooldown",
            Self::Tier2Cooldown => "tier2_cooldown",
        }
    }
}

impl std::fmt::Display for InterventionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionDecision {
    pub should_intervene: bool,
    pub tier: Option<Tier>,
    pub message: String,
    pub reason: InterventionReason,
}

impl InterventionDecision {
    fn trigger(tier: Tier, message: &str, reason: InterventionReason) -> Self {
        Self {
            should_intervene: true,
            tier: Some(tier),
            message: message.to_string(),
            reason,
        }
    }

    fn none(reason: InterventionReason) -> Self {
        Self {
            should_intervene: false,
            tier: None,
            message: String::new(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionResponse {
    pub timestamp: i64,
    pub tier: Tier,
    pub accepted: bool,
    pub emotion: Emotion,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierCounters {
    pub accepted: u32,
    pub dismissed: u32,
}

impl TierCounters {
    fn record(&mut self, accepted: bool) {
        if accepted {
            self.accepted = self.accepted.saturating_add(1);
        } else {
            self.dismissed = self.dismissed.saturating_add(1);
        }
    }

    pub fn acceptance_rate(&self) -> f64 {
        acceptance_rate(self.accepted, self.dismissed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivenessStats {
    pub tier1: TierCounters,
    pub tier2: TierCounters,
    pub tier1_acceptance_rate: f64,
    pub tier2_acceptance_rate: f64,
    pub overall_acceptance_rate: f64,
    pub total_responses: usize,
}

/// Persistable slice of the engine: response counters and history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionAnalytics {
    pub tier1: TierCounters,
    pub tier2: TierCounters,
    pub responses: Vec<InterventionResponse>,
}

fn acceptance_rate(accepted: u32, dismissed: u32) -> f64 {
    let total = accepted as f64 + dismissed as f64;
    if total == 0.0 {
        0.0
    } else {
        accepted as f64 / total * 100.0
    }
}

/// Two-tier intervention policy with per-tier cooldowns.
pub struct InterventionEngine {
    config: InterventionConfig,
    last_tier1_ms: i64,
    last_tier2_ms: i64,
    phase: TierStateMachine,
    responses: VecDeque<InterventionResponse>,
    tier1: TierCounters,
    tier2: TierCounters,
}

impl InterventionEngine {
    pub fn new(config: InterventionConfig) -> Self {
        Self {
            phase: TierStateMachine::new(config.escalation_policy),
            responses: VecDeque::with_capacity(config.response_history_limit),
            config,
            last_tier1_ms: 0,
            last_tier2_ms: 0,
            tier1: TierCounters::default(),
            tier2: TierCounters::default(),
        }
    }

    pub fn evaluate(&mut self, history: &[EmotionPrediction], state: &EmotionState) -> InterventionDecision {
        self.evaluate_at(history, state, Utc::now().timestamp_millis())
    }

    /// `history` is ordered oldest first, as the temporal window hands it out.
    pub fn evaluate_at(
        &mut self,
        history: &[EmotionPrediction],
        state: &EmotionState,
        now_ms: i64,
    ) -> InterventionDecision {
        let tier2_blocked = match self.check_tier2(history, now_ms) {
            Tier2Check::Triggered => {
                let reason = if self.phase.would_escalate() {
                    InterventionReason::EscalationFromTier1
                } else {
                    InterventionReason::ProlongedDisengagement
                };
                let message = match reason {
                    InterventionReason::EscalationFromTier1 => ESCALATION_MESSAGE,
                    _ => TIER2_MESSAGE,
                };
                self.last_tier2_ms = now_ms;
                self.phase.apply(TierEvent::Tier2Fired, now_ms);
                info!(
                    reason = %reason,
                    emotion = %state.current_emotion,
                    confidence = state.confidence_score,
                    "tier 2 intervention triggered"
                );
                return InterventionDecision::trigger(Tier::Two, message, reason);
            }
            Tier2Check::Cooldown => true,
            Tier2Check::NotMet => false,
        };

        let decision = match self.check_tier1(history, now_ms) {
            Ok(()) => {
                self.last_tier1_ms = now_ms;
                self.phase.apply(TierEvent::Tier1Fired, now_ms);
                info!(
                    emotion = %state.current_emotion,
                    confidence = state.confidence_score,
                    "tier 1 intervention triggered"
                );
                return InterventionDecision::trigger(
                    Tier::One,
                    TIER1_MESSAGE,
                    InterventionReason::PersistentConfusion,
                );
            }
            Err(reason) if tier2_blocked && reason != InterventionReason::Tier1Cooldown => {
                InterventionDecision::none(InterventionReason::Tier2Cooldown)
            }
            Err(reason) => InterventionDecision::none(reason),
        };

        debug!(reason = %decision.reason, history = history.len(), "no intervention");
        decision
    }

    fn check_tier2(&self, history: &[EmotionPrediction], now_ms: i64) -> Tier2Check {
        if history.len() < self.config.tier2_min_history {
            return Tier2Check::NotMet;
        }

        let cutoff = now_ms - self.config.tier2_lookback.as_millis() as i64;
        let (total, unfocused) = history
            .iter()
            .filter(|p| p.timestamp >= cutoff)
            .fold((0usize, 0usize), |(total, unfocused), p| {
                (total + 1, unfocused + usize::from(p.emotion.is_unfocused()))
            });
        if total == 0 {
            return Tier2Check::NotMet;
        }

        let ratio = unfocused as f64 / total as f64;
        if ratio <= self.config.tier2_unfocused_ratio {
            return Tier2Check::NotMet;
        }

        if in_cooldown(self.last_tier2_ms, now_ms, self.config.tier2_cooldown.as_millis() as i64) {
            return Tier2Check::Cooldown;
        }

        Tier2Check::Triggered
    }

    fn check_tier1(&self, history: &[EmotionPrediction], now_ms: i64) -> Result<(), InterventionReason> {
        if history.len() < self.config.tier1_min_history {
            return Err(InterventionReason::InsufficientHistory);
        }

        let recent = &history[history.len() - self.config.tier1_min_history..];
        if !recent.iter().all(|p| p.emotion.is_struggling()) {
            return Err(InterventionReason::NoConfusionPattern);
        }

        let oldest = recent.iter().map(|p| p.timestamp).min().unwrap_or(now_ms);
        let newest = recent.iter().map(|p| p.timestamp).max().unwrap_or(now_ms);
        let span = newest - oldest;
        let min_span = self.config.tier1_min_span.as_millis() as i64;
        let max_span = self.config.tier1_max_span.as_millis() as i64;
        if span < min_span || span > max_span {
            return Err(InterventionReason::TimeRangeOutside1To3Minutes);
        }

        if in_cooldown(self.last_tier1_ms, now_ms, self.config.tier1_cooldown.as_millis() as i64) {
            return Err(InterventionReason::Tier1Cooldown);
        }

        Ok(())
    }

    pub fn record_response(&mut self, tier: Tier, accepted: bool, emotion: Emotion, confidence: f64) {
        self.record_response_at(tier, accepted, emotion, confidence, Utc::now().timestamp_millis());
    }

    pub fn record_response_at(
        &mut self,
        tier: Tier,
        accepted: bool,
        emotion: Emotion,
        confidence: f64,
        timestamp: i64,
    ) {
        if self.responses.len() >= self.config.response_history_limit {
            self.responses.pop_front();
        }
        self.responses.push_back(InterventionResponse {
            timestamp,
            tier,
            accepted,
            emotion,
            confidence,
        });

        match tier {
            Tier::One => self.tier1.record(accepted),
            Tier::Two => self.tier2.record(accepted),
        }

        if accepted {
            // an accepted prompt invalidates both pending signals
            self.last_tier1_ms = 0;
            self.last_tier2_ms = 0;
            self.phase.apply(TierEvent::Accepted, timestamp);
        } else {
            let event = match tier {
                Tier::One => TierEvent::Tier1Dismissed,
                Tier::Two => TierEvent::Tier2Dismissed,
            };
            self.phase.apply(event, timestamp);
        }

        info!(tier = tier.as_u8(), accepted, emotion = %emotion, "intervention response recorded");
    }

    pub fn effectiveness_stats(&self) -> EffectivenessStats {
        EffectivenessStats {
            tier1: self.tier1,
            tier2: self.tier2,
            tier1_acceptance_rate: self.tier1.acceptance_rate(),
            tier2_acceptance_rate: self.tier2.acceptance_rate(),
            overall_acceptance_rate: acceptance_rate(
                self.tier1.accepted.saturating_add(self.tier2.accepted),
                self.tier1.dismissed.saturating_add(self.tier2.dismissed),
            ),
            total_responses: self.responses.len(),
        }
    }

    pub fn responses(&self) -> Vec<InterventionResponse> {
        self.responses.iter().cloned().collect()
    }

    pub fn phase(&self) -> TierPhase {
        self.phase.phase()
    }

    pub fn state_machine(&self) -> &TierStateMachine {
        &self.phase
    }

    pub fn last_trigger_ms(&self, tier: Tier) -> i64 {
        match tier {
            Tier::One => self.last_tier1_ms,
            Tier::Two => self.last_tier2_ms,
        }
    }

    pub fn analytics(&self) -> InterventionAnalytics {
        InterventionAnalytics {
            tier1: self.tier1,
            tier2: self.tier2,
            responses: self.responses(),
        }
    }

    /// Restores persisted counters and history. Cooldowns are not restored.
    pub fn restore_analytics(&mut self, analytics: InterventionAnalytics) {
        self.tier1 = analytics.tier1;
        self.tier2 = analytics.tier2;
        let limit = self.config.response_history_limit;
        let skip = analytics.responses.len().saturating_sub(limit);
        self.responses = analytics.responses.into_iter().skip(skip).collect();
    }

    pub fn reset(&mut self) {
        self.last_tier1_ms = 0;
        self.last_tier2_ms = 0;
        self.responses.clear();
        self.tier1 = TierCounters::default();
        self.tier2 = TierCounters::default();
        self.phase.reset();
    }
}

impl Default for InterventionEngine {
    fn default() -> Self {
        Self::new(InterventionConfig::default())
    }
}

enum Tier2Check {
    Triggered,
    Cooldown,
    NotMet,
}

fn in_cooldown(last_ms: i64, now_ms: i64, cooldown_ms: i64) -> bool {
    last_ms != 0 && now_ms - last_ms < cooldown_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emotion::{EmotionScores, TemporalStateEngine};

    const T0: i64 = 1_700_000_000_000;

    fn p(emotion: Emotion, confidence: f64, ts: i64) -> EmotionPrediction {
        EmotionPrediction::local(emotion, EmotionScores::peaked(emotion, 0.7), confidence, ts)
    }

    fn state_for(history: &[EmotionPrediction]) -> EmotionState {
        let mut engine = TemporalStateEngine::default();
        for prediction in history {
            engine.add_prediction(prediction.clone()).unwrap();
        }
        engine.state()
    }

    fn confusion_history(now: i64) -> Vec<EmotionPrediction> {
        vec![
            p(Emotion::Confused, 0.7, now - 120_000),
            p(Emotion::Confused, 0.75, now - 60_000),
            p(Emotion::Confused, 0.8, now),
        ]
    }

    #[test]
    fn test_tier1_then_cooldown() {
        let mut engine = InterventionEngine::default();
        let history = confusion_history(T0);
        let state = state_for(&history);

        let decision = engine.evaluate_at(&history, &state, T0);
        assert!(decision.should_intervene);
        assert_eq!(decision.tier, Some(Tier::One));
        assert_eq!(decision.message, TIER1_MESSAGE);
        assert_eq!(decision.reason, InterventionReason::PersistentConfusion);

        let again = engine.evaluate_at(&history, &state, T0 + 1);
        assert!(!again.should_intervene);
        assert_eq!(again.reason, InterventionReason::Tier1Cooldown);

        let later = engine.evaluate_at(&history, &state, T0 + 60_000);
        assert!(later.should_intervene);
    }

    #[test]
    fn test_insufficient_history() {
        let mut engine = InterventionEngine::default();
        let history = vec![p(Emotion::Confused, 0.7, T0)];
        let decision = engine.evaluate_at(&history, &state_for(&history), T0);
        assert!(!decision.should_intervene);
        assert_eq!(decision.reason, InterventionReason::InsufficientHistory);
        assert_eq!(decision.tier, None);
    }

    #[test]
    fn test_span_outside_window() {
        let mut engine = InterventionEngine::default();
        let history = vec![
            p(Emotion::Confused, 0.7, T0 - 20_000),
            p(Emotion::Bored, 0.7, T0 - 10_000),
            p(Emotion::Confused, 0.7, T0),
        ];
        let decision = engine.evaluate_at(&history, &state_for(&history), T0);
        assert_eq!(decision.reason, InterventionReason::TimeRangeOutside1To3Minutes);
    }

    #[test]
    fn test_tier2_takes_priority() {
        let mut engine = InterventionEngine::default();
        let history: Vec<_> = (0..6).map(|i| p(Emotion::Bored, 0.7, T0 - 150_000 + i * 30_000)).collect();
        let now = history.last().unwrap().timestamp;
        let decision = engine.evaluate_at(&history, &state_for(&history), now);
        assert_eq!(decision.tier, Some(Tier::Two));
        assert_eq!(decision.reason, InterventionReason::ProlongedDisengagement);
        assert!(decision.message.contains("break"));
    }

    #[test]
    fn test_escalation_after_tier1() {
        let mut engine = InterventionEngine::default();
        let history = confusion_history(T0);
        engine.evaluate_at(&history, &state_for(&history), T0);
        assert_eq!(engine.phase(), TierPhase::Tier1Cooldown);

        let bored: Vec<_> = (0..6).map(|i| p(Emotion::Tired, 0.7, T0 + i * 20_000)).collect();
        let now = bored.last().unwrap().timestamp;
        let decision = engine.evaluate_at(&bored, &state_for(&bored), now);
        assert_eq!(decision.tier, Some(Tier::Two));
        assert_eq!(decision.reason, InterventionReason::EscalationFromTier1);
    }

    #[test]
    fn test_accepted_response_resets_cooldowns() {
        let mut engine = InterventionEngine::default();
        let history = confusion_history(T0);
        let state = state_for(&history);
        assert!(engine.evaluate_at(&history, &state, T0).should_intervene);

        engine.record_response_at(Tier::One, true, Emotion::Confused, 0.8, T0 + 1);
        assert_eq!(engine.last_trigger_ms(Tier::One), 0);
        assert_eq!(engine.phase(), TierPhase::Idle);
        assert!(engine.evaluate_at(&history, &state, T0 + 2).should_intervene);
    }

    #[test]
    fn test_accepted_response_lifts_tier2_cooldown() {
        let mut engine = InterventionEngine::default();
        let history: Vec<_> = (0..6).map(|i| p(Emotion::Tired, 0.7, T0 - 150_000 + i * 30_000)).collect();
        let state = state_for(&history);
        let now = history.last().unwrap().timestamp;

        let first = engine.evaluate_at(&history, &state, now);
        assert_eq!(first.tier, Some(Tier::Two));
        assert!(!engine.evaluate_at(&history, &state, now + 1_000).should_intervene);

        engine.record_response_at(Tier::Two, true, Emotion::Tired, 0.7, now + 2_000);
        assert_eq!(engine.last_trigger_ms(Tier::One), 0);
        assert_eq!(engine.last_trigger_ms(Tier::Two), 0);

        // still well inside the 120s tier-2 cooldown of the first trigger
        let again = engine.evaluate_at(&history, &state, now + 3_000);
        assert!(again.should_intervene);
        assert_eq!(again.tier, Some(Tier::Two));
        assert_eq!(again.reason, InterventionReason::ProlongedDisengagement);
    }

    #[test]
    fn test_dismissed_response_keeps_cooldown() {
        let mut engine = InterventionEngine::default();
        let history = confusion_history(T0);
        let state = state_for(&history);
        engine.evaluate_at(&history, &state, T0);
        engine.record_response_at(Tier::One, false, Emotion::Confused, 0.8, T0 + 1);
        assert_eq!(engine.last_trigger_ms(Tier::One), T0);
        assert!(!engine.evaluate_at(&history, &state, T0 + 2).should_intervene);
    }

    #[test]
    fn test_effectiveness_stats() {
        let mut engine = InterventionEngine::default();
        assert_eq!(engine.effectiveness_stats().overall_acceptance_rate, 0.0);

        engine.record_response_at(Tier::One, true, Emotion::Confused, 0.8, T0);
        engine.record_response_at(Tier::One, false, Emotion::Confused, 0.8, T0);
        engine.record_response_at(Tier::Two, false, Emotion::Tired, 0.7, T0);
        engine.record_response_at(Tier::Two, false, Emotion::Tired, 0.7, T0);

        let stats = engine.effectiveness_stats();
        assert!((stats.tier1_acceptance_rate - 50.0).abs() < 1e-9);
        assert_eq!(stats.tier2_acceptance_rate, 0.0);
        assert!((stats.overall_acceptance_rate - 25.0).abs() < 1e-9);
        assert_eq!(stats.total_responses, 4);
    }

    #[test]
    fn test_response_history_capped() {
        let mut engine = InterventionEngine::default();
        for i in 0..60 {
            engine.record_response_at(Tier::One, false, Emotion::Bored, 0.6, T0 + i);
        }
        let responses = engine.responses();
        assert_eq!(responses.len(), 50);
        assert_eq!(responses[0].timestamp, T0 + 10);
    }

    #[test]
    fn test_tier_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Tier::Two).unwrap(), "2");
        assert_eq!(
            serde_json::to_string(&InterventionReason::TimeRangeOutside1To3Minutes).unwrap(),
            "\"time_range_outside_1_3_minutes\""
        );
    }
}

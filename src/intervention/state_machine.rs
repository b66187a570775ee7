use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Escalation phase of the intervention tiers since the last accepted response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierPhase {
    Idle,
    Tier1Cooldown,
    Tier2Cooldown,
}

impl TierPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            TierPhase::Idle => "IDLE",
            TierPhase::Tier1Cooldown => "TIER1_COOLDOWN",
            TierPhase::Tier2Cooldown => "TIER2_COOLDOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierEvent {
    Tier1Fired,
    Tier2Fired,
    Tier1Dismissed,
    Tier2Dismissed,
    Accepted,
    Reset,
}

/// When a tier-2 trigger counts as an escalation of an earlier tier-1 prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPolicy {
    /// Any tier-1 trigger since the last accepted response.
    #[default]
    AfterTier1Trigger,
    /// The learner must also have dismissed that tier-1 prompt.
    AfterTier1Dismissal,
}

impl FromStr for EscalationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "after_tier1_trigger" | "trigger" => Ok(Self::AfterTier1Trigger),
            "after_tier1_dismissal" | "dismissal" => Ok(Self::AfterTier1Dismissal),
            other => Err(format!("unknown escalation policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierTransition {
    pub from: TierPhase,
    pub to: TierPhase,
    pub event: TierEvent,
    pub escalation: bool,
    pub timestamp_ms: i64,
}

const HISTORY_LIMIT: usize = 100;

/// Transition table. Every (phase, event) pair is defined.
const fn next_phase(phase: TierPhase, event: TierEvent) -> TierPhase {
    match (phase, event) {
        (_, TierEvent::Accepted) | (_, TierEvent::Reset) => TierPhase::Idle,
        (_, TierEvent::Tier1Fired) => TierPhase::Tier1Cooldown,
        (_, TierEvent::Tier2Fired) => TierPhase::Tier2Cooldown,
        (current, TierEvent::Tier1Dismissed) | (current, TierEvent::Tier2Dismissed) => current,
    }
}

#[derive(Debug)]
pub struct TierStateMachine {
    current: TierPhase,
    policy: EscalationPolicy,
    tier1_dismissed: bool,
    history: Vec<TierTransition>,
}

impl TierStateMachine {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self {
            current: TierPhase::Idle,
            policy,
            tier1_dismissed: false,
            history: Vec::new(),
        }
    }

    pub fn phase(&self) -> TierPhase {
        self.current
    }

    pub fn policy(&self) -> EscalationPolicy {
        self.policy
    }

    pub fn history(&self) -> &[TierTransition] {
        &self.history
    }

    /// Whether a tier-2 trigger fired now would be an escalation.
    pub fn would_escalate(&self) -> bool {
        if self.current != TierPhase::Tier1Cooldown {
            return false;
        }
        match self.policy {
            EscalationPolicy::AfterTier1Trigger => true,
            EscalationPolicy::AfterTier1Dismissal => self.tier1_dismissed,
        }
    }

    pub fn apply(&mut self, event: TierEvent, timestamp_ms: i64) -> &TierTransition {
        let from = self.current;
        let to = next_phase(from, event);
        let escalation = event == TierEvent::Tier2Fired && self.would_escalate();

        match event {
            TierEvent::Tier1Dismissed if from == TierPhase::Tier1Cooldown => self.tier1_dismissed = true,
            TierEvent::Tier1Dismissed | TierEvent::Tier2Dismissed => {}
            _ => self.tier1_dismissed = false,
        }
        self.current = to;

        self.history.push(TierTransition {
            from,
            to,
            event,
            escalation,
            timestamp_ms,
        });
        if self.history.len() > HISTORY_LIMIT {
            let extra = self.history.len() - HISTORY_LIMIT;
            self.history.drain(0..extra);
        }

        // history is non-empty: pushed just above
        &self.history[self.history.len() - 1]
    }

    pub fn reset(&mut self) {
        self.current = TierPhase::Idle;
        self.tier1_dismissed = false;
        self.history.clear();
    }
}

impl Default for TierStateMachine {
    fn default() -> Self {
        Self::new(EscalationPolicy::default())
    }
}

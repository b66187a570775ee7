pub mod engine;
pub mod state_machine;

pub use engine::{
    EffectivenessStats, InterventionAnalytics, InterventionDecision, InterventionEngine,
    InterventionReason, InterventionResponse, Tier, TierCounters, ESCALATION_MESSAGE,
    TIER1_MESSAGE, TIER2_MESSAGE,
};
pub use state_machine::{EscalationPolicy, TierEvent, TierPhase, TierStateMachine, TierTransition};

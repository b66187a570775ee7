use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::emotion::{EmotionPrediction, EmotionState};
use crate::intervention::InterventionDecision;
use crate::visibility::{VisibilityIssue, VisibilityIssueType};

const CHANNEL_CAPACITY: usize = 256;

/// Everything the UI collaborator can subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AffectEvent {
    #[serde(rename = "EMOTION_STATE_UPDATED")]
    EmotionStateUpdated(EmotionState),

    #[serde(rename = "PREDICTION_REJECTED")]
    PredictionRejected(PredictionRejectedPayload),

    #[serde(rename = "INTERVENTION_TRIGGERED")]
    InterventionTriggered(InterventionDecision),

    #[serde(rename = "VISIBILITY_ISSUE_RAISED")]
    VisibilityIssueRaised(VisibilityIssue),

    #[serde(rename = "VISIBILITY_ISSUE_CLEARED")]
    VisibilityIssueCleared(VisibilityClearedPayload),

    #[serde(rename = "CLOUD_PREDICTION_APPLIED")]
    CloudPredictionApplied(EmotionPrediction),
}

impl AffectEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            AffectEvent::EmotionStateUpdated(_) => "EMOTION_STATE_UPDATED",
            AffectEvent::PredictionRejected(_) => "PREDICTION_REJECTED",
            AffectEvent::InterventionTriggered(_) => "INTERVENTION_TRIGGERED",
            AffectEvent::VisibilityIssueRaised(_) => "VISIBILITY_ISSUE_RAISED",
            AffectEvent::VisibilityIssueCleared(_) => "VISIBILITY_ISSUE_CLEARED",
            AffectEvent::CloudPredictionApplied(_) => "CLOUD_PREDICTION_APPLIED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRejectedPayload {
    pub reason: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityClearedPayload {
    #[serde(rename = "type")]
    pub issue_type: VisibilityIssueType,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: String,
    pub session_id: String,
    pub event: AffectEvent,
    pub created_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(session_id: &str, event: AffectEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            event,
            created_at: Utc::now(),
        }
    }
}

struct Subscriber {
    event_types: Vec<&'static str>,
    sender: broadcast::Sender<EventEnvelope>,
}

/// Fan-out of session events. Publishing never blocks and never fails when
/// nobody listens.
pub struct EventBus {
    session_id: String,
    global_sender: broadcast::Sender<EventEnvelope>,
    filtered: RwLock<Vec<Subscriber>>,
    event_count: AtomicU64,
}

impl EventBus {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (global_sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            session_id: session_id.into(),
            global_sender,
            filtered: RwLock::new(Vec::new()),
            event_count: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: AffectEvent) {
        let envelope = EventEnvelope::new(&self.session_id, event);
        let event_type = envelope.event.event_type();
        self.event_count.fetch_add(1, Ordering::Relaxed);

        let mut sent_count = 0usize;
        {
            let mut subscribers = self.filtered.write();
            subscribers.retain(|s| s.sender.receiver_count() > 0);
            for subscriber in subscribers.iter() {
                if subscriber.event_types.contains(&event_type) && subscriber.sender.send(envelope.clone()).is_ok() {
                    sent_count += 1;
                }
            }
        }

        if self.global_sender.send(envelope).is_err() {
            debug!(event_type, "no global subscribers for event");
        }

        debug!(event_type, sent_to = sent_count, "event published");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.global_sender.subscribe()
    }

    pub fn subscribe_filtered(&self, event_types: &[&'static str]) -> broadcast::Receiver<EventEnvelope> {
        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        self.filtered.write().push(Subscriber {
            event_types: event_types.to_vec(),
            sender,
        });
        receiver
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            total_events: self.event_count.load(Ordering::Relaxed),
            global_subscribers: self.global_sender.receiver_count(),
            filtered_subscribers: self.filtered.read().len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBusStats {
    pub total_events: u64,
    pub global_subscribers: usize,
    pub filtered_subscribers: usize,
}

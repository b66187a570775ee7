use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::{AffectConfig, ConfigError};
use crate::emotion::{
    EmotionPrediction, EmotionState, PredictionSource, TemporalStateEngine, TemporalStatistics,
};
use crate::events::{
    AffectEvent, EventBus, EventBusStats, EventEnvelope, PredictionRejectedPayload, VisibilityClearedPayload,
};
use crate::intervention::{
    EffectivenessStats, InterventionAnalytics, InterventionDecision, InterventionEngine, Tier, TierPhase,
};
use crate::recalibration::{
    CalibrationSample, CalibrationStatistics, CalibrationTransport, HttpTransport, RecalibrationService,
    SampleProvider, SampleSlot,
};
use crate::store::{get_json, set_json, KeyValueStore, StoreResult};
use crate::visibility::{VisibilityIssue, VisibilityMonitor, VisibilitySignal, VisibilityState};

pub const ANALYTICS_KEY: &str = "affect.intervention_analytics";
pub const RECALIBRATION_ENABLED_KEY: &str = "affect.recalibration_enabled";

/// One capture-loop tick: the raw frame, the on-device prediction for it (if
/// the model produced one) and the face detector's visibility signal (if the
/// detector ran on this frame).
#[derive(Debug, Clone, Default)]
pub struct CapturedFrame {
    pub image: Vec<u8>,
    pub prediction: Option<EmotionPrediction>,
    pub visibility: Option<VisibilitySignal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameOutcome {
    /// Updated state, or `None` when the prediction was missing, rejected, or
    /// tracking is paused by a long visibility episode.
    pub state: Option<EmotionState>,
    pub visibility_issue: Option<VisibilityIssue>,
    pub tracking_paused: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub emotion_state: EmotionState,
    pub window: TemporalStatistics,
    pub intervention_phase: TierPhase,
    pub intervention_stats: EffectivenessStats,
    pub visibility: VisibilityState,
    pub recalibration: CalibrationStatistics,
    pub recalibration_running: bool,
    pub events: EventBusStats,
}

/// Per-learning-session owner of the emotion pipeline. Construct one per
/// session and drive it from the capture loop.
pub struct SessionContext<T: CalibrationTransport = HttpTransport> {
    session_id: String,
    config: AffectConfig,
    temporal: TemporalStateEngine,
    intervention: InterventionEngine,
    visibility: VisibilityMonitor,
    recalibration: Arc<RecalibrationService<T>>,
    samples: Arc<SampleSlot>,
    cloud_tx: mpsc::UnboundedSender<EmotionPrediction>,
    cloud_rx: mpsc::UnboundedReceiver<EmotionPrediction>,
    events: EventBus,
    store: Arc<dyn KeyValueStore>,
}

impl SessionContext<HttpTransport> {
    /// Fails when `config` does not pass validation.
    pub fn new(config: AffectConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        let service = RecalibrationService::from_config(config.recalibration.clone())?;
        Ok(Self::with_service(config, service, store))
    }
}

impl<T: CalibrationTransport> SessionContext<T> {
    pub fn with_transport(
        config: AffectConfig,
        transport: T,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let service = RecalibrationService::new(config.recalibration.clone(), transport)?;
        Ok(Self::with_service(config, service, store))
    }

    fn with_service(config: AffectConfig, service: RecalibrationService<T>, store: Arc<dyn KeyValueStore>) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (cloud_tx, cloud_rx) = mpsc::unbounded_channel();
        info!(session_id = %session_id, "affect session created");

        Self {
            events: EventBus::new(session_id.clone()),
            temporal: TemporalStateEngine::new(config.temporal.clone()),
            intervention: InterventionEngine::new(config.intervention.clone()),
            visibility: VisibilityMonitor::new(config.visibility.clone()),
            recalibration: Arc::new(service),
            samples: Arc::new(SampleSlot::default()),
            cloud_tx,
            cloud_rx,
            session_id,
            config,
            store,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &AffectConfig {
        &self.config
    }

    pub fn temporal(&self) -> &TemporalStateEngine {
        &self.temporal
    }

    pub fn intervention(&self) -> &InterventionEngine {
        &self.intervention
    }

    pub fn visibility(&self) -> &VisibilityMonitor {
        &self.visibility
    }

    pub fn recalibration(&self) -> &Arc<RecalibrationService<T>> {
        &self.recalibration
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn observe_frame(&mut self, frame: CapturedFrame) -> FrameOutcome {
        self.observe_frame_at(frame, Utc::now().timestamp_millis())
    }

    /// Runs the visibility check, feeds the prediction to the temporal engine
    /// and offers the frame to the recalibration loop.
    pub fn observe_frame_at(&mut self, frame: CapturedFrame, now_ms: i64) -> FrameOutcome {
        let visibility_issue = match &frame.visibility {
            Some(signal) => self.check_visibility(signal, now_ms),
            None => self.visibility.active_issue().cloned(),
        };
        let tracking_paused = self.visibility.should_pause_emotion_tracking_at(now_ms);

        let state = match frame.prediction {
            Some(_) if tracking_paused => {
                debug!("emotion tracking paused by visibility issue");
                None
            }
            Some(prediction) => {
                let state = self.submit_prediction(prediction.clone());
                if state.is_some() && prediction.source == PredictionSource::Local && !frame.image.is_empty() {
                    self.samples.store(CalibrationSample {
                        frame: frame.image,
                        prediction,
                        session_id: self.session_id.clone(),
                    });
                }
                state
            }
            None => None,
        };

        FrameOutcome {
            state,
            visibility_issue,
            tracking_paused,
        }
    }

    fn check_visibility(&mut self, signal: &VisibilitySignal, now_ms: i64) -> Option<VisibilityIssue> {
        let previous = self.visibility.state();
        let current = self.visibility.check_at(signal, now_ms);

        let previous_type = previous.active_issue.as_ref().map(|i| i.issue_type);
        let current_type = current.as_ref().map(|i| i.issue_type);
        if previous_type == current_type {
            return current;
        }

        if let Some(issue_type) = previous_type {
            let started = previous.issue_started_at.unwrap_or(now_ms);
            self.events
                .publish(AffectEvent::VisibilityIssueCleared(VisibilityClearedPayload {
                    issue_type,
                    duration_ms: (now_ms - started).max(0),
                }));
        }
        if let Some(issue) = &current {
            self.events.publish(AffectEvent::VisibilityIssueRaised(issue.clone()));
        }
        current
    }

    /// Inserts a prediction in arrival order. Local confidences are corrected
    /// by the active recalibration adjustment when enabled.
    pub fn submit_prediction(&mut self, mut prediction: EmotionPrediction) -> Option<EmotionState> {
        if prediction.source == PredictionSource::Local && self.config.recalibration.apply_confidence_adjustment {
            prediction.confidence = self.recalibration.adjusted_confidence(prediction.confidence);
        }

        let timestamp = prediction.timestamp;
        match self.temporal.add_prediction(prediction) {
            Ok(state) => {
                self.events.publish(AffectEvent::EmotionStateUpdated(state.clone()));
                Some(state)
            }
            Err(e) => {
                self.events.publish(AffectEvent::PredictionRejected(PredictionRejectedPayload {
                    reason: e.to_string(),
                    timestamp,
                }));
                None
            }
        }
    }

    pub fn evaluate_intervention(&mut self) -> InterventionDecision {
        self.evaluate_intervention_at(Utc::now().timestamp_millis())
    }

    pub fn evaluate_intervention_at(&mut self, now_ms: i64) -> InterventionDecision {
        let history = self.temporal.history();
        let state = self.temporal.state();
        let decision = self.intervention.evaluate_at(&history, &state, now_ms);
        if decision.should_intervene {
            self.events.publish(AffectEvent::InterventionTriggered(decision.clone()));
        }
        decision
    }

    pub fn record_intervention_response(&mut self, tier: Tier, accepted: bool) {
        self.record_intervention_response_at(tier, accepted, Utc::now().timestamp_millis());
    }

    /// Records the learner's answer against the current emotion state.
    pub fn record_intervention_response_at(&mut self, tier: Tier, accepted: bool, now_ms: i64) {
        let state = self.temporal.state();
        self.intervention
            .record_response_at(tier, accepted, state.current_emotion, state.confidence_score, now_ms);
    }

    /// Folds every cloud prediction received so far into the window.
    pub fn drain_cloud_predictions(&mut self) -> Vec<EmotionState> {
        let mut states = Vec::new();
        while let Ok(prediction) = self.cloud_rx.try_recv() {
            self.events.publish(AffectEvent::CloudPredictionApplied(prediction.clone()));
            if let Some(state) = self.submit_prediction(prediction) {
                states.push(state);
            }
        }
        states
    }

    /// Requires a tokio runtime. Returns false when disabled or already running.
    pub fn start_recalibration(&self) -> bool {
        let provider: Arc<dyn SampleProvider> = self.samples.clone();
        self.recalibration.start(provider, self.cloud_tx.clone())
    }

    pub fn stop_recalibration(&self) {
        self.recalibration.stop();
    }

    pub fn set_recalibration_enabled(&self, enabled: bool) -> StoreResult<()> {
        self.recalibration.set_enabled(enabled);
        set_json(self.store.as_ref(), RECALIBRATION_ENABLED_KEY, &enabled)
    }

    pub fn persist_analytics(&self) -> StoreResult<()> {
        let analytics = self.intervention.analytics();
        set_json(self.store.as_ref(), ANALYTICS_KEY, &analytics)?;
        debug!(responses = analytics.responses.len(), "intervention analytics persisted");
        Ok(())
    }

    /// Loads persisted analytics and the recalibration toggle. Returns whether
    /// any analytics were found.
    pub fn restore_analytics(&mut self) -> StoreResult<bool> {
        if let Some(enabled) = get_json::<bool>(self.store.as_ref(), RECALIBRATION_ENABLED_KEY)? {
            self.recalibration.set_enabled(enabled);
        }

        match get_json::<InterventionAnalytics>(self.store.as_ref(), ANALYTICS_KEY)? {
            Some(analytics) => {
                info!(responses = analytics.responses.len(), "intervention analytics restored");
                self.intervention.restore_analytics(analytics);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            emotion_state: self.temporal.state(),
            window: self.temporal.statistics(),
            intervention_phase: self.intervention.phase(),
            intervention_stats: self.intervention.effectiveness_stats(),
            visibility: self.visibility.state(),
            recalibration: self.recalibration.statistics(),
            recalibration_running: self.recalibration.is_running(),
            events: self.events.stats(),
        }
    }

    /// Clears all per-session state. A running recalibration schedule keeps
    /// running, and any in-flight result is discarded.
    pub fn reset(&mut self) {
        self.temporal.reset();
        self.intervention.reset();
        self.visibility.reset();
        self.recalibration.reset();
        self.samples.clear();

        let mut discarded = 0usize;
        while self.cloud_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "dropped undelivered cloud predictions on reset");
        }
        info!(session_id = %self.session_id, "affect session reset");
    }
}

impl<T: CalibrationTransport> Drop for SessionContext<T> {
    fn drop(&mut self) {
        self.recalibration.stop();
    }
}

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use danci_affect::config::RecalibrationConfig;
use danci_affect::emotion::{Emotion, EmotionPrediction, EmotionScores};
use danci_affect::recalibration::{
    CalibrationRequest, CalibrationResponse, CalibrationTransport, RecalibrationError,
};
use danci_affect::visibility::{Point3D, VisibilitySignal};

pub const FIXED_TIMESTAMP: i64 = 1_700_000_000_000;

pub fn prediction(emotion: Emotion, confidence: f64, timestamp: i64) -> EmotionPrediction {
    EmotionPrediction::local(emotion, EmotionScores::peaked(emotion, 0.7), confidence, timestamp)
}

pub fn visible_signal() -> VisibilitySignal {
    let landmarks: HashMap<usize, Point3D> = [33, 133, 159, 145, 362, 263, 386, 374]
        .into_iter()
        .map(|i| (i, Point3D { x: 0.4, y: 0.5, z: 0.0 }))
        .collect();
    VisibilitySignal {
        face_detected: true,
        landmarks: Some(landmarks),
        detection_confidence: 0.95,
    }
}

pub fn no_face_signal() -> VisibilitySignal {
    VisibilitySignal {
        face_detected: false,
        landmarks: None,
        detection_confidence: 0.0,
    }
}

pub fn fast_recalibration() -> RecalibrationConfig {
    RecalibrationConfig {
        min_interval: Duration::from_secs(30),
        max_interval: Duration::from_secs(60),
        retry_delay: Duration::from_millis(100),
        ..Default::default()
    }
}

pub fn cloud_reply(emotion: Emotion, confidence: f64) -> Result<CalibrationResponse, RecalibrationError> {
    Ok(CalibrationResponse {
        emotion,
        probabilities: EmotionScores::peaked(emotion, 0.7),
        confidence,
        calibration_needed: true,
        confidence_adjustment: None,
    })
}

/// In-process stand-in for the cloud endpoint. Replies are consumed in order;
/// once exhausted every call fails as if offline.
#[derive(Default)]
pub struct MockBackend {
    replies: Mutex<VecDeque<Result<CalibrationResponse, RecalibrationError>>>,
    requests: Mutex<Vec<CalibrationRequest>>,
    latency: Mutex<Duration>,
    reachable: AtomicBool,
    calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        backend.reachable.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    pub fn push(&self, reply: Result<CalibrationResponse, RecalibrationError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CalibrationRequest> {
        self.requests.lock().clone()
    }
}

#[derive(Clone)]
pub struct MockTransport(pub Arc<MockBackend>);

impl CalibrationTransport for MockTransport {
    async fn send(&self, request: CalibrationRequest) -> Result<CalibrationResponse, RecalibrationError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        self.0.requests.lock().push(request);
        let latency = *self.0.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.0.reachable.load(Ordering::SeqCst) {
            return Err(RecalibrationError::Offline);
        }
        self.0.replies.lock().pop_front().unwrap_or(Err(RecalibrationError::Offline))
    }

    async fn probe(&self) -> bool {
        self.0.reachable.load(Ordering::SeqCst)
    }
}

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::VisibilityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

// MediaPipe Face Mesh: eye corners and mid upper/lower lid per eye
const LEFT_EYE_PAIRS: [(usize, usize); 2] = [(33, 133), (159, 145)];
const RIGHT_EYE_PAIRS: [(usize, usize); 2] = [(362, 263), (386, 374)];

/// Per-frame visibility input from the face detector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilitySignal {
    pub face_detected: bool,
    #[serde(default)]
    pub landmarks: Option<HashMap<usize, Point3D>>,
    #[serde(default)]
    pub detection_confidence: f64,
}

impl VisibilitySignal {
    fn eyes_visible(&self) -> bool {
        let Some(landmarks) = &self.landmarks else {
            return false;
        };
        LEFT_EYE_PAIRS
            .iter()
            .chain(RIGHT_EYE_PAIRS.iter())
            .all(|(a, b)| landmarks.contains_key(a) && landmarks.contains_key(b))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityIssueType {
    NoFace,
    PoorLighting,
    EyesNotVisible,
}

impl VisibilityIssueType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoFace => "no_face",
            Self::PoorLighting => "poor_lighting",
            Self::EyesNotVisible => "eyes_not_visible",
        }
    }

    pub const fn severity(self) -> IssueSeverity {
        match self {
            Self::NoFace => IssueSeverity::High,
            Self::PoorLighting => IssueSeverity::Medium,
            Self::EyesNotVisible => IssueSeverity::Low,
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::NoFace => "No face detected. Please position yourself in front of the camera.",
            Self::PoorLighting => "Lighting looks too dim. Try moving somewhere brighter.",
            Self::EyesNotVisible => "Your eyes aren't clearly visible. Check for glare or obstructions.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityIssue {
    #[serde(rename = "type")]
    pub issue_type: VisibilityIssueType,
    pub message: String,
    pub severity: IssueSeverity,
    pub consecutive_frames: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityState {
    pub no_face_frames: u32,
    pub poor_lighting_frames: u32,
    pub no_eyes_frames: u32,
    pub active_issue: Option<VisibilityIssue>,
    pub issue_started_at: Option<i64>,
}

/// Debounced detector for camera conditions that make emotion inference unreliable.
pub struct VisibilityMonitor {
    config: VisibilityConfig,
    no_face: u32,
    poor_lighting: u32,
    no_eyes: u32,
    active: Option<VisibilityIssue>,
    episode_start: Option<i64>,
    last_check_ms: i64,
}

impl VisibilityMonitor {
    pub fn new(config: VisibilityConfig) -> Self {
        Self {
            config,
            no_face: 0,
            poor_lighting: 0,
            no_eyes: 0,
            active: None,
            episode_start: None,
            last_check_ms: 0,
        }
    }

    pub fn check(&mut self, signal: &VisibilitySignal) -> Option<VisibilityIssue> {
        self.check_at(signal, Utc::now().timestamp_millis())
    }

    pub fn check_at(&mut self, signal: &VisibilitySignal, now_ms: i64) -> Option<VisibilityIssue> {
        self.last_check_ms = now_ms;

        if !signal.face_detected {
            self.no_face += 1;
            self.clear_counter(VisibilityIssueType::PoorLighting);
            self.clear_counter(VisibilityIssueType::EyesNotVisible);
            return self.raise_if_due(VisibilityIssueType::NoFace, now_ms);
        }
        self.clear_counter(VisibilityIssueType::NoFace);

        if signal.detection_confidence < self.config.min_detection_confidence {
            self.poor_lighting += 1;
            return self.raise_if_due(VisibilityIssueType::PoorLighting, now_ms);
        }
        self.clear_counter(VisibilityIssueType::PoorLighting);

        if !signal.eyes_visible() {
            self.no_eyes += 1;
            return self.raise_if_due(VisibilityIssueType::EyesNotVisible, now_ms);
        }
        self.clear_counter(VisibilityIssueType::EyesNotVisible);

        None
    }

    fn counter(&self, issue_type: VisibilityIssueType) -> u32 {
        match issue_type {
            VisibilityIssueType::NoFace => self.no_face,
            VisibilityIssueType::PoorLighting => self.poor_lighting,
            VisibilityIssueType::EyesNotVisible => self.no_eyes,
        }
    }

    fn clear_counter(&mut self, issue_type: VisibilityIssueType) {
        match issue_type {
            VisibilityIssueType::NoFace => self.no_face = 0,
            VisibilityIssueType::PoorLighting => self.poor_lighting = 0,
            VisibilityIssueType::EyesNotVisible => self.no_eyes = 0,
        }

        if self.active.as_ref().is_some_and(|issue| issue.issue_type == issue_type) {
            info!(issue = issue_type.as_str(), "visibility issue resolved");
            self.active = None;
            self.episode_start = None;
        }
    }

    fn raise_if_due(&mut self, issue_type: VisibilityIssueType, now_ms: i64) -> Option<VisibilityIssue> {
        let frames = self.counter(issue_type);
        if frames < self.config.consecutive_frame_threshold {
            debug!(issue = issue_type.as_str(), frames, "visibility check failing");
            return self.active.clone();
        }

        match &mut self.active {
            Some(issue) if issue.issue_type == issue_type => {
                issue.consecutive_frames = frames;
            }
            _ => {
                info!(issue = issue_type.as_str(), frames, "visibility issue raised");
                self.active = Some(VisibilityIssue {
                    issue_type,
                    message: issue_type.message().to_string(),
                    severity: issue_type.severity(),
                    consecutive_frames: frames,
                    timestamp: now_ms,
                });
                self.episode_start = Some(now_ms);
            }
        }

        self.active.clone()
    }

    pub fn active_issue(&self) -> Option<&VisibilityIssue> {
        self.active.as_ref()
    }

    /// Length of the unresolved episode as of the latest check.
    pub fn episode_duration_ms(&self) -> i64 {
        self.episode_start
            .map(|start| (self.last_check_ms - start).max(0))
            .unwrap_or(0)
    }

    pub fn should_pause_emotion_tracking(&self) -> bool {
        self.should_pause_emotion_tracking_at(self.last_check_ms)
    }

    pub fn should_pause_emotion_tracking_at(&self, now_ms: i64) -> bool {
        match self.episode_start {
            Some(start) => now_ms - start >= self.config.pause_after.as_millis() as i64,
            None => false,
        }
    }

    pub fn state(&self) -> VisibilityState {
        VisibilityState {
            no_face_frames: self.no_face,
            poor_lighting_frames: self.poor_lighting,
            no_eyes_frames: self.no_eyes,
            active_issue: self.active.clone(),
            issue_started_at: self.episode_start,
        }
    }

    pub fn reset(&mut self) {
        self.no_face = 0;
        self.poor_lighting = 0;
        self.no_eyes = 0;
        self.active = None;
        self.episode_start = None;
        self.last_check_ms = 0;
    }
}

impl Default for VisibilityMonitor {
    fn default() -> Self {
        Self::new(VisibilityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eye_landmarks() -> HashMap<usize, Point3D> {
        [33, 133, 159, 145, 362, 263, 386, 374]
            .into_iter()
            .map(|i| (i, Point3D { x: 0.5, y: 0.5, z: 0.0 }))
            .collect()
    }

    fn good() -> VisibilitySignal {
        VisibilitySignal {
            face_detected: true,
            landmarks: Some(eye_landmarks()),
            detection_confidence: 0.9,
        }
    }

    fn no_face() -> VisibilitySignal {
        VisibilitySignal::default()
    }

    #[test]
    fn test_no_face_debounce_and_clear() {
        let mut monitor = VisibilityMonitor::default();
        assert!(monitor.check_at(&no_face(), 0).is_none());
        assert!(monitor.check_at(&no_face(), 100).is_none());
        let issue = monitor.check_at(&no_face(), 200).unwrap();
        assert_eq!(issue.issue_type, VisibilityIssueType::NoFace);
        assert_eq!(issue.consecutive_frames, 3);
        assert_eq!(issue.severity, IssueSeverity::High);

        assert!(monitor.check_at(&good(), 300).is_none());
        assert_eq!(monitor.state().no_face_frames, 0);
        assert_eq!(monitor.state().issue_started_at, None);
    }

    #[test]
    fn test_poor_lighting() {
        let mut monitor = VisibilityMonitor::default();
        let dim = VisibilitySignal {
            detection_confidence: 0.2,
            ..good()
        };
        for ts in 0..2 {
            assert!(monitor.check_at(&dim, ts).is_none());
        }
        let issue = monitor.check_at(&dim, 2).unwrap();
        assert_eq!(issue.issue_type, VisibilityIssueType::PoorLighting);
    }

    #[test]
    fn test_missing_eye_landmarks() {
        let mut monitor = VisibilityMonitor::default();
        let mut landmarks = eye_landmarks();
        landmarks.remove(&386);
        let partial = VisibilitySignal {
            landmarks: Some(landmarks),
            ..good()
        };
        for ts in 0..3 {
            monitor.check_at(&partial, ts);
        }
        assert_eq!(
            monitor.active_issue().map(|i| i.issue_type),
            Some(VisibilityIssueType::EyesNotVisible)
        );

        let absent = VisibilitySignal {
            landmarks: None,
            ..good()
        };
        assert!(monitor.check_at(&absent, 4).is_some());
    }

    #[test]
    fn test_no_face_resets_other_counters() {
        let mut monitor = VisibilityMonitor::default();
        let dim = VisibilitySignal {
            detection_confidence: 0.1,
            ..good()
        };
        monitor.check_at(&dim, 0);
        monitor.check_at(&dim, 1);
        monitor.check_at(&no_face(), 2);
        let state = monitor.state();
        assert_eq!(state.poor_lighting_frames, 0);
        assert_eq!(state.no_face_frames, 1);
    }

    #[test]
    fn test_issue_switch_replaces_active() {
        let mut monitor = VisibilityMonitor::default();
        for ts in 0..3 {
            monitor.check_at(&no_face(), ts);
        }
        let dim = VisibilitySignal {
            detection_confidence: 0.1,
            ..good()
        };
        assert!(monitor.check_at(&dim, 3).is_none());
        monitor.check_at(&dim, 4);
        let issue = monitor.check_at(&dim, 5).unwrap();
        assert_eq!(issue.issue_type, VisibilityIssueType::PoorLighting);
        assert_eq!(monitor.state().issue_started_at, Some(5));
    }

    #[test]
    fn test_pause_after_thirty_seconds() {
        let mut monitor = VisibilityMonitor::default();
        for ts in [0, 1_000, 2_000] {
            monitor.check_at(&no_face(), ts);
        }
        assert!(!monitor.should_pause_emotion_tracking());
        monitor.check_at(&no_face(), 31_999);
        assert!(!monitor.should_pause_emotion_tracking());
        monitor.check_at(&no_face(), 32_000);
        assert!(monitor.should_pause_emotion_tracking());
        assert_eq!(monitor.episode_duration_ms(), 30_000);

        monitor.check_at(&good(), 33_000);
        assert!(!monitor.should_pause_emotion_tracking());
    }
}

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::emotion::{Emotion, EmotionPrediction, EmotionScores};

const PREDICT_PATH: &str = "/api/emotion/predict";
const HEALTH_PATH: &str = "/api/health";
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Body of a recalibration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRequest {
    /// Base64 encoded frame.
    pub image: String,
    pub local_prediction: EmotionPrediction,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResponse {
    pub emotion: Emotion,
    pub probabilities: EmotionScores,
    pub confidence: f64,
    #[serde(default)]
    pub calibration_needed: bool,
    #[serde(default)]
    pub confidence_adjustment: Option<f64>,
}

#[derive(Debug, Error)]
pub enum RecalibrationError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: reqwest::StatusCode, body: String },
    #[error("JSON decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid cloud response: {0}")]
    InvalidResponse(String),
    #[error("backend unreachable")]
    Offline,
}

impl RecalibrationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(_) | Self::Timeout(_) | Self::Offline => true,
            Self::HttpStatus { status, .. } => is_retryable(*status),
            Self::Json(_) | Self::InvalidResponse(_) => false,
        }
    }

    /// Failures that suggest the device has no route to the backend.
    pub fn indicates_offline(&self) -> bool {
        match self {
            Self::Request(e) => e.is_connect() || e.is_timeout(),
            Self::Timeout(_) | Self::Offline => true,
            _ => false,
        }
    }
}

/// Network seam of the recalibration service.
pub trait CalibrationTransport: Send + Sync + 'static {
    fn send(
        &self,
        request: CalibrationRequest,
    ) -> impl Future<Output = Result<CalibrationResponse, RecalibrationError>> + Send;

    /// Cheap reachability check used by the network monitor.
    fn probe(&self) -> impl Future<Output = bool> + Send;
}

#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl CalibrationTransport for HttpTransport {
    fn send(
        &self,
        request: CalibrationRequest,
    ) -> impl Future<Output = Result<CalibrationResponse, RecalibrationError>> + Send {
        let url = format!("{}{PREDICT_PATH}", self.base_url);
        let client = self.client.clone();
        async move {
            let resp = client.post(&url).json(&request).send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(RecalibrationError::HttpStatus { status, body });
            }
            let bytes = resp.bytes().await?;
            match serde_json::from_slice(&bytes) {
                Ok(v) => Ok(v),
                Err(e) => {
                    tracing::error!(error = %e, body = %String::from_utf8_lossy(&bytes), "failed to parse calibration response");
                    Err(RecalibrationError::Json(e))
                }
            }
        }
    }

    fn probe(&self) -> impl Future<Output = bool> + Send {
        let url = format!("{}{HEALTH_PATH}", self.base_url);
        let client = self.client.clone();
        async move {
            match client.get(&url).timeout(PROBE_TIMEOUT).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(_) => false,
            }
        }
    }
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

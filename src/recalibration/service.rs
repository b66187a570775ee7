use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, RecalibrationConfig};
use crate::emotion::{Emotion, EmotionPrediction, PredictionSource};
use crate::recalibration::client::{
    CalibrationRequest, CalibrationResponse, CalibrationTransport, HttpTransport, RecalibrationError,
};
use crate::recalibration::scheduler::ScheduledTask;

/// Frame and local prediction the scheduled loop recalibrates against.
#[derive(Debug, Clone)]
pub struct CalibrationSample {
    pub frame: Vec<u8>,
    pub prediction: EmotionPrediction,
    pub session_id: String,
}

pub trait SampleProvider: Send + Sync + 'static {
    fn latest_sample(&self) -> Option<CalibrationSample>;
}

/// Holds the most recent sample offered by the capture loop.
#[derive(Default)]
pub struct SampleSlot {
    latest: Mutex<Option<CalibrationSample>>,
}

impl SampleSlot {
    pub fn store(&self, sample: CalibrationSample) {
        *self.latest.lock() = Some(sample);
    }

    pub fn clear(&self) {
        *self.latest.lock() = None;
    }
}

impl SampleProvider for SampleSlot {
    fn latest_sample(&self) -> Option<CalibrationSample> {
        self.latest.lock().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRecord {
    pub timestamp: i64,
    pub local_emotion: Emotion,
    pub cloud_emotion: Emotion,
    pub local_confidence: f64,
    pub cloud_confidence: f64,
    pub confidence_adjustment: f64,
    pub reported_adjustment: Option<f64>,
    pub calibration_needed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub is_online: bool,
    pub queued_requests: usize,
    pub consecutive_failures: u32,
    pub current_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationStatistics {
    pub total_attempts: u64,
    pub successful_calibrations: u64,
    pub failed_calibrations: u64,
    pub success_rate: f64,
    pub replayed_requests: u64,
    pub current_adjustment: f64,
    pub last_calibration_at: Option<i64>,
    #[serde(flatten)]
    pub network: NetworkStatus,
}

#[derive(Debug, Clone)]
struct QueuedRequest {
    id: u64,
    request: CalibrationRequest,
    queued_at: i64,
}

struct CalibrationState {
    adjustment: f64,
    history: VecDeque<CalibrationRecord>,
    queue: VecDeque<QueuedRequest>,
    next_queue_id: u64,
    total_attempts: u64,
    successful: u64,
    failed: u64,
    replayed: u64,
    consecutive_failures: u32,
    current_interval: Duration,
    is_online: bool,
    last_calibration_at: Option<i64>,
}

impl CalibrationState {
    fn new(initial_interval: Duration) -> Self {
        Self {
            adjustment: 0.0,
            history: VecDeque::new(),
            queue: VecDeque::new(),
            next_queue_id: 0,
            total_attempts: 0,
            successful: 0,
            failed: 0,
            replayed: 0,
            consecutive_failures: 0,
            current_interval: initial_interval,
            is_online: true,
            last_calibration_at: None,
        }
    }
}

struct RunningTasks {
    schedule: ScheduledTask,
    monitor: ScheduledTask,
}

/// Periodically cross-checks local predictions against the cloud model and
/// keeps a confidence correction. Never surfaces network failures to callers.
pub struct RecalibrationService<T: CalibrationTransport = HttpTransport> {
    config: RecalibrationConfig,
    transport: T,
    enabled: AtomicBool,
    generation: AtomicU64,
    flushing: AtomicBool,
    state: Mutex<CalibrationState>,
    tasks: Mutex<Option<RunningTasks>>,
}

/// Held while a queue replay runs. Released on drop.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RecalibrationService<HttpTransport> {
    pub fn from_config(config: RecalibrationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport = HttpTransport::new(config.backend_url.clone(), config.request_timeout);
        Self::new(config, transport)
    }
}

impl<T: CalibrationTransport> RecalibrationService<T> {
    pub fn new(config: RecalibrationConfig, transport: T) -> Result<Self, ConfigError> {
        config.validate()?;
        let initial = random_interval(&config);
        Ok(Self {
            enabled: AtomicBool::new(config.enabled),
            generation: AtomicU64::new(0),
            flushing: AtomicBool::new(false),
            state: Mutex::new(CalibrationState::new(initial)),
            tasks: Mutex::new(None),
            config,
            transport,
        })
    }

    pub fn config(&self) -> &RecalibrationConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.stop();
        }
        info!(enabled, "recalibration toggled");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// One recalibration round trip. Resolves to the cloud prediction, or
    /// `None` when disabled, unreachable, or superseded by `reset`.
    pub async fn recalibrate(
        &self,
        frame: &[u8],
        local: &EmotionPrediction,
        session_id: &str,
    ) -> Option<EmotionPrediction> {
        if !self.is_enabled() {
            debug!("recalibration disabled, skipping");
            return None;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let request = CalibrationRequest {
            image: STANDARD.encode(frame),
            local_prediction: local.clone(),
            session_id: session_id.to_string(),
        };
        self.state.lock().total_attempts += 1;

        if !self.is_online() {
            if self.transport.probe().await {
                self.set_online(true);
            } else {
                self.record_failure(request, generation, &RecalibrationError::Offline);
                return None;
            }
        }

        let result = match self.send_with_retry(&request).await {
            Ok(response) => self.to_cloud_prediction(&response).map(|p| (response, p)),
            Err(e) => Err(e),
        };

        match result {
            Ok((response, cloud)) => self.record_success(&request.local_prediction, &response, cloud, generation),
            Err(err) => {
                self.record_failure(request, generation, &err);
                None
            }
        }
    }

    async fn send_with_retry(&self, request: &CalibrationRequest) -> Result<CalibrationResponse, RecalibrationError> {
        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = RecalibrationError::Offline;

        for attempt in 0..max_attempts {
            let outcome = tokio::time::timeout(self.config.request_timeout, self.transport.send(request.clone()))
                .await
                .unwrap_or_else(|_| Err(RecalibrationError::Timeout(self.config.request_timeout)));

            match outcome {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if attempt + 1 >= max_attempts || !err.is_retryable() {
                        return Err(err);
                    }
                    let delay = self.retry_delay(attempt);
                    warn!(attempt = attempt + 1, error = %err, delay_ms = delay.as_millis() as u64, "recalibration attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        if self.config.exponential_backoff {
            self.config.retry_delay.saturating_mul(1u32 << attempt.min(16))
        } else {
            self.config.retry_delay
        }
    }

    fn to_cloud_prediction(&self, response: &CalibrationResponse) -> Result<EmotionPrediction, RecalibrationError> {
        let prediction = EmotionPrediction {
            emotion: response.emotion,
            probabilities: response.probabilities,
            confidence: response.confidence,
            timestamp: Utc::now().timestamp_millis(),
            source: PredictionSource::Cloud,
        };
        prediction
            .validate()
            .map_err(|e| RecalibrationError::InvalidResponse(e.to_string()))?;
        Ok(prediction)
    }

    fn record_success(
        &self,
        local: &EmotionPrediction,
        response: &CalibrationResponse,
        cloud: EmotionPrediction,
        generation: u64,
    ) -> Option<EmotionPrediction> {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("discarding recalibration result after reset");
            return None;
        }

        let adjustment = cloud.confidence - local.confidence;
        let interval = random_interval(&self.config);
        let mut state = self.state.lock();
        state.adjustment = adjustment;
        state.successful += 1;
        state.consecutive_failures = 0;
        state.current_interval = interval;
        state.is_online = true;
        state.last_calibration_at = Some(cloud.timestamp);
        state.history.push_back(CalibrationRecord {
            timestamp: cloud.timestamp,
            local_emotion: local.emotion,
            cloud_emotion: cloud.emotion,
            local_confidence: local.confidence,
            cloud_confidence: cloud.confidence,
            confidence_adjustment: adjustment,
            reported_adjustment: response.confidence_adjustment,
            calibration_needed: response.calibration_needed,
        });
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }
        drop(state);

        info!(
            local = %local.emotion,
            cloud = %cloud.emotion,
            adjustment,
            "recalibration succeeded"
        );
        Some(cloud)
    }

    fn record_failure(&self, request: CalibrationRequest, generation: u64, err: &RecalibrationError) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("discarding recalibration failure after reset");
            return;
        }

        let mut state = self.state.lock();
        state.failed += 1;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let grown = state.current_interval.mul_f64(self.config.failure_interval_multiplier);
        state.current_interval = grown.min(self.config.max_failure_interval);

        if self.config.max_queue_size > 0 {
            while state.queue.len() >= self.config.max_queue_size {
                if let Some(evicted) = state.queue.pop_front() {
                    warn!(queued_at = evicted.queued_at, "calibration queue full, evicting oldest request");
                }
            }
            let id = state.next_queue_id;
            state.next_queue_id += 1;
            state.queue.push_back(QueuedRequest {
                id,
                request,
                queued_at: Utc::now().timestamp_millis(),
            });
        }

        if err.indicates_offline() || state.consecutive_failures >= self.config.max_consecutive_failures {
            state.is_online = false;
        }

        warn!(
            error = %err,
            consecutive_failures = state.consecutive_failures,
            queued = state.queue.len(),
            next_interval_ms = state.current_interval.as_millis() as u64,
            "recalibration failed, request queued"
        );
    }

    /// Replays queued requests oldest first. Requests the backend will never
    /// accept are dropped; a transient failure stops the replay. Only one
    /// replay runs at a time, a concurrent call returns nothing.
    pub async fn flush_queue(&self) -> Vec<EmotionPrediction> {
        let mut replayed = Vec::new();
        if !self.is_enabled() {
            return replayed;
        }
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            debug!("queue replay already running");
            return replayed;
        };

        let generation = self.generation.load(Ordering::SeqCst);
        loop {
            let Some(next) = self.state.lock().queue.front().cloned() else {
                break;
            };

            let result = match self.send_with_retry(&next.request).await {
                Ok(response) => self.to_cloud_prediction(&response).map(|p| (response, p)),
                Err(e) => Err(e),
            };

            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("queue replay superseded by reset");
                break;
            }

            match result {
                Ok((response, cloud)) => {
                    {
                        let mut state = self.state.lock();
                        state.total_attempts += 1;
                        state.replayed += 1;
                        remove_front(&mut state.queue, next.id);
                    }
                    if let Some(cloud) = self.record_success(&next.request.local_prediction, &response, cloud, generation) {
                        replayed.push(cloud);
                    }
                }
                Err(err) if !err.is_retryable() => {
                    warn!(error = %err, queued_at = next.queued_at, "dropping queued request the backend rejected");
                    let mut state = self.state.lock();
                    state.total_attempts += 1;
                    state.failed += 1;
                    remove_front(&mut state.queue, next.id);
                }
                Err(err) => {
                    warn!(error = %err, "queue replay interrupted");
                    {
                        let mut state = self.state.lock();
                        state.total_attempts += 1;
                        state.failed += 1;
                    }
                    if err.indicates_offline() {
                        self.set_online(false);
                    }
                    break;
                }
            }
        }

        if !replayed.is_empty() {
            info!(count = replayed.len(), "replayed queued recalibration requests");
        }
        replayed
    }

    /// Starts the randomized recalibration loop and the network monitor.
    /// Cloud predictions are delivered through `sink` in arrival order.
    pub fn start(
        self: &Arc<Self>,
        provider: Arc<dyn SampleProvider>,
        sink: mpsc::UnboundedSender<EmotionPrediction>,
    ) -> bool {
        if !self.is_enabled() {
            debug!("recalibration disabled, not starting");
            return false;
        }

        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return false;
        }

        let delay_source = Arc::clone(self);
        let service = Arc::clone(self);
        let schedule_sink = sink.clone();
        let schedule = ScheduledTask::spawn(
            "recalibration",
            move || delay_source.current_interval(),
            move || {
                let service = Arc::clone(&service);
                let provider = Arc::clone(&provider);
                let sink = schedule_sink.clone();
                async move { service.run_scheduled(provider, sink).await }
            },
        );

        let service = Arc::clone(self);
        let check_interval = self.config.network_check_interval;
        let monitor = ScheduledTask::spawn(
            "network-monitor",
            move || check_interval,
            move || {
                let service = Arc::clone(&service);
                let sink = sink.clone();
                async move { service.check_network(sink).await }
            },
        );

        *tasks = Some(RunningTasks { schedule, monitor });
        info!(
            interval_ms = self.current_interval().as_millis() as u64,
            "recalibration started"
        );
        true
    }

    /// Cancels pending runs. An attempt already in flight is left to finish.
    pub fn stop(&self) {
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.schedule.cancel();
            tasks.monitor.cancel();
            info!("recalibration stopped");
        }
    }

    async fn run_scheduled(&self, provider: Arc<dyn SampleProvider>, sink: mpsc::UnboundedSender<EmotionPrediction>) {
        let Some(sample) = provider.latest_sample() else {
            debug!("no sample available for recalibration yet");
            return;
        };

        let Some(cloud) = self
            .recalibrate(&sample.frame, &sample.prediction, &sample.session_id)
            .await
        else {
            return;
        };
        let _ = sink.send(cloud);

        if self.network_status().queued_requests > 0 {
            for replayed in self.flush_queue().await {
                let _ = sink.send(replayed);
            }
        }
    }

    async fn check_network(&self, sink: mpsc::UnboundedSender<EmotionPrediction>) {
        let reachable = self.transport.probe().await;
        let was_online = self.is_online();
        if reachable != was_online {
            self.set_online(reachable);
        }

        if reachable && !was_online && self.network_status().queued_requests > 0 {
            for replayed in self.flush_queue().await {
                let _ = sink.send(replayed);
            }
        }
    }

    fn is_online(&self) -> bool {
        self.state.lock().is_online
    }

    fn set_online(&self, online: bool) {
        let mut state = self.state.lock();
        if state.is_online != online {
            info!(online, "recalibration backend reachability changed");
        }
        state.is_online = online;
    }

    pub fn current_interval(&self) -> Duration {
        self.state.lock().current_interval
    }

    pub fn current_adjustment(&self) -> f64 {
        self.state.lock().adjustment
    }

    /// Applies the active correction to a local confidence.
    pub fn adjusted_confidence(&self, local_confidence: f64) -> f64 {
        (local_confidence + self.current_adjustment()).clamp(0.0, 1.0)
    }

    pub fn history(&self) -> Vec<CalibrationRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn network_status(&self) -> NetworkStatus {
        let state = self.state.lock();
        NetworkStatus {
            is_online: state.is_online,
            queued_requests: state.queue.len(),
            consecutive_failures: state.consecutive_failures,
            current_interval_ms: state.current_interval.as_millis() as u64,
        }
    }

    pub fn statistics(&self) -> CalibrationStatistics {
        let network = self.network_status();
        let state = self.state.lock();
        let success_rate = if state.total_attempts == 0 {
            0.0
        } else {
            state.successful as f64 / state.total_attempts as f64 * 100.0
        };

        CalibrationStatistics {
            total_attempts: state.total_attempts,
            successful_calibrations: state.successful,
            failed_calibrations: state.failed,
            success_rate,
            replayed_requests: state.replayed,
            current_adjustment: state.adjustment,
            last_calibration_at: state.last_calibration_at,
            network,
        }
    }

    /// Clears adjustment, history, queue and counters. The enabled flag and
    /// the running schedule are left alone.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = CalibrationState::new(random_interval(&self.config));
        info!("recalibration state reset");
    }
}

fn remove_front(queue: &mut VecDeque<QueuedRequest>, id: u64) {
    if queue.front().is_some_and(|q| q.id == id) {
        queue.pop_front();
    }
}

fn random_interval(config: &RecalibrationConfig) -> Duration {
    let min = config.min_interval.as_millis() as u64;
    let max = config.max_interval.as_millis() as u64;
    if max <= min {
        return config.min_interval;
    }
    Duration::from_millis(rand::rng().random_range(min..=max))
}

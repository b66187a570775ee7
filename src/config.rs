use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::intervention::EscalationPolicy;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Parse { key: String, value: String },
    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: i64 },
    #[error("{field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
    #[error("{short} ({short_ms}ms) must be shorter than {long} ({long_ms}ms)")]
    WindowOrder {
        short: &'static str,
        long: &'static str,
        short_ms: u64,
        long_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalConfig {
    pub window_capacity: usize,
    pub smoothing_alpha: f64,
    pub focused_confidence: f64,
    pub uncertain_confidence: f64,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            window_capacity: 15,
            smoothing_alpha: 0.2,
            focused_confidence: 0.8,
            uncertain_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionConfig {
    pub tier1_cooldown: Duration,
    pub tier2_cooldown: Duration,
    pub tier1_min_span: Duration,
    pub tier1_max_span: Duration,
    pub tier2_lookback: Duration,
    pub tier2_unfocused_ratio: f64,
    pub tier1_min_history: usize,
    pub tier2_min_history: usize,
    pub response_history_limit: usize,
    pub escalation_policy: EscalationPolicy,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            tier1_cooldown: Duration::from_secs(60),
            tier2_cooldown: Duration::from_secs(120),
            tier1_min_span: Duration::from_secs(60),
            tier1_max_span: Duration::from_secs(180),
            tier2_lookback: Duration::from_secs(300),
            tier2_unfocused_ratio: 0.6,
            tier1_min_history: 3,
            tier2_min_history: 5,
            response_history_limit: 50,
            escalation_policy: EscalationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityConfig {
    pub consecutive_frame_threshold: u32,
    pub min_detection_confidence: f64,
    pub pause_after: Duration,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            consecutive_frame_threshold: 3,
            min_detection_confidence: 0.3,
            pause_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalibrationConfig {
    pub enabled: bool,
    pub backend_url: String,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
    pub request_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub failure_interval_multiplier: f64,
    pub max_failure_interval: Duration,
    pub network_check_interval: Duration,
    pub max_queue_size: usize,
    pub history_limit: usize,
    pub apply_confidence_adjustment: bool,
}

impl Default for RecalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend_url: "http://localhost:5000".to_string(),
            min_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(60),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            exponential_backoff: true,
            request_timeout: Duration::from_secs(10),
            max_consecutive_failures: 5,
            failure_interval_multiplier: 1.5,
            max_failure_interval: Duration::from_secs(300),
            network_check_interval: Duration::from_secs(30),
            max_queue_size: 20,
            history_limit: 100,
            apply_confidence_adjustment: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffectConfig {
    pub temporal: TemporalConfig,
    pub intervention: InterventionConfig,
    pub visibility: VisibilityConfig,
    pub recalibration: RecalibrationConfig,
    pub log_level: String,
}

impl Default for AffectConfig {
    fn default() -> Self {
        Self {
            temporal: TemporalConfig::default(),
            intervention: InterventionConfig::default(),
            visibility: VisibilityConfig::default(),
            recalibration: RecalibrationConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AffectConfig {
    /// Reads `AFFECT_*` overrides on top of the defaults and validates the result.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            log_level: env_string("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            ..Self::default()
        };

        let t = &mut config.temporal;
        if let Some(v) = env_parse::<usize>("AFFECT_WINDOW_CAPACITY")? {
            t.window_capacity = v;
        }
        if let Some(v) = env_parse::<f64>("AFFECT_SMOOTHING_ALPHA")? {
            t.smoothing_alpha = v;
        }

        let i = &mut config.intervention;
        if let Some(v) = env_secs("AFFECT_TIER1_COOLDOWN_SECS")? {
            i.tier1_cooldown = v;
        }
        if let Some(v) = env_secs("AFFECT_TIER2_COOLDOWN_SECS")? {
            i.tier2_cooldown = v;
        }
        if let Some(v) = env_string("AFFECT_ESCALATION_POLICY") {
            i.escalation_policy = v.parse().map_err(|_| ConfigError::Parse {
                key: "AFFECT_ESCALATION_POLICY".to_string(),
                value: v,
            })?;
        }

        let r = &mut config.recalibration;
        if let Some(v) = env_bool("AFFECT_RECALIBRATION_ENABLED")? {
            r.enabled = v;
        }
        if let Some(v) = env_string("AFFECT_BACKEND_URL") {
            r.backend_url = v;
        }
        if let Some(v) = env_millis("AFFECT_RECALIBRATION_MIN_INTERVAL_MS")? {
            r.min_interval = v;
        }
        if let Some(v) = env_millis("AFFECT_RECALIBRATION_MAX_INTERVAL_MS")? {
            r.max_interval = v;
        }
        if let Some(v) = env_parse::<u32>("AFFECT_RECALIBRATION_MAX_RETRIES")? {
            r.max_retries = v;
        }
        if let Some(v) = env_millis("AFFECT_RECALIBRATION_RETRY_DELAY_MS")? {
            r.retry_delay = v;
        }
        if let Some(v) = env_bool("AFFECT_RECALIBRATION_EXPONENTIAL_BACKOFF")? {
            r.exponential_backoff = v;
        }
        if let Some(v) = env_millis("AFFECT_RECALIBRATION_TIMEOUT_MS")? {
            r.request_timeout = v;
        }
        if let Some(v) = env_millis("AFFECT_NETWORK_CHECK_INTERVAL_MS")? {
            r.network_check_interval = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.temporal.validate()?;
        self.intervention.validate()?;
        self.visibility.validate()?;
        self.recalibration.validate()
    }
}

impl TemporalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_capacity == 0 {
            return Err(out_of_range("temporal.window_capacity", "must be at least 1"));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(out_of_range(
                "temporal.smoothing_alpha",
                format!("{} not in (0, 1]", self.smoothing_alpha),
            ));
        }
        check_unit("temporal.focused_confidence", self.focused_confidence)?;
        check_unit("temporal.uncertain_confidence", self.uncertain_confidence)?;
        if self.uncertain_confidence > self.focused_confidence {
            return Err(out_of_range(
                "temporal.uncertain_confidence",
                "must not exceed focused_confidence",
            ));
        }
        Ok(())
    }
}

impl InterventionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_order(
            "intervention.tier1_min_span",
            self.tier1_min_span,
            "intervention.tier1_max_span",
            self.tier1_max_span,
        )?;
        check_unit("intervention.tier2_unfocused_ratio", self.tier2_unfocused_ratio)?;
        if self.tier1_min_history == 0 || self.tier2_min_history == 0 {
            return Err(out_of_range("intervention.min_history", "must be at least 1"));
        }
        if self.response_history_limit == 0 {
            return Err(out_of_range("intervention.response_history_limit", "must be at least 1"));
        }
        Ok(())
    }
}

impl VisibilityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consecutive_frame_threshold == 0 {
            return Err(out_of_range("visibility.consecutive_frame_threshold", "must be at least 1"));
        }
        check_unit("visibility.min_detection_confidence", self.min_detection_confidence)
    }
}

impl RecalibrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_order(
            "recalibration.min_interval",
            self.min_interval,
            "recalibration.max_interval",
            self.max_interval,
        )?;
        if self.max_retries == 0 {
            return Err(out_of_range("recalibration.max_retries", "must be at least 1"));
        }
        if !(self.failure_interval_multiplier >= 1.0 && self.failure_interval_multiplier.is_finite()) {
            return Err(out_of_range(
                "recalibration.failure_interval_multiplier",
                format!("{} is below 1", self.failure_interval_multiplier),
            ));
        }
        if self.max_failure_interval < self.max_interval {
            return Err(out_of_range(
                "recalibration.max_failure_interval",
                "must not be shorter than max_interval",
            ));
        }
        if self.request_timeout.is_zero() || self.network_check_interval.is_zero() {
            return Err(out_of_range("recalibration.timeouts", "must be non-zero"));
        }
        if self.max_queue_size == 0 || self.history_limit == 0 {
            return Err(out_of_range("recalibration.limits", "must be at least 1"));
        }
        if self.enabled && self.backend_url.trim().is_empty() {
            return Err(out_of_range("recalibration.backend_url", "required when enabled"));
        }
        Ok(())
    }
}

fn out_of_range(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        reason: reason.into(),
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(out_of_range(field, format!("{value} not in [0, 1]")))
    }
}

fn check_order(
    short: &'static str,
    short_value: Duration,
    long: &'static str,
    long_value: Duration,
) -> Result<(), ConfigError> {
    if short_value >= long_value {
        return Err(ConfigError::WindowOrder {
            short,
            long,
            short_ms: short_value.as_millis() as u64,
            long_ms: long_value.as_millis() as u64,
        });
    }
    Ok(())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Parse {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => match raw.trim() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::Parse {
                key: key.to_string(),
                value: raw,
            }),
        },
    }
}

fn env_signed(key: &'static str) -> Result<Option<u64>, ConfigError> {
    match env_parse::<i64>(key)? {
        None => Ok(None),
        Some(v) if v < 0 => Err(ConfigError::Negative { field: key, value: v }),
        Some(v) => Ok(Some(v as u64)),
    }
}

fn env_secs(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_signed(key)?.map(Duration::from_secs))
}

fn env_millis(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_signed(key)?.map(Duration::from_millis))
}

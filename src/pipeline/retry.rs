// src/pipeline/retry.rs

use rand::Rng;
use std::time::Duration;

use crate::config::engine::EngineConfig;
use crate::data_model::Stage;
use crate::error::ActivityError;

/// Exponential backoff with jitter, bounded by a retry ceiling.
///
/// `max_retries` counts retries only, so a stage runs at most
/// `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_config(&EngineConfig::default(), Stage::Validate)
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig, stage: Stage) -> Self {
        RetryPolicy {
            max_retries: config.max_retries_for(stage),
            ..RetryPolicy::engine_wide(config)
        }
    }

    /// The global settings, ignoring per-stage overrides.
    pub fn engine_wide(config: &EngineConfig) -> Self {
        RetryPolicy {
            max_retries: config.stage_retry_max_attempts,
            initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
            multiplier: config.retry_backoff_multiplier,
            jitter: true,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Whether another attempt follows attempt number `attempt` (1-based) failing with `error`.
    pub fn should_retry(&self, error: &ActivityError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts()
    }

    /// Delay before the attempt after `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let delay = if self.jitter && capped > 0.0 {
            rand::thread_rng().gen_range(capped / 2.0..=capped)
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }
}

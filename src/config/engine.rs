// src/config/engine.rs
use crate::data_model::Stage;
use crate::error::{PipelineError, Result};
use crate::runtime::dispatcher::{DomainLimits, QueueName};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::load_yaml;

fn default_io_concurrency() -> usize {
    32
}
fn default_io_polls() -> usize {
    64
}
fn default_cpu_concurrency() -> usize {
    4
}
fn default_cpu_polls() -> usize {
    8
}
fn default_parsing_concurrency() -> usize {
    8
}
fn default_parsing_polls() -> usize {
    16
}
fn default_notify_concurrency() -> usize {
    16
}
fn default_notify_polls() -> usize {
    32
}
fn default_process_pool_size() -> usize {
    4
}
fn default_resource_pool_size() -> usize {
    8
}
fn default_resource_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_resource_max_idle_ms() -> u64 {
    300_000
}
fn default_stage_retry_max_attempts() -> u32 {
    3
}
fn default_stage_timeout_ms() -> u64 {
    60_000
}
fn default_retry_initial_backoff_ms() -> u64 {
    200
}
fn default_retry_max_backoff_ms() -> u64 {
    10_000
}
fn default_retry_backoff_multiplier() -> f64 {
    2.0
}
fn default_payload_compression_threshold_bytes() -> usize {
    64 * 1024
}
fn default_parsed_result_ttl_secs() -> u64 {
    86_400
}
fn default_slot_reclaim_grace_ms() -> u64 {
    5_000
}

/// Thresholds used by the scheduler health monitor.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub sample_interval_ms: u64,
    pub lag_warning_ms: u64,
    pub lag_critical_ms: u64,
    /// Load average divided by available cores.
    pub load_warning: f64,
    pub load_critical: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            sample_interval_ms: 500,
            lag_warning_ms: 50,
            lag_critical_ms: 250,
            load_warning: 0.85,
            load_critical: 1.5,
        }
    }
}

impl HealthConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(PipelineError::ConfigValidationError(
                "health: sample_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.lag_warning_ms > self.lag_critical_ms {
            return Err(PipelineError::ConfigValidationError(format!(
                "health: lag_warning_ms ({}) cannot be greater than lag_critical_ms ({})",
                self.lag_warning_ms, self.lag_critical_ms
            )));
        }
        if self.load_warning <= 0.0 || self.load_warning > self.load_critical {
            return Err(PipelineError::ConfigValidationError(format!(
                "health: load_warning ({}) must be positive and not greater than load_critical ({})",
                self.load_warning, self.load_critical
            )));
        }
        Ok(())
    }
}

/// Per-stage replacement for the global retry ceiling and timeout.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageOverride {
    /// Retries after the first attempt, like `stage_retry_max_attempts`.
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
}

/// Engine tuning read from YAML. Every option has a default.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_io_concurrency")]
    pub io_pool_max_concurrency: usize,
    #[serde(default = "default_io_polls")]
    pub io_pool_max_concurrent_polls: usize,
    #[serde(default = "default_cpu_concurrency")]
    pub cpu_pool_max_concurrency: usize,
    #[serde(default = "default_cpu_polls")]
    pub cpu_pool_max_concurrent_polls: usize,
    #[serde(default = "default_parsing_concurrency")]
    pub parsing_pool_max_concurrency: usize,
    #[serde(default = "default_parsing_polls")]
    pub parsing_pool_max_concurrent_polls: usize,
    #[serde(default = "default_notify_concurrency")]
    pub notify_pool_max_concurrency: usize,
    #[serde(default = "default_notify_polls")]
    pub notify_pool_max_concurrent_polls: usize,

    #[serde(default = "default_process_pool_size")]
    pub process_pool_size: usize,
    #[serde(default = "default_resource_pool_size")]
    pub resource_pool_size: usize,
    #[serde(default = "default_resource_acquire_timeout_ms")]
    pub resource_acquire_timeout_ms: u64,
    #[serde(default = "default_resource_max_idle_ms")]
    pub resource_max_idle_ms: u64,

    #[serde(default = "default_stage_retry_max_attempts")]
    pub stage_retry_max_attempts: u32,
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    /// Keyed by stage name (`validate`, `extract`, ...).
    #[serde(default)]
    pub stage_overrides: HashMap<String, StageOverride>,

    #[serde(default = "default_payload_compression_threshold_bytes")]
    pub payload_compression_threshold_bytes: usize,
    #[serde(default = "default_parsed_result_ttl_secs")]
    pub parsed_result_ttl_secs: u64,
    #[serde(default = "default_slot_reclaim_grace_ms")]
    pub slot_reclaim_grace_ms: u64,

    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            io_pool_max_concurrency: default_io_concurrency(),
            io_pool_max_concurrent_polls: default_io_polls(),
            cpu_pool_max_concurrency: default_cpu_concurrency(),
            cpu_pool_max_concurrent_polls: default_cpu_polls(),
            parsing_pool_max_concurrency: default_parsing_concurrency(),
            parsing_pool_max_concurrent_polls: default_parsing_polls(),
            notify_pool_max_concurrency: default_notify_concurrency(),
            notify_pool_max_concurrent_polls: default_notify_polls(),
            process_pool_size: default_process_pool_size(),
            resource_pool_size: default_resource_pool_size(),
            resource_acquire_timeout_ms: default_resource_acquire_timeout_ms(),
            resource_max_idle_ms: default_resource_max_idle_ms(),
            stage_retry_max_attempts: default_stage_retry_max_attempts(),
            stage_timeout_ms: default_stage_timeout_ms(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            retry_backoff_multiplier: default_retry_backoff_multiplier(),
            stage_overrides: HashMap::new(),
            payload_compression_threshold_bytes: default_payload_compression_threshold_bytes(),
            parsed_result_ttl_secs: default_parsed_result_ttl_secs(),
            slot_reclaim_grace_ms: default_slot_reclaim_grace_ms(),
            health: HealthConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("io_pool_max_concurrency", self.io_pool_max_concurrency),
            ("io_pool_max_concurrent_polls", self.io_pool_max_concurrent_polls),
            ("cpu_pool_max_concurrency", self.cpu_pool_max_concurrency),
            ("cpu_pool_max_concurrent_polls", self.cpu_pool_max_concurrent_polls),
            ("parsing_pool_max_concurrency", self.parsing_pool_max_concurrency),
            ("parsing_pool_max_concurrent_polls", self.parsing_pool_max_concurrent_polls),
            ("notify_pool_max_concurrency", self.notify_pool_max_concurrency),
            ("notify_pool_max_concurrent_polls", self.notify_pool_max_concurrent_polls),
            ("process_pool_size", self.process_pool_size),
            ("resource_pool_size", self.resource_pool_size),
        ];
        for (name, value) in sizes.iter() {
            if *value == 0 {
                return Err(PipelineError::ConfigValidationError(format!(
                    "EngineConfig: {} must be greater than 0",
                    name
                )));
            }
        }

        if self.stage_timeout_ms == 0 || self.resource_acquire_timeout_ms == 0 {
            return Err(PipelineError::ConfigValidationError(
                "EngineConfig: stage_timeout_ms and resource_acquire_timeout_ms must be greater than 0"
                    .to_string(),
            ));
        }
        if self.retry_backoff_multiplier < 1.0 {
            return Err(PipelineError::ConfigValidationError(format!(
                "EngineConfig: retry_backoff_multiplier must be at least 1.0, got {}",
                self.retry_backoff_multiplier
            )));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(PipelineError::ConfigValidationError(format!(
                "EngineConfig: retry_initial_backoff_ms ({}) cannot be greater than retry_max_backoff_ms ({})",
                self.retry_initial_backoff_ms, self.retry_max_backoff_ms
            )));
        }

        for (name, stage_override) in &self.stage_overrides {
            match Stage::from_name(name) {
                Some(stage) if stage != Stage::Initiate => {}
                _ => {
                    return Err(PipelineError::ConfigValidationError(format!(
                        "EngineConfig: stage_overrides has unknown stage '{}'",
                        name
                    )))
                }
            }
            if stage_override.timeout_ms == Some(0) {
                return Err(PipelineError::ConfigValidationError(format!(
                    "EngineConfig: stage_overrides.{}.timeout_ms must be greater than 0",
                    name
                )));
            }
        }

        self.health.validate()
    }

    pub fn limits_for(&self, queue: QueueName) -> DomainLimits {
        let (max_concurrency, max_concurrent_polls) = match queue {
            QueueName::IoActivity => (self.io_pool_max_concurrency, self.io_pool_max_concurrent_polls),
            QueueName::CpuActivity => {
                (self.cpu_pool_max_concurrency, self.cpu_pool_max_concurrent_polls)
            }
            QueueName::ParsingActivity => (
                self.parsing_pool_max_concurrency,
                self.parsing_pool_max_concurrent_polls,
            ),
            QueueName::NotifyActivity => (
                self.notify_pool_max_concurrency,
                self.notify_pool_max_concurrent_polls,
            ),
        };
        DomainLimits {
            max_concurrency,
            max_concurrent_polls,
        }
    }

    /// Retry ceiling for `stage`, after applying overrides.
    pub fn max_retries_for(&self, stage: Stage) -> u32 {
        self.stage_overrides
            .get(stage.name())
            .and_then(|o| o.max_retries)
            .unwrap_or(self.stage_retry_max_attempts)
    }

    pub fn timeout_for(&self, stage: Stage) -> Duration {
        let ms = self
            .stage_overrides
            .get(stage.name())
            .and_then(|o| o.timeout_ms)
            .unwrap_or(self.stage_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn resource_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_acquire_timeout_ms)
    }

    pub fn resource_max_idle(&self) -> Option<Duration> {
        (self.resource_max_idle_ms > 0).then(|| Duration::from_millis(self.resource_max_idle_ms))
    }

    pub fn slot_reclaim_grace(&self) -> Duration {
        Duration::from_millis(self.slot_reclaim_grace_ms)
    }

    pub fn parsed_result_ttl(&self) -> Duration {
        Duration::from_secs(self.parsed_result_ttl_secs)
    }
}

/// Loads and validates the engine configuration YAML file.
pub fn load_engine_config<P: AsRef<Path>>(config_path: P) -> Result<EngineConfig> {
    let config: EngineConfig = load_yaml(config_path, "engine config")?;
    config.validate()?;
    Ok(config)
}

// src/runtime/health.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::engine::HealthConfig;
use crate::utils::prometheus_metrics::SCHEDULER_LAG_SECONDS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSignal {
    pub level: HealthLevel,
    pub scheduler_lag_ms: u64,
    /// Load average per available core, when the platform exposes it.
    pub cpu_load: Option<f64>,
    pub sampled_at: DateTime<Utc>,
}

impl Default for HealthSignal {
    fn default() -> Self {
        HealthSignal {
            level: HealthLevel::Normal,
            scheduler_lag_ms: 0,
            cpu_load: None,
            sampled_at: Utc::now(),
        }
    }
}

/// Maps one sample onto a level; the worse of lag and load wins.
pub fn classify(lag_ms: u64, cpu_load: Option<f64>, thresholds: &HealthConfig) -> HealthLevel {
    let by_lag = if lag_ms >= thresholds.lag_critical_ms {
        HealthLevel::Critical
    } else if lag_ms >= thresholds.lag_warning_ms {
        HealthLevel::Warning
    } else {
        HealthLevel::Normal
    };
    let by_load = match cpu_load {
        Some(load) if load >= thresholds.load_critical => HealthLevel::Critical,
        Some(load) if load >= thresholds.load_warning => HealthLevel::Warning,
        _ => HealthLevel::Normal,
    };
    by_lag.max(by_load)
}

fn normalized_load() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/loadavg").ok()?;
    let one_minute: f64 = content.split_whitespace().next()?.parse().ok()?;
    let cores = std::thread::available_parallelism().ok()?.get() as f64;
    Some(one_minute / cores)
}

/// Periodically measures how late the scheduler wakes a sleeping task.
///
/// Publishing is all it does; the dispatcher decides what to do with it.
pub struct SchedulerHealthMonitor {
    thresholds: HealthConfig,
    sender: watch::Sender<HealthSignal>,
}

impl SchedulerHealthMonitor {
    pub fn new(thresholds: HealthConfig) -> Self {
        let (sender, _) = watch::channel(HealthSignal::default());
        SchedulerHealthMonitor { thresholds, sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthSignal> {
        self.sender.subscribe()
    }

    pub fn latest(&self) -> HealthSignal {
        self.sender.borrow().clone()
    }

    /// Takes one sample and publishes it.
    pub async fn sample(&self) -> HealthSignal {
        let interval = self.thresholds.sample_interval();
        let started = Instant::now();
        tokio::time::sleep(interval).await;
        let lag = started.elapsed().saturating_sub(interval);

        let cpu_load = normalized_load();
        let lag_ms = lag.as_millis() as u64;
        let signal = HealthSignal {
            level: classify(lag_ms, cpu_load, &self.thresholds),
            scheduler_lag_ms: lag_ms,
            cpu_load,
            sampled_at: Utc::now(),
        };
        SCHEDULER_LAG_SECONDS.set(lag.as_secs_f64());

        let previous = self.sender.send_replace(signal.clone());
        if previous.level != signal.level {
            match signal.level {
                HealthLevel::Normal => info!(lag_ms, "Scheduler health back to normal"),
                level => warn!(?level, lag_ms, ?cpu_load, "Scheduler health degraded"),
            }
        }
        signal
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = self.sample() => {}
                _ = cancel.cancelled() => break,
            }
        }
        debug!("Scheduler health monitor stopped");
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run(cancel).await })
    }

    /// Publishes a signal directly. Used by tests and manual overrides.
    pub fn publish(&self, signal: HealthSignal) {
        self.sender.send_replace(signal);
    }
}

// src/utils/prometheus_metrics.rs

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec,
    register_int_gauge_vec, Counter, CounterVec, Gauge, HistogramVec, IntGaugeVec,
};

// Orchestrator
pub static PIPELINES_STARTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "pipeline_instances_started_total",
        "Total number of pipeline instances started or resumed."
    )
    .expect("Failed to register PIPELINES_STARTED_TOTAL counter")
});

pub static PIPELINES_FINISHED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pipeline_instances_finished_total",
        "Total number of pipeline instances that reached a terminal state, by state.",
        &["state"]
    )
    .expect("Failed to register PIPELINES_FINISHED_TOTAL counter")
});

pub static ACTIVE_PIPELINES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "pipeline_instances_active",
        "Number of pipeline instances currently running."
    )
    .expect("Failed to register ACTIVE_PIPELINES gauge")
});

pub static STAGE_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "pipeline_stage_duration_seconds",
        "Histogram of stage durations including retries.",
        &["stage"]
    )
    .expect("Failed to register STAGE_DURATION_SECONDS histogram")
});

pub static STAGE_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pipeline_stage_retries_total",
        "Total number of stage attempts retried after a transient failure.",
        &["stage"]
    )
    .expect("Failed to register STAGE_RETRIES_TOTAL counter")
});

pub static FALLBACK_CLASSIFICATIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "classification_fallback_total",
        "Total number of documents classified through the fallback path."
    )
    .expect("Failed to register FALLBACK_CLASSIFICATIONS_TOTAL counter")
});

pub static OUTCOME_PUBLISH_ERRORS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "pipeline_outcome_publish_errors_total",
        "Total number of outcome events that could not be delivered."
    )
    .expect("Failed to register OUTCOME_PUBLISH_ERRORS_TOTAL counter")
});

// Dispatcher
pub static DISPATCH_IN_FLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "dispatcher_tasks_in_flight",
        "Number of activity tasks executing per worker-pool domain.",
        &["queue"]
    )
    .expect("Failed to register DISPATCH_IN_FLIGHT gauge")
});

pub static DISPATCH_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dispatcher_tasks_rejected_total",
        "Total number of submissions rejected because the admission queue was full.",
        &["queue"]
    )
    .expect("Failed to register DISPATCH_REJECTED_TOTAL counter")
});

pub static DISPATCH_SLOTS_RECLAIMED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dispatcher_slots_reclaimed_total",
        "Total number of leaked concurrency slots reclaimed after their timeout.",
        &["queue"]
    )
    .expect("Failed to register DISPATCH_SLOTS_RECLAIMED_TOTAL counter")
});

// Pools
pub static RESOURCE_POOL_EXHAUSTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "resource_pool_exhausted_total",
        "Total number of acquires that timed out on an exhausted pool.",
        &["pool"]
    )
    .expect("Failed to register RESOURCE_POOL_EXHAUSTED_TOTAL counter")
});

pub static RESOURCE_POOL_STALE_DISCARDED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "resource_pool_stale_discarded_total",
        "Total number of pooled handles discarded after failing their health check.",
        &["pool"]
    )
    .expect("Failed to register RESOURCE_POOL_STALE_DISCARDED_TOTAL counter")
});

pub static ISOLATED_WORKER_CRASHES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "isolated_worker_crashes_total",
        "Total number of isolated workers that crashed or were abandoned."
    )
    .expect("Failed to register ISOLATED_WORKER_CRASHES_TOTAL counter")
});

// Health
pub static SCHEDULER_LAG_SECONDS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "scheduler_lag_seconds",
        "Most recent scheduler lag sample."
    )
    .expect("Failed to register SCHEDULER_LAG_SECONDS gauge")
});

// Worker
pub static SUBMISSION_DESERIALIZATION_ERRORS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_submission_deserialization_errors_total",
        "Total number of errors deserializing incoming document submissions."
    )
    .expect("Failed to register SUBMISSION_DESERIALIZATION_ERRORS_TOTAL counter")
});

// Utils

pub mod common;
pub mod compression;
pub mod logging;
pub mod prometheus_metrics;

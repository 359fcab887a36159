// src/config.rs
use crate::error::{PipelineError, Result};
use serde::de::DeserializeOwned;
use std::fs; // For reading the file
use std::path::Path;

pub mod engine;
pub mod rules;
pub mod worker;

pub use engine::{load_engine_config, EngineConfig, HealthConfig, StageOverride};
pub use rules::load_document_types;

/// Reads and parses a YAML file; `what` names the file kind in error messages.
pub(crate) fn load_yaml<T: DeserializeOwned, P: AsRef<Path>>(path: P, what: &str) -> Result<T> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to read {} file '{}': {}",
            what,
            path_ref.display(),
            e
        ))
    })?;

    serde_yaml::from_str(&content).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to parse {} YAML from '{}': {}",
            what,
            path_ref.display(),
            e
        ))
    })
}

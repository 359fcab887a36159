#![allow(non_snake_case)]
#![allow(clippy::too_many_arguments)]

// Declare the modules that form the library's public API
pub mod config;
pub mod data_model;
pub mod engine;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod pipeline;
pub mod runtime;
pub mod server;
pub mod services;
pub mod utils;
pub mod worker_logic;

pub use engine::{Collaborators, EngineRuntime};
pub use error::{ActivityError, PipelineError, Result};
pub use orchestrator::{PipelineOrchestrator, PipelineReport};

use crate::data_model::PipelineState;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Custom Result type for this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The Error type for orchestration-level operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration validation error: {0}")]
    ConfigValidationError(String),

    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization/Deserialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },

    #[error("Queueing system error: {0}")]
    QueueError(String),

    #[error("Invalid pipeline transition from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    #[error("Document '{0}' already has an active pipeline instance")]
    PipelineAlreadyActive(String),

    #[error("Pipeline for document '{0}' was cancelled")]
    Cancelled(String),

    #[error("Resource pool '{pool}' exhausted after waiting {waited_ms}ms")]
    ResourceExhausted { pool: String, waited_ms: u64 },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

// lapin errors are mapped to strings where they occur, same as before.
impl From<lapin::Error> for PipelineError {
    fn from(err: lapin::Error) -> Self {
        PipelineError::QueueError(err.to_string())
    }
}

/// Why a document can never make it through a stage, no matter how often it is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    PasswordRequired,
    UnsupportedFormat,
    CorruptFile,
    EmptyDocument,
    Unparseable,
    ClassificationFailed,
    Rejected,
    NotFound,
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalKind::PasswordRequired => "password_required",
            TerminalKind::UnsupportedFormat => "unsupported_format",
            TerminalKind::CorruptFile => "corrupt_file",
            TerminalKind::EmptyDocument => "empty_document",
            TerminalKind::Unparseable => "unparseable",
            TerminalKind::ClassificationFailed => "classification_failed",
            TerminalKind::Rejected => "rejected",
            TerminalKind::NotFound => "not_found",
        };
        f.write_str(s)
    }
}

/// Classified failure surfaced by an activity or an external collaborator.
///
/// Activities never hand raw library errors to the orchestrator; they pick
/// one of these kinds so the retry policy can decide what happens next.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityError {
    #[error("{kind}: {message}")]
    Terminal { kind: TerminalKind, message: String },

    #[error("transient infrastructure error: {0}")]
    Transient(String),

    #[error("isolated worker crashed: {0}")]
    WorkerCrashed(String),
}

impl ActivityError {
    pub fn terminal(kind: TerminalKind, message: impl Into<String>) -> Self {
        ActivityError::Terminal {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ActivityError::Transient(message.into())
    }

    /// Transient failures and worker crashes are retried; terminal ones are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ActivityError::Terminal { .. })
    }

    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        match self {
            ActivityError::Terminal { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ActivityError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                ActivityError::terminal(TerminalKind::NotFound, err.to_string())
            }
            _ => ActivityError::Transient(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for ActivityError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.is_client_error() => {
                ActivityError::terminal(TerminalKind::Rejected, err.to_string())
            }
            // timeouts, refused connections and 5xx all deserve another try
            _ => ActivityError::Transient(err.to_string()),
        }
    }
}

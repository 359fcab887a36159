use crate::data_model::{ClassificationResult, Document, ExtractedPayload, Stage};
use crate::error::{ActivityError, PipelineError, Result};
use crate::pipeline::classification::RuleSet;
use crate::pipeline::retry::RetryPolicy;
use crate::runtime::dispatcher::QueueName;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What an activity sees for one attempt.
#[derive(Clone)]
pub struct ActivityInput {
    /// Snapshot of the record taken before the attempt; never written back directly.
    pub document: Document,
    pub rules: Arc<RuleSet>,
    pub attempt: u32,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// Result of a successful stage, applied by `pipeline::state::advance`.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Initiated,
    Validated,
    Extracted(ExtractedPayload),
    Classified(ClassificationResult),
    Parsed(Value),
    ProductUpdated,
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Initiated => Stage::Initiate,
            StageOutput::Validated => Stage::Validate,
            StageOutput::Extracted(_) => Stage::Extract,
            StageOutput::Classified(_) => Stage::Classify,
            StageOutput::Parsed(_) => Stage::Parse,
            StageOutput::ProductUpdated => Stage::UpdateProduct,
        }
    }
}

// Use async_trait for async steps
#[async_trait]
pub trait Activity: Send + Sync {
    fn name(&self) -> &'static str; // For logging/error reporting

    fn stage(&self) -> Stage;

    /// Worker-pool domain this activity runs on.
    fn queue(&self) -> QueueName {
        self.stage().queue()
    }

    async fn execute(&self, input: ActivityInput) -> std::result::Result<StageOutput, ActivityError>;
}

/// One stage's unit of work for one document, carried across its retries.
#[derive(Clone)]
pub struct ActivityTask {
    pub stage: Stage,
    pub queue: QueueName,
    pub input: ActivityInput,
    pub timeout: Duration,
    pub policy: RetryPolicy,
}

impl ActivityTask {
    pub fn attempt(&self) -> u32 {
        self.input.attempt
    }

    /// Moves the task to its next attempt.
    pub fn next_attempt(&mut self) {
        self.input.attempt += 1;
    }
}

/// Stage to activity bindings, resolved once at startup.
pub struct ActivityRegistry {
    activities: HashMap<Stage, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    /// Fails unless every activity stage is bound exactly once, each to an
    /// activity running on that stage's domain.
    pub fn new(activities: Vec<Arc<dyn Activity>>) -> Result<Self> {
        let mut bound: HashMap<Stage, Arc<dyn Activity>> = HashMap::new();
        for activity in activities {
            let stage = activity.stage();
            if stage == Stage::Initiate {
                return Err(PipelineError::ConfigValidationError(format!(
                    "activity '{}' cannot be bound to the initiate stage",
                    activity.name()
                )));
            }
            if activity.queue() != stage.queue() {
                return Err(PipelineError::ConfigValidationError(format!(
                    "activity '{}' declares {} but stage {} runs on {}",
                    activity.name(),
                    activity.queue(),
                    stage,
                    stage.queue()
                )));
            }
            debug!(activity = activity.name(), %stage, queue = %activity.queue(), "Binding activity");
            if let Some(previous) = bound.insert(stage, activity) {
                return Err(PipelineError::ConfigValidationError(format!(
                    "stage {} is bound twice (previously to '{}')",
                    stage,
                    previous.name()
                )));
            }
        }

        for stage in Stage::ACTIVITY_STAGES {
            if !bound.contains_key(&stage) {
                return Err(PipelineError::ConfigValidationError(format!(
                    "no activity bound to stage {}",
                    stage
                )));
            }
        }
        Ok(ActivityRegistry { activities: bound })
    }

    pub fn get(&self, stage: Stage) -> Result<Arc<dyn Activity>> {
        self.activities
            .get(&stage)
            .cloned()
            .ok_or_else(|| PipelineError::Unexpected(format!("no activity bound to stage {}", stage)))
    }
}

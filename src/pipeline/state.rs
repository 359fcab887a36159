// src/pipeline/state.rs

use chrono::Utc;

use crate::data_model::{Document, PipelineState, Stage};
use crate::error::{ActivityError, PipelineError, Result};
use crate::executor::StageOutput;

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Succeeded(StageOutput),
    Failed { state: PipelineState, reason: String },
}

/// The result of running one stage, as delivered to `advance`.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

impl StageResult {
    pub fn success(output: StageOutput) -> Self {
        StageResult {
            stage: output.stage(),
            outcome: StageOutcome::Succeeded(output),
        }
    }

    /// Failure of `stage` with the terminal state matching `error`.
    pub fn failure(stage: Stage, error: &ActivityError) -> Self {
        StageResult {
            stage,
            outcome: StageOutcome::Failed {
                state: stage.failure_state_for(error),
                reason: error.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Moved {
        from: PipelineState,
        to: PipelineState,
    },
    /// The result belongs to a stage the document already left.
    Duplicate,
}

fn apply_output(document: &mut Document, output: StageOutput) {
    match output {
        StageOutput::Initiated | StageOutput::Validated | StageOutput::ProductUpdated => {}
        StageOutput::Extracted(payload) => {
            document.extracted_payload = Some(payload);
            document.is_text_extracted = true;
        }
        StageOutput::Classified(classification) => {
            document.classification = Some(classification);
            document.is_classified = true;
        }
        StageOutput::Parsed(data) => {
            document.parsed_data = Some(data);
            document.is_parsed = true;
        }
    }
}

/// Applies a stage result to the document. The only place pipeline state changes.
///
/// Results for stages the document already passed, and any result on a
/// terminal document, leave it untouched. A result for a stage not reached
/// yet is an error.
pub fn advance(document: &mut Document, result: StageResult) -> Result<Advance> {
    let from = document.state;
    let current_stage = match from.stage() {
        Some(stage) => stage,
        None => return Ok(Advance::Duplicate),
    };

    if result.stage < current_stage {
        return Ok(Advance::Duplicate);
    }

    let to = match &result.outcome {
        StageOutcome::Succeeded(_) => result.stage.success_state(),
        StageOutcome::Failed { state, .. } => *state,
    };
    if result.stage > current_stage || !from.can_transition_to(to) {
        return Err(PipelineError::InvalidTransition { from, to });
    }

    match result.outcome {
        StageOutcome::Succeeded(output) => {
            if output.stage() != result.stage {
                return Err(PipelineError::Unexpected(format!(
                    "{} output delivered as a {} result",
                    output.stage(),
                    result.stage
                )));
            }
            apply_output(document, output);
        }
        StageOutcome::Failed { reason, .. } => {
            if document.error_reason.is_none() {
                document.error_reason = Some(reason);
            }
        }
    }

    document.state = to;
    document.updated_at = Utc::now();
    Ok(Advance::Moved { from, to })
}

// src/worker_logic.rs

use crate::data_model::{DocumentSubmission, PipelineState};
use crate::engine::EngineRuntime;
use crate::error::{PipelineError, Result}; // Use the library's Result type
use crate::error::TerminalKind;
use crate::orchestrator::{PipelineOrchestrator, PipelineReport};
use crate::services::RepositoryPool;
use crate::utils::prometheus_metrics::SUBMISSION_DESERIALIZATION_ERRORS_TOTAL;
use futures::StreamExt; // For processing the consumer stream
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    Consumer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What a worker needs to turn a submission into a pipeline run.
#[derive(Clone)]
pub struct SubmissionContext {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub repositories: RepositoryPool,
    pub acquire_timeout: Duration,
}

impl SubmissionContext {
    pub fn new(engine: &EngineRuntime) -> Self {
        SubmissionContext {
            orchestrator: Arc::clone(&engine.orchestrator),
            repositories: engine.repositories.clone(),
            acquire_timeout: engine.config.resource_acquire_timeout(),
        }
    }
}

/// Stores a submitted document unless the repository already knows it.
///
/// A redelivered submission therefore resumes (or re-reports) the existing
/// record instead of starting over. Progress is only ever taken from the
/// repository; a new document always starts at INITIATING.
async fn register_document(ctx: &SubmissionContext, submission: DocumentSubmission) -> Result<String> {
    let mut document = submission.document;
    let repository = ctx.repositories.acquire(ctx.acquire_timeout).await?;
    match repository.load_document(&document.id).await {
        Ok(existing) => {
            debug!(document_id = %existing.id, state = %existing.state, "Document already registered");
        }
        Err(e) if e.terminal_kind() == Some(TerminalKind::NotFound) => {
            if document.state != PipelineState::Initiating || document.outcome_emitted {
                warn!(
                    document_id = %document.id,
                    claimed = %document.state,
                    "Submission carries progress for an unknown document; starting from INITIATING"
                );
                document.reset_progress();
            }
            repository
                .save_stage_outcome(&document.id, document.state, &document)
                .await
                .map_err(|e| PipelineError::Repository(e.to_string()))?;
            debug!(document_id = %document.id, "Registered new document");
        }
        Err(e) => return Err(PipelineError::Repository(e.to_string())),
    }
    Ok(document.id)
}

/// Broker-independent core of the worker: decode, register, run.
pub async fn execute_submission(data: &[u8], ctx: &SubmissionContext) -> Result<PipelineReport> {
    let submission: DocumentSubmission = match serde_json::from_slice(data) {
        Ok(submission) => submission,
        Err(e) => {
            error!(error = %e, payload = %String::from_utf8_lossy(data), "Failed to deserialize submission message");
            SUBMISSION_DESERIALIZATION_ERRORS_TOTAL.inc();
            return Err(e.into());
        }
    };
    let document_id = register_document(ctx, submission).await?;
    ctx.orchestrator.run_pipeline(&document_id).await
}

/// Runs one delivery and settles it with the broker.
///
/// Cancelled runs (shutdown) are requeued so another worker can resume them;
/// everything else is acked, since the outcome already went to the outcome
/// sink or the message can never succeed.
pub async fn process_delivery(delivery: Delivery, ctx: SubmissionContext) {
    match execute_submission(&delivery.data, &ctx).await {
        Ok(report) => {
            info!(
                document_id = %report.document_id,
                state = %report.final_state,
                "Submission finished"
            );
        }
        Err(PipelineError::Cancelled(document_id)) => {
            warn!(%document_id, "Pipeline cancelled; requeueing submission");
            let requeue = BasicNackOptions {
                requeue: true,
                ..Default::default()
            };
            if let Err(e) = delivery.nack(requeue).await {
                error!(error = %e, "Failed to nack submission message");
            }
            return;
        }
        Err(PipelineError::PipelineAlreadyActive(document_id)) => {
            debug!(%document_id, "Duplicate submission for an active pipeline");
        }
        Err(e) => {
            error!(error = %e, "Submission failed");
        }
    }
    if let Err(ack_err) = delivery.ack(BasicAckOptions::default()).await {
        error!(error = %ack_err, "Failed to ack submission message");
    }
}

/// Consumes submissions until the stream ends or `shutdown` fires. Each
/// delivery runs on its own task; the broker's prefetch bounds how many.
pub async fn consume_submissions(
    mut consumer: Consumer,
    ctx: SubmissionContext,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            next = consumer.next() => next,
            _ = shutdown.cancelled() => {
                info!("Shutdown requested; no longer consuming submissions");
                return Ok(());
            }
        };
        match next {
            Some(Ok(delivery)) => {
                let span = info_span!("submission", delivery_tag = delivery.delivery_tag);
                tokio::spawn(process_delivery(delivery, ctx.clone()).instrument(span));
            }
            Some(Err(e)) => {
                error!(error = %e, "Error receiving submission message. Worker stopping.");
                return Err(PipelineError::QueueError(format!(
                    "Consumer stream error: {}",
                    e
                )));
            }
            None => {
                info!("Consumer stream ended.");
                return Ok(());
            }
        }
    }
}

// src/orchestrator.rs

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::data_model::{Document, OutcomeEvent, PipelineState, Stage};
use crate::error::{ActivityError, PipelineError, Result, TerminalKind};
use crate::executor::{ActivityInput, ActivityRegistry, ActivityTask, StageOutput};
use crate::pipeline::classification::RuleSet;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::state::{advance, Advance, StageResult};
use crate::runtime::dispatcher::{DispatchError, WorkerPoolDispatcher};
use crate::services::{OutcomeSink, RepositoryPool};
use crate::utils::prometheus_metrics::{
    ACTIVE_PIPELINES, OUTCOME_PUBLISH_ERRORS_TOTAL, PIPELINES_FINISHED_TOTAL,
    PIPELINES_STARTED_TOTAL, STAGE_DURATION_SECONDS, STAGE_RETRIES_TOTAL,
};

/// Summary of one `run_pipeline` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub document_id: String,
    pub final_state: PipelineState,
    /// States entered during this run, in order, starting with the loaded one.
    pub states_visited: Vec<PipelineState>,
    /// Attempts used per stage during this run.
    pub attempts: HashMap<Stage, u32>,
    pub used_fallback: Option<bool>,
    pub reason: Option<String>,
}

impl PipelineReport {
    fn start(document: &Document) -> Self {
        PipelineReport {
            document_id: document.id.clone(),
            final_state: document.state,
            states_visited: vec![document.state],
            attempts: HashMap::new(),
            used_fallback: None,
            reason: None,
        }
    }

    fn finish(mut self, document: &Document) -> Self {
        self.final_state = document.state;
        self.used_fallback = document.classification.as_ref().map(|c| c.used_fallback);
        self.reason = document.error_reason.clone();
        self
    }
}

/// Removes the instance from the active set however the run ends.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    document_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.document_id);
        ACTIVE_PIPELINES.dec();
    }
}

/// Drives documents through the stage sequence.
///
/// One instance per document at a time. Every transition goes through
/// `pipeline::state::advance` and is persisted before the next stage starts.
pub struct PipelineOrchestrator {
    dispatcher: Arc<WorkerPoolDispatcher>,
    registry: ActivityRegistry,
    repositories: RepositoryPool,
    outcomes: Arc<dyn OutcomeSink>,
    config: Arc<EngineConfig>,
    rules: RwLock<Arc<RuleSet>>,
    active: Mutex<HashMap<String, CancellationToken>>,
    // Outcomes already published whose delivery flag is not saved yet.
    unrecorded: Mutex<HashSet<(String, PipelineState)>>,
    shutdown: CancellationToken,
}

impl PipelineOrchestrator {
    pub fn new(
        dispatcher: Arc<WorkerPoolDispatcher>,
        registry: ActivityRegistry,
        repositories: RepositoryPool,
        outcomes: Arc<dyn OutcomeSink>,
        config: Arc<EngineConfig>,
        rules: Arc<RuleSet>,
        shutdown: CancellationToken,
    ) -> Self {
        PipelineOrchestrator {
            dispatcher,
            registry,
            repositories,
            outcomes,
            config,
            rules: RwLock::new(rules),
            active: Mutex::new(HashMap::new()),
            unrecorded: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    /// Current rule snapshot.
    pub fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Stages started after this call see `rules`; running ones keep theirs.
    pub fn reload_rules(&self, rules: Arc<RuleSet>) {
        info!(rules = rules.len(), "Reloading document-type rules");
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = rules;
    }

    /// Stops the document's running instance. Returns false if none is active.
    pub fn cancel(&self, document_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(document_id) {
            Some(token) => {
                info!(%document_id, "Cancelling pipeline");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, document_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(document_id)
    }

    fn register(&self, document_id: &str) -> Result<(ActiveGuard<'_>, CancellationToken)> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(document_id) {
            return Err(PipelineError::PipelineAlreadyActive(document_id.to_string()));
        }
        let token = self.shutdown.child_token();
        active.insert(document_id.to_string(), token.clone());
        ACTIVE_PIPELINES.inc();
        Ok((
            ActiveGuard {
                active: &self.active,
                document_id: document_id.to_string(),
            },
            token,
        ))
    }

    /// Runs (or resumes) the document's pipeline until it reaches a terminal state.
    #[instrument(skip(self), fields(document_id = %document_id))]
    pub async fn run_pipeline(&self, document_id: &str) -> Result<PipelineReport> {
        let (_guard, cancel) = self.register(document_id)?;
        let mut document = self.load(document_id).await?;
        let mut report = PipelineReport::start(&document);

        if document.state.is_terminal() {
            if !document.outcome_emitted {
                info!(state = %document.state, "Re-emitting undelivered outcome");
                self.emit_outcome(&mut document, &report).await?;
            }
            return Ok(report.finish(&document));
        }

        PIPELINES_STARTED_TOTAL.inc();
        info!(state = %document.state, "Pipeline started");

        while let Some(stage) = document.state.stage() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled(document.id.clone()));
            }
            let result = if stage == Stage::Initiate {
                StageResult::success(StageOutput::Initiated)
            } else {
                self.run_stage(stage, &document, &cancel, &mut report).await?
            };
            // A result that arrives after cancellation is dropped.
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled(document.id.clone()));
            }
            self.apply(&mut document, result, &mut report).await?;
        }

        self.emit_outcome(&mut document, &report).await?;
        match document.error_reason.as_deref() {
            Some(reason) => warn!(state = %document.state, %reason, "Pipeline failed"),
            None => info!(state = %document.state, "Pipeline completed"),
        }
        Ok(report.finish(&document))
    }

    /// Runs one stage with retries and returns the result to apply.
    async fn run_stage(
        &self,
        stage: Stage,
        document: &Document,
        cancel: &CancellationToken,
        report: &mut PipelineReport,
    ) -> Result<StageResult> {
        let activity = self.registry.get(stage)?;
        let timeout = self.config.timeout_for(stage);
        let mut task = ActivityTask {
            stage,
            queue: activity.queue(),
            input: ActivityInput {
                document: document.clone(),
                rules: self.rules(),
                attempt: 1,
                timeout,
                cancel: cancel.clone(),
            },
            timeout,
            policy: RetryPolicy::from_config(&self.config, stage),
        };
        let timer = STAGE_DURATION_SECONDS
            .with_label_values(&[stage.name()])
            .start_timer();

        loop {
            report.attempts.insert(stage, task.attempt());
            debug!(%stage, attempt = task.attempt(), queue = %task.queue, "Dispatching activity");

            let activity = Arc::clone(&activity);
            let input = task.input.clone();
            let dispatched = self
                .dispatcher
                .submit(task.queue, task.timeout, cancel, async move {
                    activity.execute(input).await
                })
                .await;

            let error: ActivityError = match dispatched {
                Ok(output) => {
                    timer.observe_duration();
                    return Ok(StageResult::success(output));
                }
                Err(DispatchError::Cancelled(_)) => {
                    return Err(PipelineError::Cancelled(document.id.clone()))
                }
                Err(e) => e.into(),
            };
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled(document.id.clone()));
            }

            if task.policy.should_retry(&error, task.attempt()) {
                let delay = task.policy.backoff(task.attempt());
                STAGE_RETRIES_TOTAL.with_label_values(&[stage.name()]).inc();
                warn!(
                    %stage,
                    attempt = task.attempt(),
                    max_attempts = task.policy.max_attempts(),
                    ?delay,
                    error = %error,
                    "Stage attempt failed; retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(PipelineError::Cancelled(document.id.clone()))
                    }
                }
                task.next_attempt();
                continue;
            }

            timer.observe_duration();
            if error.is_retryable() {
                warn!(%stage, attempts = task.attempt(), error = %error, "Retries exhausted");
            } else {
                debug!(%stage, error = %error, "Stage failed terminally");
            }
            return Ok(StageResult::failure(stage, &error));
        }
    }

    async fn apply(
        &self,
        document: &mut Document,
        result: StageResult,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let stage = result.stage;
        match advance(document, result)? {
            Advance::Moved { from, to } => {
                debug!(%stage, %from, %to, "Transition");
                report.states_visited.push(to);
                self.persist(document).await
            }
            Advance::Duplicate => {
                debug!(%stage, state = %document.state, "Ignoring duplicate stage result");
                Ok(())
            }
        }
    }

    async fn load(&self, document_id: &str) -> Result<Document> {
        let repository = self
            .repositories
            .acquire(self.config.resource_acquire_timeout())
            .await?;
        repository.load_document(document_id).await.map_err(|e| {
            match e.terminal_kind() {
                Some(TerminalKind::NotFound) => {
                    PipelineError::DocumentNotFound(document_id.to_string())
                }
                _ => PipelineError::Repository(e.to_string()),
            }
        })
    }

    async fn persist(&self, document: &Document) -> Result<()> {
        let repository = self
            .repositories
            .acquire(self.config.resource_acquire_timeout())
            .await?;
        repository
            .save_stage_outcome(&document.id, document.state, document)
            .await
            .map_err(|e| PipelineError::Repository(e.to_string()))
    }

    /// Publishes the terminal event, then records that it was delivered.
    ///
    /// An event whose delivery could not be recorded is not published again
    /// by this process; a later run only retries the save.
    async fn emit_outcome(&self, document: &mut Document, report: &PipelineReport) -> Result<()> {
        let key = (document.id.clone(), document.state);
        let published = self
            .unrecorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key);

        if published {
            debug!(state = %document.state, "Outcome already published; recording delivery only");
        } else {
            let event = OutcomeEvent {
                document_id: document.id.clone(),
                state: document.state,
                reason: document.error_reason.clone(),
                used_fallback: document.classification.as_ref().map(|c| c.used_fallback),
                attempts: report.attempts.clone(),
                emitted_at: Utc::now(),
            };
            if let Err(e) = self.outcomes.emit(&event).await {
                OUTCOME_PUBLISH_ERRORS_TOTAL.inc();
                error!(error = %e, state = %event.state, "Failed to emit outcome");
                return Err(e);
            }
            PIPELINES_FINISHED_TOTAL
                .with_label_values(&[document.state.as_str()])
                .inc();
            self.unrecorded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.clone());
        }

        document.outcome_emitted = true;
        self.record_delivery(document).await?;
        self.unrecorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        Ok(())
    }

    /// Saves the delivered flag, retrying transient repository failures.
    async fn record_delivery(&self, document: &Document) -> Result<()> {
        let policy = RetryPolicy::engine_wide(&self.config);
        let mut attempt = 1;
        loop {
            match self.persist(document).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < policy.max_attempts() && !self.shutdown.is_cancelled() => {
                    let delay = policy.backoff(attempt);
                    warn!(attempt, ?delay, error = %e, "Failed to record outcome delivery; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, "Outcome delivered but not recorded");
                    return Err(e);
                }
            }
        }
    }
}

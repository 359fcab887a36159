// Orchestrator runs with hand-built activities, for failure paths the
// real collaborators cannot easily produce.

mod common;

#[cfg(test)]
mod tests {
    use super::common::test_config;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_util::sync::CancellationToken;
    use DocBlaster::config::EngineConfig;
    use DocBlaster::data_model::{
        ClassificationResult, Document, ExtractedPayload, OutcomeEvent, PipelineState, Stage,
    };
    use DocBlaster::error::ActivityError;
    use DocBlaster::executor::{Activity, ActivityInput, ActivityRegistry, StageOutput};
    use DocBlaster::pipeline::classification::RuleSet;
    use DocBlaster::runtime::dispatcher::{DomainLimits, WorkerPoolDispatcher};
    use DocBlaster::runtime::isolation::IsolatedExecutor;
    use DocBlaster::services::{
        ChannelOutcomeSink, DocumentRepository, InMemoryDocumentRepository,
        RepositoryConnectionManager, RepositoryConnector, RepositoryPool,
    };
    use DocBlaster::{PipelineError, PipelineOrchestrator};

    /// Succeeds immediately with a plausible output for its stage.
    struct PassingActivity(Stage);

    #[async_trait]
    impl Activity for PassingActivity {
        fn name(&self) -> &'static str {
            "passing"
        }

        fn stage(&self) -> Stage {
            self.0
        }

        async fn execute(&self, _input: ActivityInput) -> Result<StageOutput, ActivityError> {
            Ok(match self.0 {
                Stage::Validate => StageOutput::Validated,
                Stage::Extract => {
                    StageOutput::Extracted(ExtractedPayload::from_text("Invoice number 1", 1 << 20)?)
                }
                Stage::Classify => StageOutput::Classified(ClassificationResult {
                    category: "invoice".to_string(),
                    subcategory: None,
                    confident: true,
                    used_fallback: false,
                }),
                Stage::Parse => StageOutput::Parsed(json!({ "total": 1 })),
                Stage::UpdateProduct | Stage::Initiate => StageOutput::ProductUpdated,
            })
        }
    }

    /// Extraction whose isolated worker always panics.
    struct CrashingExtract {
        isolation: IsolatedExecutor,
    }

    #[async_trait]
    impl Activity for CrashingExtract {
        fn name(&self) -> &'static str {
            "crashing-extract"
        }

        fn stage(&self) -> Stage {
            Stage::Extract
        }

        async fn execute(&self, input: ActivityInput) -> Result<StageOutput, ActivityError> {
            let output = self
                .isolation
                .run(
                    || -> Result<StageOutput, ActivityError> { panic!("extractor crashed") },
                    input.timeout,
                    &input.cancel,
                )
                .await?;
            Ok(output)
        }
    }

    /// Fails saves that mark the outcome as delivered while `failures` is non-zero.
    struct FlakyDeliveryRepository {
        inner: InMemoryDocumentRepository,
        failures: AtomicUsize,
        delivery_saves: AtomicUsize,
    }

    #[async_trait]
    impl DocumentRepository for FlakyDeliveryRepository {
        async fn load_document(&self, id: &str) -> Result<Document, ActivityError> {
            self.inner.load_document(id).await
        }

        async fn save_stage_outcome(
            &self,
            id: &str,
            state: PipelineState,
            document: &Document,
        ) -> Result<(), ActivityError> {
            if document.outcome_emitted {
                self.delivery_saves.fetch_add(1, Ordering::SeqCst);
                let remaining = self.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(ActivityError::transient("repository unavailable"));
                }
            }
            self.inner.save_stage_outcome(id, state, document).await
        }

        async fn ping(&self) -> Result<(), ActivityError> {
            Ok(())
        }
    }

    fn orchestrator<R: DocumentRepository + 'static>(
        repository: Arc<R>,
        extract: Arc<dyn Activity>,
        config: EngineConfig,
    ) -> (PipelineOrchestrator, UnboundedReceiver<OutcomeEvent>) {
        let mut activities: Vec<Arc<dyn Activity>> = vec![extract];
        for stage in Stage::ACTIVITY_STAGES {
            if stage != Stage::Extract {
                activities.push(Arc::new(PassingActivity(stage)));
            }
        }
        let registry = ActivityRegistry::new(activities).unwrap();
        let dispatcher = Arc::new(WorkerPoolDispatcher::new(
            |_| DomainLimits {
                max_concurrency: 4,
                max_concurrent_polls: 16,
            },
            Duration::from_millis(20),
        ));
        let connector: Arc<dyn RepositoryConnector> = Arc::new(repository);
        let repositories =
            RepositoryPool::new("repository", RepositoryConnectionManager::new(connector), 4, None);
        let (outcomes, receiver) = ChannelOutcomeSink::new();
        let orchestrator = PipelineOrchestrator::new(
            dispatcher,
            registry,
            repositories,
            Arc::new(outcomes),
            Arc::new(config),
            Arc::new(RuleSet::empty()),
            CancellationToken::new(),
        );
        (orchestrator, receiver)
    }

    fn drain(receiver: &mut UnboundedReceiver<OutcomeEvent>) -> Vec<OutcomeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn new_document(id: &str) -> Document {
        Document::new(id, "user-1", "workspace-1", format!("uploads/{}", id), "scan.pdf")
    }

    #[tokio::test]
    async fn test_worker_crash_exhausts_retries_into_extraction_failure() {
        let config = test_config();
        let max_attempts = config.max_retries_for(Stage::Extract) + 1;
        let repository = Arc::new(InMemoryDocumentRepository::new());
        repository.insert(new_document("crashy")).await;
        let isolation = IsolatedExecutor::new(1).unwrap();
        let extract = Arc::new(CrashingExtract {
            isolation: isolation.clone(),
        });
        let (orchestrator, mut outcomes) = orchestrator(Arc::clone(&repository), extract, config);

        let report = orchestrator.run_pipeline("crashy").await.unwrap();
        assert_eq!(report.final_state, PipelineState::TextExtractionFailed);
        assert_eq!(report.attempts.get(&Stage::Extract), Some(&max_attempts));
        assert_eq!(max_attempts, 4);
        assert!(report.reason.as_deref().unwrap_or_default().contains("extractor crashed"));
        // Every crash retired its worker.
        assert_eq!(isolation.replaced_workers(), max_attempts as usize);

        let events = drain(&mut outcomes);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, PipelineState::TextExtractionFailed);
        assert_eq!(events[0].attempts.get(&Stage::Extract), Some(&max_attempts));

        let stored = repository.get("crashy").await.unwrap();
        assert_eq!(stored.state, PipelineState::TextExtractionFailed);
        assert!(stored.outcome_emitted);
        assert!(!stored.is_text_extracted);
    }

    #[tokio::test]
    async fn test_unrecorded_delivery_is_not_published_again() {
        let repository = Arc::new(FlakyDeliveryRepository {
            inner: InMemoryDocumentRepository::new(),
            failures: AtomicUsize::new(usize::MAX),
            delivery_saves: AtomicUsize::new(0),
        });
        repository.inner.insert(new_document("doc-1")).await;
        let (orchestrator, mut outcomes) = orchestrator(
            Arc::clone(&repository),
            Arc::new(PassingActivity(Stage::Extract)),
            test_config(),
        );

        let first = orchestrator.run_pipeline("doc-1").await;
        assert!(matches!(first, Err(PipelineError::Repository(_))));
        assert_eq!(drain(&mut outcomes).len(), 1);
        // One save plus the configured retries.
        assert_eq!(repository.delivery_saves.load(Ordering::SeqCst), 4);
        let stored = repository.inner.get("doc-1").await.unwrap();
        assert_eq!(stored.state, PipelineState::Completed);
        assert!(!stored.outcome_emitted);

        // The repository recovers; the next run only records the delivery.
        repository.failures.store(0, Ordering::SeqCst);
        let second = orchestrator.run_pipeline("doc-1").await.unwrap();
        assert_eq!(second.final_state, PipelineState::Completed);
        assert!(drain(&mut outcomes).is_empty());
        assert!(repository.inner.get("doc-1").await.unwrap().outcome_emitted);

        let third = orchestrator.run_pipeline("doc-1").await.unwrap();
        assert_eq!(third.final_state, PipelineState::Completed);
        assert!(drain(&mut outcomes).is_empty());
    }

    #[tokio::test]
    async fn test_transient_delivery_save_failure_is_retried() {
        let repository = Arc::new(FlakyDeliveryRepository {
            inner: InMemoryDocumentRepository::new(),
            failures: AtomicUsize::new(2),
            delivery_saves: AtomicUsize::new(0),
        });
        repository.inner.insert(new_document("doc-2")).await;
        let (orchestrator, mut outcomes) = orchestrator(
            Arc::clone(&repository),
            Arc::new(PassingActivity(Stage::Extract)),
            test_config(),
        );

        let report = orchestrator.run_pipeline("doc-2").await.unwrap();
        assert_eq!(report.final_state, PipelineState::Completed);
        assert_eq!(drain(&mut outcomes).len(), 1);
        assert_eq!(repository.delivery_saves.load(Ordering::SeqCst), 3);
        assert!(repository.inner.get("doc-2").await.unwrap().outcome_emitted);
    }
}

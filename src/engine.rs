// src/engine.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{PipelineError, Result};
use crate::executor::{Activity, ActivityRegistry};
use crate::orchestrator::PipelineOrchestrator;
use crate::pipeline::activities::{
    ClassifyDocument, ExtractText, ParseDocument, UpdateProduct, ValidateDocument,
};
use crate::pipeline::classification::{ClassificationStrategySelector, RuleSet};
use crate::pipeline::parsers::{
    DocumentParser, KeyValueParser, ParserRegistry, StructuredExtractionParser,
};
use crate::runtime::dispatcher::WorkerPoolDispatcher;
use crate::runtime::health::SchedulerHealthMonitor;
use crate::runtime::isolation::IsolatedExecutor;
use crate::services::{
    ClassificationService, NotifierRegistry, ObjectStoreConnector, OutcomeSink,
    RepositoryConnectionManager, RepositoryConnector, RepositoryPool, StorageClientManager,
    StoragePool, StructuredExtractor,
};

const MIN_REAPER_INTERVAL: Duration = Duration::from_millis(100);

/// External systems the engine talks to.
pub struct Collaborators {
    pub object_store: Arc<dyn ObjectStoreConnector>,
    pub repository: Arc<dyn RepositoryConnector>,
    pub classifier: Arc<dyn ClassificationService>,
    pub extractor: Arc<dyn StructuredExtractor>,
    pub notifiers: NotifierRegistry,
    pub outcomes: Arc<dyn OutcomeSink>,
}

/// Everything that lives for the whole process: pools, dispatcher, health
/// monitor and the orchestrator built on top of them.
pub struct EngineRuntime {
    pub config: Arc<EngineConfig>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub dispatcher: Arc<WorkerPoolDispatcher>,
    pub health: Arc<SchedulerHealthMonitor>,
    pub isolation: IsolatedExecutor,
    pub storage: StoragePool,
    pub repositories: RepositoryPool,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

fn check_bindings(rules: &RuleSet, parsers: &ParserRegistry, notifiers: &NotifierRegistry) -> Result<()> {
    for config in rules.configurations() {
        if !parsers.contains(&config.parser_activity) {
            return Err(PipelineError::ConfigValidationError(format!(
                "category '{}' is bound to unknown parser '{}'",
                config.category, config.parser_activity
            )));
        }
        if !notifiers.contains(&config.notify_activity) {
            return Err(PipelineError::ConfigValidationError(format!(
                "category '{}' is bound to unknown notifier '{}'",
                config.category, config.notify_activity
            )));
        }
    }
    Ok(())
}

impl EngineRuntime {
    /// Validates the configuration and starts every shared component.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip_all, fields(rules = rules.len()))]
    pub async fn start(
        config: EngineConfig,
        rules: RuleSet,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let acquire_timeout = config.resource_acquire_timeout();

        let isolation = IsolatedExecutor::new(config.process_pool_size)?;
        let storage = StoragePool::new(
            "object-storage",
            StorageClientManager::new(collaborators.object_store),
            config.resource_pool_size,
            config.resource_max_idle(),
        );
        let repositories = RepositoryPool::new(
            "document-repository",
            RepositoryConnectionManager::new(collaborators.repository),
            config.resource_pool_size,
            config.resource_max_idle(),
        );
        for (name, warmed) in [
            (storage.name().to_string(), storage.warm().await),
            (repositories.name().to_string(), repositories.warm().await),
        ] {
            if let Err(e) = warmed {
                warn!(pool = %name, error = %e, "Could not pre-create pooled handles; continuing lazily");
            }
        }

        let parser_list: Vec<Arc<dyn DocumentParser>> = vec![
            Arc::new(KeyValueParser::new(isolation.clone())),
            Arc::new(StructuredExtractionParser::new(collaborators.extractor)),
        ];
        let parsers = ParserRegistry::new(parser_list);
        check_bindings(&rules, &parsers, &collaborators.notifiers)?;

        let selector = Arc::new(ClassificationStrategySelector::new(
            isolation.clone(),
            collaborators.classifier,
        ));
        let activities: Vec<Arc<dyn Activity>> = vec![
            Arc::new(ValidateDocument::new(
                storage.clone(),
                isolation.clone(),
                acquire_timeout,
            )),
            Arc::new(ExtractText::new(
                storage.clone(),
                isolation.clone(),
                acquire_timeout,
                config.payload_compression_threshold_bytes,
            )),
            Arc::new(ClassifyDocument::new(selector)),
            Arc::new(ParseDocument::new(parsers)),
            Arc::new(UpdateProduct::new(
                storage.clone(),
                collaborators.notifiers,
                acquire_timeout,
                config.parsed_result_ttl(),
            )),
        ];
        let registry = ActivityRegistry::new(activities)?;

        let limits_config = Arc::clone(&config);
        let dispatcher = Arc::new(WorkerPoolDispatcher::new(
            move |queue| limits_config.limits_for(queue),
            config.slot_reclaim_grace(),
        ));
        let health = Arc::new(SchedulerHealthMonitor::new(config.health.clone()));

        let mut background = Vec::new();
        background.push(health.spawn(shutdown.child_token()));
        background.push(dispatcher.spawn_reaper(
            config.slot_reclaim_grace().max(MIN_REAPER_INTERVAL),
            shutdown.child_token(),
        ));
        background.extend(dispatcher.attach_health(health.subscribe(), shutdown.child_token()));

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::clone(&dispatcher),
            registry,
            repositories.clone(),
            collaborators.outcomes,
            Arc::clone(&config),
            Arc::new(rules),
            shutdown.child_token(),
        ));

        info!(
            process_pool_size = isolation.size(),
            resource_pool_size = config.resource_pool_size,
            "Engine started"
        );
        Ok(EngineRuntime {
            config,
            orchestrator,
            dispatcher,
            health,
            isolation,
            storage,
            repositories,
            shutdown,
            background,
        })
    }

    /// Cancels running pipelines, stops background tasks and joins the
    /// isolated workers.
    pub async fn shutdown(self) {
        info!("Shutting down engine");
        self.shutdown.cancel();
        for handle in self.background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.isolation.shutdown();
    }
}

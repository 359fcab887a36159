// src/bin/worker.rs

use clap::Parser;
use lapin::options::ConfirmSelectOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use DocBlaster::config::worker::Args;
use DocBlaster::config::{load_document_types, load_engine_config};
use DocBlaster::data_model::Stage;
use DocBlaster::pipeline::classification::RuleSet;
use DocBlaster::server::run_metrics_server;
use DocBlaster::services::{
    intelligence_from_url, AmqpOutcomePublisher, InMemoryDocumentRepository, LocalObjectStore,
    NotifierRegistry,
};
use DocBlaster::utils::common::{connect_rabbitmq, setup_channels_and_queues};
use DocBlaster::utils::logging::init_tracing;
use DocBlaster::worker_logic::{consume_submissions, SubmissionContext};
use DocBlaster::{Collaborators, EngineRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref(), args.json_logs, "worker");

    info!("Loading engine configuration from {}", args.engine_config.display());
    let config = load_engine_config(&args.engine_config)?;
    config.validate()?;
    let rules = RuleSet::compile(load_document_types(&args.document_types)?)?;
    info!(document_types = rules.len(), "Loaded document-type bindings");
    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let (classifier, extractor) = intelligence_from_url(args.intelligence_url.as_deref())?;
    let notifiers = NotifierRegistry::standard(
        args.product_notify_url.as_deref(),
        config.timeout_for(Stage::UpdateProduct),
    )?;

    let conn = connect_rabbitmq(&args.amqp_addr).await?;
    let (publish_channel, consumer) = setup_channels_and_queues(
        &conn,
        &args.outcome_queue,
        &args.submission_queue,
        args.prefetch_count,
        "worker",
    )
    .await?;
    publish_channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;

    let engine = EngineRuntime::start(
        config,
        rules,
        Collaborators {
            object_store: Arc::new(Arc::new(LocalObjectStore::new(args.storage_root.clone()))),
            repository: Arc::new(Arc::new(InMemoryDocumentRepository::new())),
            classifier,
            extractor,
            notifiers,
            outcomes: Arc::new(AmqpOutcomePublisher::new(publish_channel, args.outcome_queue.clone())),
        },
    )
    .await?;

    let shutdown = CancellationToken::new();
    if let Some(port) = args.metrics_port {
        let monitor = Arc::clone(&engine.health);
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(port, monitor, server_shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            signal_shutdown.cancel();
        }
    });

    info!(queue = %args.submission_queue, "Worker consuming submissions");
    let consumed = consume_submissions(consumer, SubmissionContext::new(&engine), shutdown.clone()).await;
    shutdown.cancel();
    engine.shutdown().await;
    if let Err(e) = conn.close(200, "worker shutting down").await {
        error!(error = %e, "Failed to close RabbitMQ connection");
    }
    consumed?;
    info!("Worker stopped");
    Ok(())
}

// src/bin/runner.rs
//
// Runs every file of a directory through the full engine in-process.

use clap::Parser;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use DocBlaster::config::{load_document_types, load_engine_config, EngineConfig};
use DocBlaster::data_model::{Document, PipelineState, Stage};
use DocBlaster::pipeline::classification::RuleSet;
use DocBlaster::services::{
    intelligence_from_url, ChannelOutcomeSink, InMemoryDocumentRepository, LocalObjectStore,
    NotifierRegistry,
};
use DocBlaster::utils::logging::init_tracing;
use DocBlaster::{Collaborators, EngineRuntime};

#[derive(Parser, Debug)]
#[command(author, version, about = "Process a directory of documents locally", long_about = None)]
struct Args {
    /// Directory with the files to process
    #[arg(short, long)]
    input_dir: PathBuf,

    /// Directory used as object storage (uploads and parsed results)
    #[arg(short, long, default_value = "data/runner")]
    output_dir: PathBuf,

    /// Engine configuration YAML; defaults are used when omitted
    #[arg(short = 'c', long)]
    engine_config: Option<PathBuf>,

    /// Document-type bindings YAML; without it every document goes to the fallback classifier
    #[arg(short = 't', long)]
    document_types: Option<PathBuf>,

    /// Product the documents are submitted for
    #[arg(long)]
    product: Option<String>,

    /// Password tried on encrypted PDFs
    #[arg(long)]
    password: Option<String>,

    /// Base URL of the classification/extraction service
    #[arg(long)]
    intelligence_url: Option<String>,

    /// Base URL of the downstream product service
    #[arg(long)]
    product_notify_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(None, false, "runner");

    let config = match &args.engine_config {
        Some(path) => load_engine_config(path)?,
        None => EngineConfig::default(),
    };
    let rules = match &args.document_types {
        Some(path) => RuleSet::compile(load_document_types(path)?)?,
        None => RuleSet::empty(),
    };
    let (classifier, extractor) = intelligence_from_url(args.intelligence_url.as_deref())?;
    let notifiers = NotifierRegistry::standard(
        args.product_notify_url.as_deref(),
        config.timeout_for(Stage::UpdateProduct),
    )?;

    // Upload every regular file into the store.
    let store = Arc::new(LocalObjectStore::new(args.output_dir.clone()));
    let repository = Arc::new(InMemoryDocumentRepository::new());
    let uploads = args.output_dir.join("uploads");
    tokio::fs::create_dir_all(&uploads).await?;
    let mut document_ids = Vec::new();
    let mut entries = tokio::fs::read_dir(&args.input_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let id = uuid::Uuid::new_v4().to_string();
        tokio::fs::copy(entry.path(), uploads.join(&id)).await?;

        let mut document = Document::new(&id, "local", "local", format!("uploads/{}", id), &file_name);
        document.product = args.product.clone();
        document.password = args.password.clone();
        repository.insert(document).await;
        info!(%id, file = %file_name, "Queued document");
        document_ids.push((id, file_name));
    }
    if document_ids.is_empty() {
        warn!("No files found in {}", args.input_dir.display());
        return Ok(());
    }

    let (outcomes, mut events) = ChannelOutcomeSink::new();
    let engine = EngineRuntime::start(
        config,
        rules,
        Collaborators {
            object_store: Arc::new(store),
            repository: Arc::new(Arc::clone(&repository)),
            classifier,
            extractor,
            notifiers,
            outcomes: Arc::new(outcomes),
        },
    )
    .await?;

    let orchestrator = Arc::clone(&engine.orchestrator);
    let runs = document_ids.iter().map(|(id, _)| {
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.run_pipeline(id).await }
    });
    let reports = join_all(runs).await;
    engine.shutdown().await;

    let mut summary: BTreeMap<PipelineState, usize> = BTreeMap::new();
    println!("{:<40} {:<36} {}", "file", "state", "reason");
    for ((id, file_name), report) in document_ids.iter().zip(reports) {
        match report {
            Ok(report) => {
                *summary.entry(report.final_state).or_default() += 1;
                println!(
                    "{:<40} {:<36} {}",
                    file_name,
                    report.final_state.as_str(),
                    report.reason.unwrap_or_default()
                );
            }
            Err(e) => {
                error!(%id, error = %e, "Pipeline did not finish");
                println!("{:<40} {:<36} {}", file_name, "ERROR", e);
            }
        }
    }

    let mut emitted = 0;
    while events.try_recv().is_ok() {
        emitted += 1;
    }
    println!();
    for (state, count) in summary {
        println!("{:<36} {}", state.as_str(), count);
    }
    println!("Outcome events emitted: {}", emitted);
    println!("Parsed results under {}", args.output_dir.join("parsed").display());
    Ok(())
}

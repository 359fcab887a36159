// src/services/mod.rs
//
// Interfaces to everything outside the engine, plus the implementations the
// binaries and tests wire in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::data_model::{Document, OutcomeEvent, PipelineState};
use crate::error::{ActivityError, Result};

pub mod intelligence;
pub mod notifier;
pub mod outcome;
pub mod repository;
pub mod storage;

pub use intelligence::{intelligence_from_url, HttpIntelligenceClient, UnconfiguredIntelligence};
pub use notifier::{HttpProductNotifier, LoggingNotifier, NotifierRegistry};
pub use outcome::{AmqpOutcomePublisher, ChannelOutcomeSink};
pub use repository::{InMemoryDocumentRepository, RepositoryConnectionManager, RepositoryPool};
pub use storage::{InMemoryObjectStore, LocalObjectStore, StorageClientManager, StoragePool};

/// Blob storage for uploaded files and parsed results.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> std::result::Result<Vec<u8>, ActivityError>;

    /// Stores `bytes` under `key`; the object disappears after `ttl` if one is given.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), ActivityError>;

    async fn ping(&self) -> std::result::Result<(), ActivityError>;
}

/// Opens new object-store client handles for the storage pool.
#[async_trait]
pub trait ObjectStoreConnector: Send + Sync {
    async fn connect(&self) -> std::result::Result<Arc<dyn ObjectStore>, ActivityError>;
}

// A shared store hands out clones of itself.
#[async_trait]
impl<S: ObjectStore + 'static> ObjectStoreConnector for Arc<S> {
    async fn connect(&self) -> std::result::Result<Arc<dyn ObjectStore>, ActivityError> {
        Ok(Arc::clone(self) as Arc<dyn ObjectStore>)
    }
}

/// Durable home of the document record.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn load_document(&self, id: &str) -> std::result::Result<Document, ActivityError>;

    /// Persists the record after a transition into `state`.
    async fn save_stage_outcome(
        &self,
        id: &str,
        state: PipelineState,
        document: &Document,
    ) -> std::result::Result<(), ActivityError>;

    async fn ping(&self) -> std::result::Result<(), ActivityError>;
}

#[async_trait]
pub trait RepositoryConnector: Send + Sync {
    async fn connect(&self) -> std::result::Result<Arc<dyn DocumentRepository>, ActivityError>;
}

#[async_trait]
impl<R: DocumentRepository + 'static> RepositoryConnector for Arc<R> {
    async fn connect(&self) -> std::result::Result<Arc<dyn DocumentRepository>, ActivityError> {
        Ok(Arc::clone(self) as Arc<dyn DocumentRepository>)
    }
}

/// Answer of the generative classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalClassification {
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
}

#[async_trait]
pub trait ClassificationService: Send + Sync {
    async fn classify(&self, text: &str)
        -> std::result::Result<ExternalClassification, ActivityError>;
}

#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    async fn extract_structured(&self, text: &str) -> std::result::Result<Value, ActivityError>;
}

/// Downstream product that receives parsed documents.
#[async_trait]
pub trait ProductNotifier: Send + Sync {
    async fn notify(&self, document_id: &str, parsed_data: &Value)
        -> std::result::Result<(), ActivityError>;
}

/// Receives the single terminal event of each pipeline instance.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn emit(&self, event: &OutcomeEvent) -> Result<()>;
}

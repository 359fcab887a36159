// src/services/repository.rs

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{DocumentRepository, RepositoryConnector};
use crate::data_model::{Document, PipelineState};
use crate::error::{ActivityError, TerminalKind};
use crate::runtime::resource_pool::{Health, ResourceManager, ResourcePool};

pub type RepositoryPool = ResourcePool<RepositoryConnectionManager>;

#[derive(Default)]
struct Records {
    documents: HashMap<String, Document>,
    history: HashMap<String, Vec<PipelineState>>,
}

/// Document records held in memory, with the sequence of states each one
/// was saved in.
///
/// A record that reached a terminal state can still be re-saved (to set
/// bookkeeping flags) but never moved to a different state.
#[derive(Default)]
pub struct InMemoryDocumentRepository {
    records: RwLock<Records>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, document: Document) {
        let mut records = self.records.write().await;
        records
            .history
            .insert(document.id.clone(), vec![document.state]);
        records.documents.insert(document.id.clone(), document);
    }

    pub async fn get(&self, id: &str) -> Option<Document> {
        self.records.read().await.documents.get(id).cloned()
    }

    /// States the record was saved in, oldest first.
    pub async fn history(&self, id: &str) -> Vec<PipelineState> {
        self.records
            .read()
            .await
            .history
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn load_document(&self, id: &str) -> Result<Document, ActivityError> {
        self.get(id).await.ok_or_else(|| {
            ActivityError::terminal(TerminalKind::NotFound, format!("document '{}' not found", id))
        })
    }

    async fn save_stage_outcome(
        &self,
        id: &str,
        state: PipelineState,
        document: &Document,
    ) -> Result<(), ActivityError> {
        let mut records = self.records.write().await;
        let previous = records.documents.get(id).map(|doc| doc.state);
        if let Some(previous) = previous {
            if previous.is_terminal() && previous != state {
                return Err(ActivityError::terminal(
                    TerminalKind::Rejected,
                    format!(
                        "document '{}' is terminal in {} and cannot move to {}",
                        id, previous, state
                    ),
                ));
            }
        }

        let mut stored = document.clone();
        stored.state = state;
        stored.updated_at = Utc::now();
        records.documents.insert(id.to_string(), stored);

        let history = records.history.entry(id.to_string()).or_default();
        if history.last() != Some(&state) {
            history.push(state);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), ActivityError> {
        Ok(())
    }
}

/// Builds repository connections for the pool and probes them with `ping`.
pub struct RepositoryConnectionManager {
    connector: Arc<dyn RepositoryConnector>,
}

impl RepositoryConnectionManager {
    pub fn new(connector: Arc<dyn RepositoryConnector>) -> Self {
        RepositoryConnectionManager { connector }
    }
}

#[async_trait]
impl ResourceManager for RepositoryConnectionManager {
    type Resource = Arc<dyn DocumentRepository>;

    async fn create(&self) -> Result<Self::Resource, ActivityError> {
        self.connector.connect().await
    }

    async fn check_health(&self, resource: &Self::Resource) -> Health {
        match resource.ping().await {
            Ok(()) => Health::Healthy,
            Err(_) => Health::Stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminal_records_cannot_change_state() {
        let repo = InMemoryDocumentRepository::new();
        let mut doc = Document::new("d1", "u", "w", "k", "f.pdf");
        repo.insert(doc.clone()).await;

        doc.state = PipelineState::InvalidFile;
        repo.save_stage_outcome("d1", PipelineState::InvalidFile, &doc)
            .await
            .unwrap();

        doc.outcome_emitted = true;
        repo.save_stage_outcome("d1", PipelineState::InvalidFile, &doc)
            .await
            .unwrap();
        assert!(repo.get("d1").await.unwrap().outcome_emitted);

        let err = repo
            .save_stage_outcome("d1", PipelineState::ExtractingText, &doc)
            .await
            .unwrap_err();
        assert_eq!(err.terminal_kind(), Some(TerminalKind::Rejected));
        assert_eq!(
            repo.history("d1").await,
            vec![PipelineState::Initiating, PipelineState::InvalidFile]
        );
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let repo = InMemoryDocumentRepository::new();
        let err = repo.load_document("nope").await.unwrap_err();
        assert_eq!(err.terminal_kind(), Some(TerminalKind::NotFound));
    }
}

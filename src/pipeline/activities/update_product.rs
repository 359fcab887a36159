// src/pipeline/activities/update_product.rs

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::data_model::Stage;
use crate::error::{ActivityError, TerminalKind};
use crate::executor::{Activity, ActivityInput, StageOutput};
use crate::services::{NotifierRegistry, StoragePool};

/// Storage key of a document's parsed result.
pub fn parsed_result_key(document_id: &str) -> String {
    format!("parsed/{}.json", document_id)
}

/// Stores the parsed result and tells the downstream product about it.
pub struct UpdateProduct {
    storage: StoragePool,
    notifiers: NotifierRegistry,
    acquire_timeout: Duration,
    result_ttl: Duration,
}

impl UpdateProduct {
    pub fn new(
        storage: StoragePool,
        notifiers: NotifierRegistry,
        acquire_timeout: Duration,
        result_ttl: Duration,
    ) -> Self {
        UpdateProduct {
            storage,
            notifiers,
            acquire_timeout,
            result_ttl,
        }
    }
}

#[async_trait]
impl Activity for UpdateProduct {
    fn name(&self) -> &'static str {
        "UpdateProduct"
    }

    fn stage(&self) -> Stage {
        Stage::UpdateProduct
    }

    async fn execute(&self, input: ActivityInput) -> Result<StageOutput, ActivityError> {
        let document = &input.document;
        let parsed = document.parsed_data.as_ref().ok_or_else(|| {
            ActivityError::terminal(
                TerminalKind::Unparseable,
                "document reached product update without parsed data",
            )
        })?;

        let body = serde_json::to_vec(parsed).map_err(|e| {
            ActivityError::terminal(TerminalKind::Unparseable, format!("parsed data: {}", e))
        })?;
        {
            let client = self.storage.acquire(self.acquire_timeout).await?;
            client
                .put(&parsed_result_key(&document.id), body, Some(self.result_ttl))
                .await?;
        }

        let notify_id = document.classification.as_ref().and_then(|c| {
            input
                .rules
                .bindings_for(&c.category, c.subcategory.as_deref(), document.product.as_deref())
                .map(|b| b.notify_activity.clone())
        });
        let notifier = self.notifiers.resolve(notify_id.as_deref())?;
        notifier.notify(&document.id, parsed).await?;
        debug!(document_id = %document.id, "Product updated");
        Ok(StageOutput::ProductUpdated)
    }
}

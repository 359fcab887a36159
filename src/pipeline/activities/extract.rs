// src/pipeline/activities/extract.rs

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::fetch_object;
use crate::data_model::{ExtractedPayload, Stage};
use crate::error::ActivityError;
use crate::executor::{Activity, ActivityInput, StageOutput};
use crate::pipeline::pdf;
use crate::runtime::isolation::IsolatedExecutor;
use crate::services::StoragePool;

/// Pulls the text out of the stored file. Re-running replaces the payload.
pub struct ExtractText {
    storage: StoragePool,
    isolation: IsolatedExecutor,
    acquire_timeout: Duration,
    compression_threshold: usize,
}

impl ExtractText {
    pub fn new(
        storage: StoragePool,
        isolation: IsolatedExecutor,
        acquire_timeout: Duration,
        compression_threshold: usize,
    ) -> Self {
        ExtractText {
            storage,
            isolation,
            acquire_timeout,
            compression_threshold,
        }
    }
}

#[async_trait]
impl Activity for ExtractText {
    fn name(&self) -> &'static str {
        "ExtractText"
    }

    fn stage(&self) -> Stage {
        Stage::Extract
    }

    async fn execute(&self, input: ActivityInput) -> Result<StageOutput, ActivityError> {
        let document = &input.document;
        let bytes = fetch_object(&self.storage, &document.storage_key, self.acquire_timeout).await?;
        let extension = document.extension();
        let password = document.password.clone();
        let threshold = self.compression_threshold;

        let payload = self
            .isolation
            .run(
                move || {
                    let format = pdf::detect_format(&bytes, extension.as_deref())?;
                    let text = pdf::extract_text(&bytes, format, password.as_deref())?;
                    ExtractedPayload::from_text(&text, threshold)
                },
                input.timeout,
                &input.cancel,
            )
            .await?;
        debug!(
            document_id = %document.id,
            bytes = payload.data.len(),
            compressed = payload.compressed,
            "Text extracted"
        );
        Ok(StageOutput::Extracted(payload))
    }
}

// src/pipeline/activities/validate.rs

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::fetch_object;
use crate::data_model::Stage;
use crate::error::{ActivityError, TerminalKind};
use crate::executor::{Activity, ActivityInput, StageOutput};
use crate::pipeline::pdf::{self, SUPPORTED_EXTENSIONS};
use crate::runtime::isolation::IsolatedExecutor;
use crate::services::StoragePool;

/// Checks the upload is a supported, readable, unlocked file.
pub struct ValidateDocument {
    storage: StoragePool,
    isolation: IsolatedExecutor,
    acquire_timeout: Duration,
}

impl ValidateDocument {
    pub fn new(storage: StoragePool, isolation: IsolatedExecutor, acquire_timeout: Duration) -> Self {
        ValidateDocument {
            storage,
            isolation,
            acquire_timeout,
        }
    }
}

#[async_trait]
impl Activity for ValidateDocument {
    fn name(&self) -> &'static str {
        "ValidateDocument"
    }

    fn stage(&self) -> Stage {
        Stage::Validate
    }

    async fn execute(&self, input: ActivityInput) -> Result<StageOutput, ActivityError> {
        let document = &input.document;
        let extension = document.extension();

        let supported = extension
            .as_deref()
            .map_or(false, |ext| SUPPORTED_EXTENSIONS.contains(&ext));
        if !supported {
            return Err(ActivityError::terminal(
                TerminalKind::UnsupportedFormat,
                format!("'{}' is not a supported file type", document.file_name),
            ));
        }
        if let (Some(allowed), Some(ext)) = (
            input.rules.allowed_extensions(document.product.as_deref()),
            extension.as_ref(),
        ) {
            if !allowed.contains(ext) {
                return Err(ActivityError::terminal(
                    TerminalKind::UnsupportedFormat,
                    format!("'.{}' files are not accepted for this product", ext),
                ));
            }
        }

        let bytes = fetch_object(&self.storage, &document.storage_key, self.acquire_timeout).await?;
        let password = document.password.clone();
        let format = self
            .isolation
            .run(
                move || pdf::inspect(&bytes, extension.as_deref(), password.as_deref()),
                input.timeout,
                &input.cancel,
            )
            .await?;
        debug!(document_id = %document.id, ?format, "Document validated");
        Ok(StageOutput::Validated)
    }
}

// src/pipeline/activities/classify.rs

use async_trait::async_trait;
use std::sync::Arc;

use crate::data_model::Stage;
use crate::error::ActivityError;
use crate::executor::{Activity, ActivityInput, StageOutput};
use crate::pipeline::classification::ClassificationStrategySelector;

pub struct ClassifyDocument {
    selector: Arc<ClassificationStrategySelector>,
}

impl ClassifyDocument {
    pub fn new(selector: Arc<ClassificationStrategySelector>) -> Self {
        ClassifyDocument { selector }
    }
}

#[async_trait]
impl Activity for ClassifyDocument {
    fn name(&self) -> &'static str {
        "ClassifyDocument"
    }

    fn stage(&self) -> Stage {
        Stage::Classify
    }

    async fn execute(&self, input: ActivityInput) -> Result<StageOutput, ActivityError> {
        let text = input.document.extracted_text()?;
        let classification = self
            .selector
            .classify(
                text,
                input.document.product.clone(),
                Arc::clone(&input.rules),
                input.timeout,
                &input.cancel,
            )
            .await?;
        Ok(StageOutput::Classified(classification))
    }
}

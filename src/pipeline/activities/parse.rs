// src/pipeline/activities/parse.rs

use async_trait::async_trait;
use tracing::debug;

use crate::data_model::Stage;
use crate::error::{ActivityError, TerminalKind};
use crate::executor::{Activity, ActivityInput, StageOutput};
use crate::pipeline::parsers::ParserRegistry;

/// Runs the parser bound to the document's category.
pub struct ParseDocument {
    parsers: ParserRegistry,
}

impl ParseDocument {
    pub fn new(parsers: ParserRegistry) -> Self {
        ParseDocument { parsers }
    }
}

#[async_trait]
impl Activity for ParseDocument {
    fn name(&self) -> &'static str {
        "ParseDocument"
    }

    fn stage(&self) -> Stage {
        Stage::Parse
    }

    async fn execute(&self, input: ActivityInput) -> Result<StageOutput, ActivityError> {
        let document = &input.document;
        let classification = document.classification.as_ref().ok_or_else(|| {
            ActivityError::terminal(
                TerminalKind::Unparseable,
                "document reached parsing without a classification",
            )
        })?;
        let binding = input.rules.bindings_for(
            &classification.category,
            classification.subcategory.as_deref(),
            document.product.as_deref(),
        );
        let parser = self
            .parsers
            .resolve(binding.map(|b| b.parser_activity.as_str()))?;
        debug!(document_id = %document.id, parser = parser.id(), "Parsing document");

        let text = document.extracted_text()?;
        let parsed = parser.parse(text, input.timeout, &input.cancel).await?;
        Ok(StageOutput::Parsed(parsed))
    }
}

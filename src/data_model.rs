use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{ActivityError, TerminalKind};
use crate::runtime::dispatcher::QueueName;
use crate::utils::compression;

/// Category assigned when no deterministic rule matches.
pub const DEFAULT_CATEGORY: &str = "unknown";

/// Externally visible status of a document's pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Initiating,
    ValidatingDocument,
    ExtractingText,
    ClassifyingDocument,
    ParsingDocument,
    UpdatingDocumentToProduct,
    Completed,
    InvalidFile,
    PasswordRequired,
    TextExtractionFailed,
    ClassifyingDocumentFailed,
    ParsingDocumentFailed,
    UpdatingDocumentToProductFailed,
}

impl PipelineState {
    pub const ALL: [PipelineState; 13] = [
        PipelineState::Initiating,
        PipelineState::ValidatingDocument,
        PipelineState::ExtractingText,
        PipelineState::ClassifyingDocument,
        PipelineState::ParsingDocument,
        PipelineState::UpdatingDocumentToProduct,
        PipelineState::Completed,
        PipelineState::InvalidFile,
        PipelineState::PasswordRequired,
        PipelineState::TextExtractionFailed,
        PipelineState::ClassifyingDocumentFailed,
        PipelineState::ParsingDocumentFailed,
        PipelineState::UpdatingDocumentToProductFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Initiating => "INITIATING",
            PipelineState::ValidatingDocument => "VALIDATING_DOCUMENT",
            PipelineState::ExtractingText => "EXTRACTING_TEXT",
            PipelineState::ClassifyingDocument => "CLASSIFYING_DOCUMENT",
            PipelineState::ParsingDocument => "PARSING_DOCUMENT",
            PipelineState::UpdatingDocumentToProduct => "UPDATING_DOCUMENT_TO_PRODUCT",
            PipelineState::Completed => "COMPLETED",
            PipelineState::InvalidFile => "INVALID_FILE",
            PipelineState::PasswordRequired => "PASSWORD_REQUIRED",
            PipelineState::TextExtractionFailed => "TEXT_EXTRACTION_FAILED",
            PipelineState::ClassifyingDocumentFailed => "CLASSIFYING_DOCUMENT_FAILED",
            PipelineState::ParsingDocumentFailed => "PARSING_DOCUMENT_FAILED",
            PipelineState::UpdatingDocumentToProductFailed => {
                "UPDATING_DOCUMENT_TO_PRODUCT_FAILED"
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed
                | PipelineState::InvalidFile
                | PipelineState::PasswordRequired
                | PipelineState::TextExtractionFailed
                | PipelineState::ClassifyingDocumentFailed
                | PipelineState::ParsingDocumentFailed
                | PipelineState::UpdatingDocumentToProductFailed
        )
    }

    pub fn is_failure(&self) -> bool {
        self.is_terminal() && *self != PipelineState::Completed
    }

    /// The stage whose activity runs while the document sits in this state.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Initiating => Some(Stage::Initiate),
            PipelineState::ValidatingDocument => Some(Stage::Validate),
            PipelineState::ExtractingText => Some(Stage::Extract),
            PipelineState::ClassifyingDocument => Some(Stage::Classify),
            PipelineState::ParsingDocument => Some(Stage::Parse),
            PipelineState::UpdatingDocumentToProduct => Some(Stage::UpdateProduct),
            _ => None,
        }
    }

    /// Edges of the pipeline state graph.
    pub fn successors(&self) -> &'static [PipelineState] {
        use PipelineState::*;
        match self {
            Initiating => &[ValidatingDocument],
            ValidatingDocument => &[ExtractingText, InvalidFile, PasswordRequired],
            ExtractingText => &[ClassifyingDocument, TextExtractionFailed],
            ClassifyingDocument => &[ParsingDocument, ClassifyingDocumentFailed],
            ParsingDocument => &[UpdatingDocumentToProduct, ParsingDocumentFailed],
            UpdatingDocumentToProduct => &[Completed, UpdatingDocumentToProductFailed],
            _ => &[],
        }
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered stages of a pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initiate,
    Validate,
    Extract,
    Classify,
    Parse,
    UpdateProduct,
}

impl Stage {
    /// Stages that run an activity, in execution order.
    pub const ACTIVITY_STAGES: [Stage; 5] = [
        Stage::Validate,
        Stage::Extract,
        Stage::Classify,
        Stage::Parse,
        Stage::UpdateProduct,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Initiate => "initiate",
            Stage::Validate => "validate",
            Stage::Extract => "extract",
            Stage::Classify => "classify",
            Stage::Parse => "parse",
            Stage::UpdateProduct => "update_product",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        [
            Stage::Initiate,
            Stage::Validate,
            Stage::Extract,
            Stage::Classify,
            Stage::Parse,
            Stage::UpdateProduct,
        ]
        .into_iter()
        .find(|stage| stage.name() == name)
    }

    /// State the document is in while this stage runs.
    pub fn state(&self) -> PipelineState {
        match self {
            Stage::Initiate => PipelineState::Initiating,
            Stage::Validate => PipelineState::ValidatingDocument,
            Stage::Extract => PipelineState::ExtractingText,
            Stage::Classify => PipelineState::ClassifyingDocument,
            Stage::Parse => PipelineState::ParsingDocument,
            Stage::UpdateProduct => PipelineState::UpdatingDocumentToProduct,
        }
    }

    /// State reached when this stage succeeds.
    pub fn success_state(&self) -> PipelineState {
        match self {
            Stage::Initiate => PipelineState::ValidatingDocument,
            Stage::Validate => PipelineState::ExtractingText,
            Stage::Extract => PipelineState::ClassifyingDocument,
            Stage::Classify => PipelineState::ParsingDocument,
            Stage::Parse => PipelineState::UpdatingDocumentToProduct,
            Stage::UpdateProduct => PipelineState::Completed,
        }
    }

    /// Default failure terminal, used when the retry budget runs out.
    pub fn failure_state(&self) -> PipelineState {
        match self {
            Stage::Initiate | Stage::Validate => PipelineState::InvalidFile,
            Stage::Extract => PipelineState::TextExtractionFailed,
            Stage::Classify => PipelineState::ClassifyingDocumentFailed,
            Stage::Parse => PipelineState::ParsingDocumentFailed,
            Stage::UpdateProduct => PipelineState::UpdatingDocumentToProductFailed,
        }
    }

    /// Failure terminal matching a classified error raised by this stage.
    pub fn failure_state_for(&self, error: &ActivityError) -> PipelineState {
        match (self, error.terminal_kind()) {
            (Stage::Validate, Some(TerminalKind::PasswordRequired)) => {
                PipelineState::PasswordRequired
            }
            _ => self.failure_state(),
        }
    }

    pub fn queue(&self) -> QueueName {
        match self {
            Stage::Initiate | Stage::Validate => QueueName::IoActivity,
            Stage::Extract | Stage::Classify => QueueName::CpuActivity,
            Stage::Parse => QueueName::ParsingActivity,
            Stage::UpdateProduct => QueueName::NotifyActivity,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Extracted text, deflated once it grows past the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPayload {
    pub compressed: bool,
    pub data: Vec<u8>,
}

impl ExtractedPayload {
    pub fn from_text(text: &str, compression_threshold: usize) -> Result<Self, ActivityError> {
        if text.len() > compression_threshold {
            let data = compression::deflate(text.as_bytes())
                .map_err(|e| ActivityError::transient(format!("payload compression failed: {}", e)))?;
            Ok(ExtractedPayload {
                compressed: true,
                data,
            })
        } else {
            Ok(ExtractedPayload {
                compressed: false,
                data: text.as_bytes().to_vec(),
            })
        }
    }

    pub fn text(&self) -> Result<String, ActivityError> {
        let bytes = if self.compressed {
            compression::inflate(&self.data).map_err(|e| {
                ActivityError::terminal(
                    TerminalKind::CorruptFile,
                    format!("stored payload cannot be inflated: {}", e),
                )
            })?
        } else {
            self.data.clone()
        };
        String::from_utf8(bytes).map_err(|e| {
            ActivityError::terminal(
                TerminalKind::CorruptFile,
                format!("stored payload is not UTF-8: {}", e),
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: String,
    pub subcategory: Option<String>,
    pub confident: bool,
    pub used_fallback: bool,
}

/// A document record as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub product: Option<String>,
    pub scope: Option<String>,
    pub section: Option<String>,
    pub state: PipelineState,
    pub storage_key: String,
    pub file_name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub extracted_payload: Option<ExtractedPayload>,
    #[serde(default)]
    pub classification: Option<ClassificationResult>,
    #[serde(default)]
    pub parsed_data: Option<serde_json::Value>,
    #[serde(default)]
    pub is_text_extracted: bool,
    #[serde(default)]
    pub is_classified: bool,
    #[serde(default)]
    pub is_parsed: bool,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub outcome_emitted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
        storage_key: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Document {
            id: id.into(),
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            product: None,
            scope: None,
            section: None,
            state: PipelineState::Initiating,
            storage_key: storage_key.into(),
            file_name: file_name.into(),
            password: None,
            extracted_payload: None,
            classification: None,
            parsed_data: None,
            is_text_extracted: false,
            is_classified: false,
            is_parsed: false,
            error_reason: None,
            outcome_emitted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Drops all pipeline progress, leaving the upload metadata.
    pub fn reset_progress(&mut self) {
        self.state = PipelineState::Initiating;
        self.extracted_payload = None;
        self.classification = None;
        self.parsed_data = None;
        self.is_text_extracted = false;
        self.is_classified = false;
        self.is_parsed = false;
        self.error_reason = None;
        self.outcome_emitted = false;
    }

    /// Lower-cased file extension, if the file name has one.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }

    pub fn extracted_text(&self) -> Result<String, ActivityError> {
        match &self.extracted_payload {
            Some(payload) => payload.text(),
            None => Err(ActivityError::terminal(
                TerminalKind::EmptyDocument,
                format!("document '{}' has no extracted text", self.id),
            )),
        }
    }
}

/// Per-category bindings for classification, parsing and notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTypeConfiguration {
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    pub parser_activity: String,
    pub notify_activity: String,
}

/// Event emitted once when a pipeline instance reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub document_id: String,
    pub state: PipelineState,
    pub reason: Option<String>,
    pub used_fallback: Option<bool>,
    pub attempts: HashMap<Stage, u32>,
    pub emitted_at: DateTime<Utc>,
}

impl OutcomeEvent {
    /// Same for every emission of one document's outcome, so consumers can
    /// drop repeats.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.document_id, self.state)
    }
}

/// Queue message that hands a new document to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSubmission {
    pub document: Document,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_a_chain_of_valid_edges() {
        let mut state = PipelineState::Initiating;
        let mut visited = vec![state];
        while let Some(stage) = state.stage() {
            let next = stage.success_state();
            assert!(state.can_transition_to(next), "{} -> {}", state, next);
            state = next;
            visited.push(state);
        }
        assert_eq!(state, PipelineState::Completed);
        assert_eq!(visited.len(), 7);
    }

    #[test]
    fn every_activity_stage_has_a_reachable_failure_terminal() {
        for stage in Stage::ACTIVITY_STAGES {
            let failure = stage.failure_state();
            assert!(failure.is_failure());
            assert!(stage.state().can_transition_to(failure));
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for state in PipelineState::ALL {
            assert_eq!(state.is_terminal(), state.successors().is_empty());
        }
    }

    #[test]
    fn password_error_maps_to_password_required_only_during_validation() {
        let err = ActivityError::terminal(TerminalKind::PasswordRequired, "locked");
        assert_eq!(
            Stage::Validate.failure_state_for(&err),
            PipelineState::PasswordRequired
        );
        assert_eq!(
            Stage::Extract.failure_state_for(&err),
            PipelineState::TextExtractionFailed
        );
    }

    #[test]
    fn state_serializes_in_screaming_snake_case() {
        let json = serde_json::to_string(&PipelineState::UpdatingDocumentToProductFailed).unwrap();
        assert_eq!(json, "\"UPDATING_DOCUMENT_TO_PRODUCT_FAILED\"");
        for state in PipelineState::ALL {
            assert_eq!(
                serde_json::to_string(&state).unwrap(),
                format!("\"{}\"", state.as_str())
            );
        }
    }

    #[test]
    fn payload_compresses_above_threshold_and_round_trips() {
        let text = "invoice ".repeat(200);
        let payload = ExtractedPayload::from_text(&text, 64).unwrap();
        assert!(payload.compressed);
        assert!(payload.data.len() < text.len());
        assert_eq!(payload.text().unwrap(), text);

        let small = ExtractedPayload::from_text("short", 64).unwrap();
        assert!(!small.compressed);
        assert_eq!(small.text().unwrap(), "short");
    }

    #[test]
    fn extension_is_lowercased() {
        let doc = Document::new("d1", "u1", "w1", "key", "Scan.PDF");
        assert_eq!(doc.extension().as_deref(), Some("pdf"));
        let doc = Document::new("d2", "u1", "w1", "key", "README");
        assert_eq!(doc.extension(), None);
    }

    #[test]
    fn outcome_dedup_key_ignores_emission_details() {
        let event = OutcomeEvent {
            document_id: "doc-9".to_string(),
            state: PipelineState::TextExtractionFailed,
            reason: Some("crash".to_string()),
            used_fallback: None,
            attempts: HashMap::new(),
            emitted_at: Utc::now(),
        };
        let mut again = event.clone();
        again.attempts.insert(Stage::Extract, 4);
        again.emitted_at = Utc::now();
        assert_eq!(event.dedup_key(), "doc-9:TEXT_EXTRACTION_FAILED");
        assert_eq!(event.dedup_key(), again.dedup_key());
    }
}

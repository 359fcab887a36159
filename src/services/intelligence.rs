// src/services/intelligence.rs

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{ClassificationService, ExternalClassification, StructuredExtractor};
use crate::error::{ActivityError, PipelineError, Result, TerminalKind};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-over-HTTP client for the OCR/LLM service.
///
/// `POST {base}/classify` and `POST {base}/extract` both take `{"text": ...}`.
#[derive(Clone)]
pub struct HttpIntelligenceClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIntelligenceClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(HttpIntelligenceClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, text: &str) -> std::result::Result<reqwest::Response, ActivityError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .json(&json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }
}

#[async_trait]
impl ClassificationService for HttpIntelligenceClient {
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    async fn classify(&self, text: &str) -> std::result::Result<ExternalClassification, ActivityError> {
        let answer: ExternalClassification = self.post("classify", text).await?.json().await?;
        debug!(category = %answer.category, "Fallback classifier answered");
        Ok(answer)
    }
}

#[async_trait]
impl StructuredExtractor for HttpIntelligenceClient {
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    async fn extract_structured(&self, text: &str) -> std::result::Result<Value, ActivityError> {
        Ok(self.post("extract", text).await?.json().await?)
    }
}

/// Classifier and extractor for `url`, or the unconfigured stand-in.
pub fn intelligence_from_url(
    url: Option<&str>,
) -> Result<(Arc<dyn ClassificationService>, Arc<dyn StructuredExtractor>)> {
    match url {
        Some(url) => {
            let client = Arc::new(HttpIntelligenceClient::new(url)?);
            let classifier: Arc<dyn ClassificationService> = client.clone();
            let extractor: Arc<dyn StructuredExtractor> = client;
            Ok((classifier, extractor))
        }
        None => {
            warn!("No intelligence service configured; fallback classification will fail");
            let classifier: Arc<dyn ClassificationService> = Arc::new(UnconfiguredIntelligence);
            let extractor: Arc<dyn StructuredExtractor> = Arc::new(UnconfiguredIntelligence);
            Ok((classifier, extractor))
        }
    }
}

/// Stand-in used when no intelligence service is configured.
pub struct UnconfiguredIntelligence;

fn unconfigured() -> ActivityError {
    ActivityError::terminal(
        TerminalKind::Rejected,
        "no classification/extraction service is configured",
    )
}

#[async_trait]
impl ClassificationService for UnconfiguredIntelligence {
    async fn classify(&self, _text: &str) -> std::result::Result<ExternalClassification, ActivityError> {
        Err(unconfigured())
    }
}

#[async_trait]
impl StructuredExtractor for UnconfiguredIntelligence {
    async fn extract_structured(&self, _text: &str) -> std::result::Result<Value, ActivityError> {
        Err(unconfigured())
    }
}

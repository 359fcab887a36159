// src/services/notifier.rs

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use super::ProductNotifier;
use crate::error::{ActivityError, PipelineError, Result, TerminalKind};

/// Sends parsed data to `PUT {base}/documents/{id}/parsed`.
#[derive(Clone)]
pub struct HttpProductNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProductNotifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(HttpProductNotifier {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProductNotifier for HttpProductNotifier {
    #[instrument(skip(self, parsed_data))]
    async fn notify(&self, document_id: &str, parsed_data: &Value) -> std::result::Result<(), ActivityError> {
        self.client
            .put(format!("{}/documents/{}/parsed", self.base_url, document_id))
            .json(parsed_data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Acknowledges every notification with a log line.
pub struct LoggingNotifier;

#[async_trait]
impl ProductNotifier for LoggingNotifier {
    async fn notify(&self, document_id: &str, parsed_data: &Value) -> std::result::Result<(), ActivityError> {
        let fields = parsed_data.as_object().map(|o| o.len()).unwrap_or(0);
        info!(document_id, fields, "Parsed document ready for product");
        Ok(())
    }
}

/// Notifiers keyed by the `notify_activity` id of a document type.
pub struct NotifierRegistry {
    default: Arc<dyn ProductNotifier>,
    by_id: HashMap<String, Arc<dyn ProductNotifier>>,
}

impl NotifierRegistry {
    /// `default` serves documents whose category has no binding.
    pub fn new(default: Arc<dyn ProductNotifier>) -> Self {
        NotifierRegistry {
            default,
            by_id: HashMap::new(),
        }
    }

    /// `log` always logs; `http` calls the product service when a URL is
    /// given and logs otherwise. Unbound categories go to `http`.
    pub fn standard(product_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let log: Arc<dyn ProductNotifier> = Arc::new(LoggingNotifier);
        let http: Arc<dyn ProductNotifier> = match product_url {
            Some(url) => Arc::new(HttpProductNotifier::new(url, timeout)?),
            None => Arc::clone(&log),
        };
        Ok(NotifierRegistry::new(Arc::clone(&http))
            .register("log", log)
            .register("http", http))
    }

    pub fn register(mut self, id: impl Into<String>, notifier: Arc<dyn ProductNotifier>) -> Self {
        self.by_id.insert(id.into(), notifier);
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn resolve(&self, id: Option<&str>) -> std::result::Result<Arc<dyn ProductNotifier>, ActivityError> {
        match id {
            None => Ok(Arc::clone(&self.default)),
            Some(id) => self.by_id.get(id).cloned().ok_or_else(|| {
                ActivityError::terminal(
                    TerminalKind::Rejected,
                    format!("no notifier registered as '{}'", id),
                )
            }),
        }
    }
}

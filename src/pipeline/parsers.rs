// src/pipeline/parsers.rs

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ActivityError, TerminalKind};
use crate::runtime::isolation::IsolatedExecutor;
use crate::services::StructuredExtractor;

pub const KEY_VALUE_PARSER: &str = "key-value";
pub const STRUCTURED_EXTRACTION_PARSER: &str = "structured-extraction";

/// Turns extracted text into the structured data sent downstream.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    fn id(&self) -> &'static str;

    async fn parse(
        &self,
        text: String,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, ActivityError>;
}

fn normalize_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            key.extend(c.to_lowercase());
        } else if !key.ends_with('_') && !key.is_empty() {
            key.push('_');
        }
    }
    key.trim_end_matches('_').to_string()
}

/// Collects `Key: Value` lines into a JSON object. Later duplicates win.
pub fn parse_key_values(text: &str) -> Result<Value, ActivityError> {
    let mut fields = Map::new();
    for line in text.lines() {
        let Some((raw_key, raw_value)) = line.split_once(':') else {
            continue;
        };
        let key = normalize_key(raw_key);
        let value = raw_value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        fields.insert(key, Value::String(value.to_string()));
    }
    if fields.is_empty() {
        return Err(ActivityError::terminal(
            TerminalKind::Unparseable,
            "no key/value pairs found",
        ));
    }
    Ok(Value::Object(fields))
}

/// Deterministic parser; runs on the isolated executor.
pub struct KeyValueParser {
    isolation: IsolatedExecutor,
}

impl KeyValueParser {
    pub fn new(isolation: IsolatedExecutor) -> Self {
        KeyValueParser { isolation }
    }
}

#[async_trait]
impl DocumentParser for KeyValueParser {
    fn id(&self) -> &'static str {
        KEY_VALUE_PARSER
    }

    async fn parse(
        &self,
        text: String,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, ActivityError> {
        Ok(self
            .isolation
            .run(move || parse_key_values(&text), timeout, cancel)
            .await?)
    }
}

/// Hands the text to the external structured extractor.
pub struct StructuredExtractionParser {
    extractor: Arc<dyn StructuredExtractor>,
}

impl StructuredExtractionParser {
    pub fn new(extractor: Arc<dyn StructuredExtractor>) -> Self {
        StructuredExtractionParser { extractor }
    }
}

#[async_trait]
impl DocumentParser for StructuredExtractionParser {
    fn id(&self) -> &'static str {
        STRUCTURED_EXTRACTION_PARSER
    }

    async fn parse(
        &self,
        text: String,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<Value, ActivityError> {
        let value = self.extractor.extract_structured(&text).await?;
        if value.is_null() {
            return Err(ActivityError::terminal(
                TerminalKind::Unparseable,
                "extractor returned no data",
            ));
        }
        Ok(value)
    }
}

/// Parsers keyed by `parser_activity` id.
pub struct ParserRegistry {
    parsers: HashMap<&'static str, Arc<dyn DocumentParser>>,
}

impl ParserRegistry {
    pub fn new(parsers: Vec<Arc<dyn DocumentParser>>) -> Self {
        ParserRegistry {
            parsers: parsers.into_iter().map(|p| (p.id(), p)).collect(),
        }
    }

    /// Parser bound to `id`; unbound documents use structured extraction.
    pub fn resolve(&self, id: Option<&str>) -> Result<Arc<dyn DocumentParser>, ActivityError> {
        let id = id.unwrap_or(STRUCTURED_EXTRACTION_PARSER);
        self.parsers.get(id).cloned().ok_or_else(|| {
            ActivityError::terminal(
                TerminalKind::Rejected,
                format!("no parser registered as '{}'", id),
            )
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parsers.contains_key(id)
    }
}

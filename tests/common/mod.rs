// Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use lopdf::{dictionary, Document as PdfDocument, Object, Stream};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use DocBlaster::config::EngineConfig;
use DocBlaster::data_model::{Document, DocumentTypeConfiguration, OutcomeEvent};
use DocBlaster::error::ActivityError;
use DocBlaster::pipeline::classification::RuleSet;
use DocBlaster::services::{
    ChannelOutcomeSink, ClassificationService, ExternalClassification, InMemoryDocumentRepository,
    InMemoryObjectStore, NotifierRegistry, ObjectStore, ProductNotifier, StructuredExtractor,
};
use DocBlaster::{Collaborators, EngineRuntime};

/// Single-page PDF with one line of Helvetica text. `encrypted` adds a
/// standard security handler entry that no password will unlock.
pub fn make_test_pdf(text: &str, encrypted: bool) -> Vec<u8> {
    let mut doc = PdfDocument::with_version("1.4");
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let content = format!("BT /F1 12 Tf 72 700 Td ({}) Tj ET", text);
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
    let pages_id = doc.new_object_id();
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Contents" => content_id,
        "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    if encrypted {
        let encrypt_id = doc.add_object(dictionary! {
            "Filter" => "Standard",
            "V" => 1,
            "R" => 2,
            "O" => Object::string_literal(vec![0u8; 32]),
            "U" => Object::string_literal(vec![0u8; 32]),
            "P" => -4,
        });
        doc.trailer.set("Encrypt", encrypt_id);
    }
    let mut buf = Vec::new();
    doc.save_to(&mut buf).expect("Failed to write test PDF");
    buf
}

/// Engine settings with short backoffs and a health monitor that never throttles.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.process_pool_size = 2;
    config.resource_pool_size = 4;
    config.resource_acquire_timeout_ms = 1_000;
    config.stage_retry_max_attempts = 3;
    config.stage_timeout_ms = 5_000;
    config.retry_initial_backoff_ms = 5;
    config.retry_max_backoff_ms = 20;
    config.health.sample_interval_ms = 50;
    config.health.lag_warning_ms = 5_000;
    config.health.lag_critical_ms = 10_000;
    config.health.load_warning = 1_000.0;
    config.health.load_critical = 1_000.0;
    config
}

pub fn invoice_rule() -> DocumentTypeConfiguration {
    DocumentTypeConfiguration {
        category: "invoice".to_string(),
        subcategory: None,
        product: None,
        patterns: vec!["invoice number".to_string()],
        allowed_extensions: vec![],
        parser_activity: "key-value".to_string(),
        notify_activity: "record".to_string(),
    }
}

pub struct FakeClassifier {
    answer: Option<ExternalClassification>,
    delay: Duration,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ClassificationService for FakeClassifier {
    async fn classify(&self, _text: &str) -> Result<ExternalClassification, ActivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.answer
            .clone()
            .ok_or_else(|| ActivityError::transient("classifier unavailable"))
    }
}

pub struct FirstLineExtractor;

#[async_trait]
impl StructuredExtractor for FirstLineExtractor {
    async fn extract_structured(&self, text: &str) -> Result<Value, ActivityError> {
        Ok(json!({ "summary": text.lines().next().unwrap_or_default().trim() }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ProductNotifier for RecordingNotifier {
    async fn notify(&self, document_id: &str, parsed_data: &Value) -> Result<(), ActivityError> {
        self.calls
            .lock()
            .unwrap()
            .push((document_id.to_string(), parsed_data.clone()));
        Ok(())
    }
}

/// In-memory store whose first `put_failures` writes time out.
pub struct FlakyStore {
    pub inner: InMemoryObjectStore,
    put_failures: AtomicUsize,
    pub put_attempts: AtomicUsize,
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ActivityError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<(), ActivityError> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .put_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ActivityError::transient("storage write timed out"));
        }
        self.inner.put(key, bytes, ttl).await
    }

    async fn ping(&self) -> Result<(), ActivityError> {
        Ok(())
    }
}

pub struct HarnessOptions {
    pub config: EngineConfig,
    pub rules: Vec<DocumentTypeConfiguration>,
    pub fallback: Option<ExternalClassification>,
    pub classifier_delay: Duration,
    pub put_failures: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        HarnessOptions {
            config: test_config(),
            rules: vec![invoice_rule()],
            fallback: Some(ExternalClassification {
                category: "memo".to_string(),
                subcategory: None,
            }),
            classifier_delay: Duration::ZERO,
            put_failures: 0,
        }
    }
}

pub struct Harness {
    pub engine: EngineRuntime,
    pub repository: Arc<InMemoryDocumentRepository>,
    pub store: Arc<FlakyStore>,
    pub classifier: Arc<FakeClassifier>,
    pub notifier: Arc<RecordingNotifier>,
    pub outcomes: UnboundedReceiver<OutcomeEvent>,
}

impl Harness {
    pub async fn start(options: HarnessOptions) -> Harness {
        let repository = Arc::new(InMemoryDocumentRepository::new());
        let store = Arc::new(FlakyStore {
            inner: InMemoryObjectStore::new(),
            put_failures: AtomicUsize::new(options.put_failures),
            put_attempts: AtomicUsize::new(0),
        });
        let classifier = Arc::new(FakeClassifier {
            answer: options.fallback,
            delay: options.classifier_delay,
            calls: AtomicUsize::new(0),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let (outcomes, receiver) = ChannelOutcomeSink::new();

        let notifiers = NotifierRegistry::new(notifier.clone()).register("record", notifier.clone());
        let engine = EngineRuntime::start(
            options.config,
            RuleSet::compile(options.rules).expect("rules compile"),
            Collaborators {
                object_store: Arc::new(Arc::clone(&store)),
                repository: Arc::new(Arc::clone(&repository)),
                classifier: classifier.clone(),
                extractor: Arc::new(FirstLineExtractor),
                notifiers,
                outcomes: Arc::new(outcomes),
            },
        )
        .await
        .expect("engine starts");

        Harness {
            engine,
            repository,
            store,
            classifier,
            notifier,
            outcomes: receiver,
        }
    }

    /// Stores `bytes` and registers a fresh document for them.
    pub async fn upload(&self, id: &str, file_name: &str, bytes: Vec<u8>) -> Document {
        let document = Document::new(id, "user-1", "workspace-1", format!("uploads/{}", id), file_name);
        self.upload_document(document, bytes).await
    }

    pub async fn upload_document(&self, document: Document, bytes: Vec<u8>) -> Document {
        self.store.inner.insert(document.storage_key.clone(), bytes).await;
        self.repository.insert(document.clone()).await;
        document
    }

    pub fn drain_outcomes(&mut self) -> Vec<OutcomeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.outcomes.try_recv() {
            events.push(event);
        }
        events
    }
}

// End-to-end runs of the engine against in-memory collaborators.

mod common;

#[cfg(test)]
mod tests {
    use super::common::{invoice_rule, make_test_pdf, test_config, Harness, HarnessOptions};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use DocBlaster::data_model::{Document, PipelineState, Stage};
    use DocBlaster::error::TerminalKind;
    use DocBlaster::pipeline::activities::parsed_result_key;
    use DocBlaster::pipeline::classification::RuleSet;
    use DocBlaster::PipelineError;

    fn assert_valid_path(history: &[PipelineState]) {
        assert_eq!(history.first(), Some(&PipelineState::Initiating));
        for pair in history.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "invalid transition {} -> {}",
                pair[0],
                pair[1]
            );
        }
        assert!(history.last().map_or(false, |s| s.is_terminal()));
    }

    #[tokio::test]
    async fn test_matching_pdf_completes_on_fast_path() {
        let mut harness = Harness::start(HarnessOptions::default()).await;
        harness
            .upload("doc-a", "invoice.pdf", make_test_pdf("Invoice Number: INV-42", false))
            .await;

        let report = harness.engine.orchestrator.run_pipeline("doc-a").await.unwrap();

        assert_eq!(report.final_state, PipelineState::Completed);
        assert_eq!(report.used_fallback, Some(false));
        assert_eq!(report.reason, None);
        assert_eq!(harness.classifier.calls.load(Ordering::SeqCst), 0);

        let history = harness.repository.history("doc-a").await;
        assert_valid_path(&history);
        assert_eq!(
            history,
            vec![
                PipelineState::Initiating,
                PipelineState::ValidatingDocument,
                PipelineState::ExtractingText,
                PipelineState::ClassifyingDocument,
                PipelineState::ParsingDocument,
                PipelineState::UpdatingDocumentToProduct,
                PipelineState::Completed,
            ]
        );

        let stored = harness.repository.get("doc-a").await.unwrap();
        assert!(stored.is_text_extracted && stored.is_classified && stored.is_parsed);
        assert!(stored.outcome_emitted);
        assert_eq!(stored.classification.unwrap().category, "invoice");
        assert_eq!(
            stored.parsed_data,
            Some(json!({ "invoice_number": "INV-42" }))
        );
        assert!(harness.store.inner.contains(&parsed_result_key("doc-a")).await);

        let notified = harness.notifier.calls.lock().unwrap().clone();
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].0, "doc-a");

        let events = harness.drain_outcomes();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, PipelineState::Completed);
        assert_eq!(events[0].used_fallback, Some(false));
    }

    #[tokio::test]
    async fn test_wrong_password_ends_in_password_required_without_retries() {
        let mut harness = Harness::start(HarnessOptions::default()).await;
        let document = Document::new("doc-b", "user-1", "workspace-1", "uploads/doc-b", "locked.pdf")
            .with_password("wrong");
        harness
            .upload_document(document, make_test_pdf("Invoice Number: INV-42", true))
            .await;

        let report = harness.engine.orchestrator.run_pipeline("doc-b").await.unwrap();

        assert_eq!(report.final_state, PipelineState::PasswordRequired);
        assert_eq!(report.attempts.get(&Stage::Validate), Some(&1));
        assert!(!report.attempts.contains_key(&Stage::Extract));
        assert!(report
            .reason
            .as_deref()
            .unwrap()
            .starts_with(&TerminalKind::PasswordRequired.to_string()));
        assert_valid_path(&harness.repository.history("doc-b").await);

        let events = harness.drain_outcomes();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, PipelineState::PasswordRequired);
        assert!(harness.notifier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_text_completes_through_fallback() {
        let mut harness = Harness::start(HarnessOptions::default()).await;
        harness
            .upload("doc-c", "notes.pdf", make_test_pdf("Quarterly planning meeting", false))
            .await;

        let report = harness.engine.orchestrator.run_pipeline("doc-c").await.unwrap();

        assert_eq!(report.final_state, PipelineState::Completed);
        assert_eq!(report.used_fallback, Some(true));
        assert_eq!(harness.classifier.calls.load(Ordering::SeqCst), 1);

        let stored = harness.repository.get("doc-c").await.unwrap();
        let classification = stored.classification.unwrap();
        assert_eq!(classification.category, "memo");
        assert!(!classification.confident);
        // no binding for "memo": structured extraction and the default notifier
        assert_eq!(
            stored.parsed_data,
            Some(json!({ "summary": "Quarterly planning meeting" }))
        );
        assert_eq!(harness.notifier.calls.lock().unwrap().len(), 1);

        let events = harness.drain_outcomes();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].used_fallback, Some(true));
    }

    #[tokio::test]
    async fn test_failed_fallback_ends_classification() {
        let mut harness = Harness::start(HarnessOptions {
            fallback: None,
            ..HarnessOptions::default()
        })
        .await;
        harness
            .upload("doc-f", "notes.pdf", make_test_pdf("Quarterly planning meeting", false))
            .await;

        let report = harness.engine.orchestrator.run_pipeline("doc-f").await.unwrap();

        assert_eq!(report.final_state, PipelineState::ClassifyingDocumentFailed);
        assert_eq!(report.attempts.get(&Stage::Classify), Some(&1));
        assert_eq!(harness.drain_outcomes().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_timeouts_beyond_retry_ceiling_fail_the_update() {
        let mut harness = Harness::start(HarnessOptions {
            put_failures: 4,
            ..HarnessOptions::default()
        })
        .await;
        harness
            .upload("doc-d", "invoice.pdf", make_test_pdf("Invoice Number: INV-42", false))
            .await;

        let report = harness.engine.orchestrator.run_pipeline("doc-d").await.unwrap();

        assert_eq!(report.final_state, PipelineState::UpdatingDocumentToProductFailed);
        assert_eq!(report.attempts.get(&Stage::UpdateProduct), Some(&4));
        assert_eq!(harness.store.put_attempts.load(Ordering::SeqCst), 4);
        assert!(harness.notifier.calls.lock().unwrap().is_empty());
        assert_valid_path(&harness.repository.history("doc-d").await);

        let events = harness.drain_outcomes();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, PipelineState::UpdatingDocumentToProductFailed);
        assert_eq!(events[0].attempts.get(&Stage::UpdateProduct), Some(&4));
    }

    #[tokio::test]
    async fn test_storage_recovering_within_retries_completes() {
        let harness = Harness::start(HarnessOptions {
            put_failures: 3,
            ..HarnessOptions::default()
        })
        .await;
        harness
            .upload("doc-r", "invoice.pdf", make_test_pdf("Invoice Number: INV-42", false))
            .await;

        let report = harness.engine.orchestrator.run_pipeline("doc-r").await.unwrap();

        assert_eq!(report.final_state, PipelineState::Completed);
        assert_eq!(report.attempts.get(&Stage::UpdateProduct), Some(&4));
    }

    #[tokio::test]
    async fn test_unsupported_extension_is_invalid_file() {
        let harness = Harness::start(HarnessOptions::default()).await;
        harness
            .upload("doc-x", "report.docx", b"PK\x03\x04 not really".to_vec())
            .await;

        let report = harness.engine.orchestrator.run_pipeline("doc-x").await.unwrap();

        assert_eq!(report.final_state, PipelineState::InvalidFile);
        assert_eq!(report.attempts.get(&Stage::Validate), Some(&1));
        assert!(report
            .reason
            .as_deref()
            .unwrap()
            .starts_with(&TerminalKind::UnsupportedFormat.to_string()));
    }

    #[tokio::test]
    async fn test_product_restricts_accepted_extensions() {
        let mut billing = invoice_rule();
        billing.product = Some("billing".to_string());
        billing.allowed_extensions = vec!["pdf".to_string()];
        let harness = Harness::start(HarnessOptions {
            rules: vec![billing],
            ..HarnessOptions::default()
        })
        .await;
        let restricted = Document::new("doc-p1", "user-1", "workspace-1", "uploads/doc-p1", "invoice.txt")
            .with_product("billing");
        harness
            .upload_document(restricted, b"Invoice Number: INV-3".to_vec())
            .await;
        harness
            .upload("doc-p2", "invoice.txt", b"Invoice Number: INV-4".to_vec())
            .await;

        let restricted = harness.engine.orchestrator.run_pipeline("doc-p1").await.unwrap();
        assert_eq!(restricted.final_state, PipelineState::InvalidFile);

        // no product, so the billing restriction does not apply
        let open = harness.engine.orchestrator.run_pipeline("doc-p2").await.unwrap();
        assert_eq!(open.final_state, PipelineState::Completed);
    }

    #[tokio::test]
    async fn test_empty_text_file_fails_extraction() {
        let harness = Harness::start(HarnessOptions::default()).await;
        harness.upload("doc-e", "blank.txt", b"   \n\n".to_vec()).await;

        let report = harness.engine.orchestrator.run_pipeline("doc-e").await.unwrap();

        assert_eq!(report.final_state, PipelineState::TextExtractionFailed);
        assert_eq!(report.attempts.get(&Stage::Extract), Some(&1));
    }

    #[tokio::test]
    async fn test_large_text_is_stored_compressed() {
        let mut config = test_config();
        config.payload_compression_threshold_bytes = 64;
        let harness = Harness::start(HarnessOptions {
            config,
            ..HarnessOptions::default()
        })
        .await;
        let mut text = String::from("Invoice Number: INV-7\n");
        text.push_str(&"Line item: widget\n".repeat(20));
        harness.upload("doc-z", "invoice.txt", text.clone().into_bytes()).await;

        let report = harness.engine.orchestrator.run_pipeline("doc-z").await.unwrap();
        assert_eq!(report.final_state, PipelineState::Completed);

        let stored = harness.repository.get("doc-z").await.unwrap();
        let payload = stored.extracted_payload.clone().unwrap();
        assert!(payload.compressed);
        assert!(payload.data.len() < text.len());
        assert_eq!(stored.extracted_text().unwrap().trim(), text.trim());
    }

    #[tokio::test]
    async fn test_rerunning_a_finished_document_is_a_no_op() {
        let mut harness = Harness::start(HarnessOptions::default()).await;
        harness
            .upload("doc-a", "invoice.pdf", make_test_pdf("Invoice Number: INV-42", false))
            .await;
        let orchestrator = Arc::clone(&harness.engine.orchestrator);

        orchestrator.run_pipeline("doc-a").await.unwrap();
        let history = harness.repository.history("doc-a").await;
        let again = orchestrator.run_pipeline("doc-a").await.unwrap();

        assert_eq!(again.final_state, PipelineState::Completed);
        assert_eq!(again.states_visited, vec![PipelineState::Completed]);
        assert!(again.attempts.is_empty());
        assert_eq!(harness.repository.history("doc-a").await, history);
        assert_eq!(harness.notifier.calls.lock().unwrap().len(), 1);
        assert_eq!(harness.drain_outcomes().len(), 1);
    }

    #[tokio::test]
    async fn test_undelivered_outcome_is_emitted_on_rerun() {
        let mut harness = Harness::start(HarnessOptions::default()).await;
        let mut document = Document::new("doc-t", "user-1", "workspace-1", "uploads/doc-t", "scan.pdf");
        document.state = PipelineState::InvalidFile;
        document.error_reason = Some("corrupt_file: truncated".to_string());
        harness.upload_document(document, Vec::new()).await;

        let report = harness.engine.orchestrator.run_pipeline("doc-t").await.unwrap();

        assert_eq!(report.final_state, PipelineState::InvalidFile);
        let events = harness.drain_outcomes();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason.as_deref(), Some("corrupt_file: truncated"));
        assert!(harness.repository.get("doc-t").await.unwrap().outcome_emitted);

        harness.engine.orchestrator.run_pipeline("doc-t").await.unwrap();
        assert!(harness.drain_outcomes().is_empty());
    }

    #[tokio::test]
    async fn test_missing_document_is_reported() {
        let harness = Harness::start(HarnessOptions::default()).await;
        let err = harness
            .engine
            .orchestrator
            .run_pipeline("nope")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DocumentNotFound(id) if id == "nope"));
        assert!(!harness.engine.orchestrator.is_active("nope"));
    }

    #[tokio::test]
    async fn test_second_instance_for_same_document_is_rejected() {
        let harness = Harness::start(HarnessOptions {
            classifier_delay: Duration::from_millis(300),
            ..HarnessOptions::default()
        })
        .await;
        harness
            .upload("doc-s", "notes.pdf", make_test_pdf("Quarterly planning meeting", false))
            .await;
        let orchestrator = Arc::clone(&harness.engine.orchestrator);

        let first = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.run_pipeline("doc-s").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.is_active("doc-s"));

        let second = orchestrator.run_pipeline("doc-s").await;
        assert!(matches!(second, Err(PipelineError::PipelineAlreadyActive(_))));

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.final_state, PipelineState::Completed);
        assert!(!orchestrator.is_active("doc-s"));
    }

    #[tokio::test]
    async fn test_cancel_stops_the_run_and_keeps_last_state() {
        let mut harness = Harness::start(HarnessOptions {
            classifier_delay: Duration::from_secs(5),
            ..HarnessOptions::default()
        })
        .await;
        harness
            .upload("doc-k", "notes.pdf", make_test_pdf("Quarterly planning meeting", false))
            .await;
        let orchestrator = Arc::clone(&harness.engine.orchestrator);

        let run = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.run_pipeline("doc-k").await }
        });
        // wait until the slow fallback classifier is reached
        while harness.classifier.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(orchestrator.cancel("doc-k"));

        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("cancelled run returns promptly")
            .unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled(_))));

        let stored = harness.repository.get("doc-k").await.unwrap();
        assert_eq!(stored.state, PipelineState::ClassifyingDocument);
        assert!(!stored.outcome_emitted);
        assert!(harness.drain_outcomes().is_empty());
        assert!(!orchestrator.cancel("doc-k"));
    }

    #[tokio::test]
    async fn test_reloaded_rules_apply_to_later_runs() {
        let harness = Harness::start(HarnessOptions {
            rules: vec![],
            ..HarnessOptions::default()
        })
        .await;
        let orchestrator = Arc::clone(&harness.engine.orchestrator);
        harness
            .upload("doc-1", "invoice.pdf", make_test_pdf("Invoice Number: INV-1", false))
            .await;
        harness
            .upload("doc-2", "invoice.pdf", make_test_pdf("Invoice Number: INV-2", false))
            .await;

        let before = orchestrator.run_pipeline("doc-1").await.unwrap();
        assert_eq!(before.used_fallback, Some(true));

        orchestrator.reload_rules(Arc::new(RuleSet::compile(vec![invoice_rule()]).unwrap()));
        assert_eq!(orchestrator.rules().len(), 1);

        let after = orchestrator.run_pipeline("doc-2").await.unwrap();
        assert_eq!(after.used_fallback, Some(false));
        assert_eq!(
            harness.repository.get("doc-2").await.unwrap().parsed_data,
            Some(json!({ "invoice_number": "INV-2" }))
        );
    }

    #[tokio::test]
    async fn test_concurrent_documents_each_emit_one_outcome() {
        let mut harness = Harness::start(HarnessOptions::default()).await;
        let mut ids = Vec::new();
        for i in 0..8 {
            let id = format!("doc-{}", i);
            let text = if i % 2 == 0 {
                format!("Invoice Number: INV-{}", i)
            } else {
                "Quarterly planning meeting".to_string()
            };
            harness.upload(&id, "file.pdf", make_test_pdf(&text, false)).await;
            ids.push(id);
        }
        let orchestrator = Arc::clone(&harness.engine.orchestrator);
        let runs = ids.iter().map(|id| {
            let orchestrator = Arc::clone(&orchestrator);
            let id = id.clone();
            tokio::spawn(async move { orchestrator.run_pipeline(&id).await })
        });
        for handle in futures::future::join_all(runs).await {
            assert_eq!(handle.unwrap().unwrap().final_state, PipelineState::Completed);
        }

        let mut emitted: Vec<String> = harness
            .drain_outcomes()
            .into_iter()
            .map(|event| event.document_id)
            .collect();
        emitted.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(emitted, expected);
    }
}

// src/config/rules.rs
use crate::data_model::{DocumentTypeConfiguration, DEFAULT_CATEGORY};
use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use super::load_yaml;

#[derive(Deserialize, Debug, Clone)]
struct DocumentTypesFile {
    document_types: Vec<DocumentTypeConfiguration>,
}

fn validate_document_type(index: usize, config: &DocumentTypeConfiguration) -> Result<()> {
    if config.category.trim().is_empty() {
        return Err(PipelineError::ConfigValidationError(format!(
            "document_types[{}]: category cannot be empty",
            index
        )));
    }
    if config.category == DEFAULT_CATEGORY {
        return Err(PipelineError::ConfigValidationError(format!(
            "document_types[{}]: category '{}' is reserved for unmatched documents",
            index, DEFAULT_CATEGORY
        )));
    }
    if config.patterns.is_empty() {
        return Err(PipelineError::ConfigValidationError(format!(
            "document_types[{}] ({}): patterns cannot be empty",
            index, config.category
        )));
    }
    if config.parser_activity.is_empty() || config.notify_activity.is_empty() {
        return Err(PipelineError::ConfigValidationError(format!(
            "document_types[{}] ({}): parser_activity and notify_activity are required",
            index, config.category
        )));
    }
    Ok(())
}

/// Loads the document-type bindings file.
///
/// Regexes are not compiled here; `RuleSet::compile` does that and reports
/// bad patterns.
pub fn load_document_types<P: AsRef<Path>>(path: P) -> Result<Vec<DocumentTypeConfiguration>> {
    let file: DocumentTypesFile = load_yaml(path, "document types")?;

    let mut seen = HashSet::new();
    for (index, config) in file.document_types.iter().enumerate() {
        validate_document_type(index, config)?;
        let key = (
            config.category.clone(),
            config.subcategory.clone(),
            config.product.clone(),
        );
        if !seen.insert(key) {
            return Err(PipelineError::ConfigValidationError(format!(
                "document_types[{}]: duplicate binding for category '{}'",
                index, config.category
            )));
        }
    }
    Ok(file.document_types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config_file(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
        writeln!(temp_file, "{}", content).expect("Failed to write to temp file");
        temp_file
    }

    #[test]
    fn test_load_document_types() {
        let yaml_content = r#"
document_types:
  - category: invoice
    subcategory: utility
    patterns: ["invoice\\s+number", "amount due"]
    allowed_extensions: [pdf]
    parser_activity: key-value
    notify_activity: http
  - category: bank_statement
    product: lending
    patterns: ["statement period"]
    parser_activity: structured-extraction
    notify_activity: log
        "#;
        let temp_file = create_temp_config_file(yaml_content);
        let types = load_document_types(temp_file.path()).unwrap();
        assert_eq!(types.len(), 2);
        assert_eq!(types[0].subcategory.as_deref(), Some("utility"));
        assert_eq!(types[0].patterns.len(), 2);
        assert!(types[1].allowed_extensions.is_empty());
        assert_eq!(types[1].product.as_deref(), Some("lending"));
    }

    #[test]
    fn test_reserved_category_is_rejected() {
        let yaml_content = r#"
document_types:
  - category: unknown
    patterns: ["x"]
    parser_activity: key-value
    notify_activity: log
        "#;
        let temp_file = create_temp_config_file(yaml_content);
        match load_document_types(temp_file.path()) {
            Err(PipelineError::ConfigValidationError(msg)) => assert!(msg.contains("reserved")),
            other => panic!("Expected ConfigValidationError, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_binding_is_rejected() {
        let yaml_content = r#"
document_types:
  - category: invoice
    patterns: ["a"]
    parser_activity: key-value
    notify_activity: log
  - category: invoice
    patterns: ["b"]
    parser_activity: key-value
    notify_activity: log
        "#;
        let temp_file = create_temp_config_file(yaml_content);
        match load_document_types(temp_file.path()) {
            Err(PipelineError::ConfigValidationError(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("Expected ConfigValidationError, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_patterns_field_is_a_parse_error() {
        let yaml_content = r#"
document_types:
  - category: invoice
    parser_activity: key-value
    notify_activity: log
        "#;
        let temp_file = create_temp_config_file(yaml_content);
        match load_document_types(temp_file.path()) {
            Err(PipelineError::ConfigError(msg)) => {
                assert!(msg.contains("missing field `patterns`"))
            }
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }
}

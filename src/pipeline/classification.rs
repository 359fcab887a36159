// src/pipeline/classification.rs

use regex::{Regex, RegexBuilder};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::data_model::{ClassificationResult, DocumentTypeConfiguration, DEFAULT_CATEGORY};
use crate::error::{ActivityError, PipelineError, Result, TerminalKind};
use crate::runtime::isolation::{IsolatedExecutor, IsolationError};
use crate::services::ClassificationService;
use crate::utils::prometheus_metrics::FALLBACK_CLASSIFICATIONS_TOTAL;

struct CompiledRule {
    config: DocumentTypeConfiguration,
    patterns: Vec<Regex>,
}

impl CompiledRule {
    fn applies_to(&self, product: Option<&str>) -> bool {
        match (&self.config.product, product) {
            (None, _) => true,
            (Some(bound), Some(product)) => bound == product,
            (Some(_), None) => false,
        }
    }
}

/// Outcome of the deterministic classification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastPathOutcome {
    Matched {
        category: String,
        subcategory: Option<String>,
    },
    /// Nothing conclusive; the fallback path decides.
    Ambiguous,
}

/// Immutable, compiled snapshot of the document-type bindings.
///
/// Rules are tried in file order and the first rule with a matching pattern wins.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn empty() -> Self {
        RuleSet { rules: Vec::new() }
    }

    pub fn compile(configs: Vec<DocumentTypeConfiguration>) -> Result<Self> {
        let mut rules = Vec::with_capacity(configs.len());
        for config in configs {
            let mut patterns = Vec::with_capacity(config.patterns.len());
            for pattern in &config.patterns {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        PipelineError::ConfigValidationError(format!(
                            "category '{}': invalid pattern '{}': {}",
                            config.category, pattern, e
                        ))
                    })?;
                patterns.push(regex);
            }
            rules.push(CompiledRule { config, patterns });
        }
        debug!(rules = rules.len(), "Compiled rule set");
        Ok(RuleSet { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn configurations(&self) -> impl Iterator<Item = &DocumentTypeConfiguration> {
        self.rules.iter().map(|rule| &rule.config)
    }

    pub fn match_text(&self, text: &str, product: Option<&str>) -> FastPathOutcome {
        let hit = self
            .rules
            .iter()
            .filter(|rule| rule.applies_to(product))
            .find(|rule| rule.patterns.iter().any(|p| p.is_match(text)));
        match hit {
            Some(rule) if rule.config.category != DEFAULT_CATEGORY => FastPathOutcome::Matched {
                category: rule.config.category.clone(),
                subcategory: rule.config.subcategory.clone(),
            },
            _ => FastPathOutcome::Ambiguous,
        }
    }

    /// The most specific binding for a classified document, if any.
    pub fn bindings_for(
        &self,
        category: &str,
        subcategory: Option<&str>,
        product: Option<&str>,
    ) -> Option<&DocumentTypeConfiguration> {
        let candidates: Vec<&DocumentTypeConfiguration> = self
            .rules
            .iter()
            .filter(|rule| rule.config.category == category && rule.applies_to(product))
            .map(|rule| &rule.config)
            .collect();

        let score = |config: &DocumentTypeConfiguration| {
            let sub = match (config.subcategory.as_deref(), subcategory) {
                (Some(a), Some(b)) if a == b => 2,
                (None, _) => 1,
                _ => 0,
            };
            let prod = if config.product.is_some() { 1 } else { 0 };
            (sub, prod)
        };
        candidates
            .into_iter()
            .filter(|config| score(config).0 > 0)
            .max_by_key(|config| score(config))
    }

    /// Extensions allowed for `product`; `None` when no rule restricts them.
    pub fn allowed_extensions(&self, product: Option<&str>) -> Option<BTreeSet<String>> {
        let allowed: BTreeSet<String> = self
            .rules
            .iter()
            .filter(|rule| rule.applies_to(product))
            .flat_map(|rule| rule.config.allowed_extensions.iter())
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        if allowed.is_empty() {
            None
        } else {
            Some(allowed)
        }
    }
}

/// Chooses between the regex fast path and the external classifier.
pub struct ClassificationStrategySelector {
    isolation: IsolatedExecutor,
    fallback: Arc<dyn ClassificationService>,
}

impl ClassificationStrategySelector {
    pub fn new(isolation: IsolatedExecutor, fallback: Arc<dyn ClassificationService>) -> Self {
        ClassificationStrategySelector {
            isolation,
            fallback,
        }
    }

    /// Classifies already-extracted text.
    ///
    /// The fast path runs on the isolated executor. When it is inconclusive or
    /// fails, the same text goes to the fallback classifier, whose answer is
    /// final; a fallback failure is terminal.
    pub async fn classify(
        &self,
        text: String,
        product: Option<String>,
        rules: Arc<RuleSet>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<ClassificationResult, ActivityError> {
        let text: Arc<str> = Arc::from(text);
        let fast_text = Arc::clone(&text);
        let fast = self
            .isolation
            .run(
                move || Ok(rules.match_text(&fast_text, product.as_deref())),
                timeout,
                cancel,
            )
            .await;

        match fast {
            Ok(FastPathOutcome::Matched {
                category,
                subcategory,
            }) => {
                debug!(%category, "Fast path matched");
                return Ok(ClassificationResult {
                    category,
                    subcategory,
                    confident: true,
                    used_fallback: false,
                });
            }
            Ok(FastPathOutcome::Ambiguous) => debug!("Fast path inconclusive; using fallback"),
            Err(IsolationError::Cancelled) => return Err(IsolationError::Cancelled.into()),
            Err(e) => warn!(error = %e, "Fast path failed; using fallback"),
        }

        FALLBACK_CLASSIFICATIONS_TOTAL.inc();
        let answer = self.fallback.classify(&text).await.map_err(|e| {
            ActivityError::terminal(
                TerminalKind::ClassificationFailed,
                format!("fallback classification failed: {}", e),
            )
        })?;
        Ok(ClassificationResult {
            category: answer.category,
            subcategory: answer.subcategory,
            confident: false,
            used_fallback: true,
        })
    }
}

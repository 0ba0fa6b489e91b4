use crate::research::task::ResultRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Structured, source-specific query parameters.
pub type QueryParams = serde_json::Map<String, Value>;

/// Credential name -> secret, resolved from the environment at startup.
pub type Credentials = HashMap<String, String>;

/// A source-level error, kept apart from "zero results".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub message: String,
    /// The source signalled throttling (HTTP 429 and friends)
    pub rate_limited: bool,
}

impl SourceFailure {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let rate_limited = looks_rate_limited(&message);
        Self {
            message,
            rate_limited,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            rate_limited: true,
        }
    }
}

/// Heuristic for integrations that only surface an error string.
pub fn looks_rate_limited(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("rate-limit")
        || lower.contains("too many requests")
        || lower.contains("throttl")
}

/// What one `execute_search` call produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub success: bool,
    pub source_name: String,
    /// Total hits reported by the source (may exceed `results.len()`)
    pub total: usize,
    pub results: Vec<ResultRecord>,
    pub error: Option<SourceFailure>,
}

impl SearchOutcome {
    pub fn ok(source_name: impl Into<String>, results: Vec<ResultRecord>) -> Self {
        Self {
            success: true,
            source_name: source_name.into(),
            total: results.len(),
            results,
            error: None,
        }
    }

    pub fn failed(source_name: impl Into<String>, failure: SourceFailure) -> Self {
        Self {
            success: false,
            source_name: source_name.into(),
            total: 0,
            results: Vec::new(),
            error: Some(failure),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.rate_limited)
    }
}

/// Contract every external data source implements.
#[async_trait]
pub trait SourceIntegration: Send + Sync {
    /// Stable source id used in configuration and selection
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// Cheap local check whether this source can say anything about `query`
    fn is_relevant(&self, query: &str) -> bool;
    /// `None` means "skip this source for this query"
    async fn generate_query(&self, query: &str) -> Option<QueryParams>;
    async fn execute_search(
        &self,
        params: &QueryParams,
        credentials: &Credentials,
        limit: usize,
    ) -> SearchOutcome;
}

/// Table of integrations keyed by source id. Iteration order is by id.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn SourceIntegration>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
        }
    }

    /// Registry with the built-in integrations compiled into this binary
    pub fn with_default_sources() -> Self {
        let mut registry = Self::new();

        #[cfg(feature = "web-search")]
        registry.register(Arc::new(crate::sources::web::WebSearchSource::new()));

        registry
    }

    pub fn register(&mut self, source: Arc<dyn SourceIntegration>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceIntegration>> {
        self.sources.get(name).cloned()
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Get a list of all registered source ids
    pub fn source_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// (id, description) pairs for prompts and the CLI listing
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.sources
            .values()
            .map(|s| (s.name().to_string(), s.description().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

//! Web search integration using daedra
//!
//! daedra uses DuckDuckGo as the search backend; no credentials are needed.

use crate::research::task::ResultRecord;
use crate::sources::registry::{
    Credentials, QueryParams, SearchOutcome, SourceFailure, SourceIntegration,
};
use async_trait::async_trait;
use serde_json::Value;

pub const WEB_SOURCE: &str = "web";

/// General web search powered by daedra
pub struct WebSearchSource;

impl WebSearchSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WebSearchSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceIntegration for WebSearchSource {
    fn name(&self) -> &str {
        WEB_SOURCE
    }

    fn description(&self) -> &str {
        "General web search (DuckDuckGo). Broad recall, noisy; good for news, company pages and profiles."
    }

    fn is_relevant(&self, query: &str) -> bool {
        !query.trim().is_empty()
    }

    async fn generate_query(&self, query: &str) -> Option<QueryParams> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        let mut params = QueryParams::new();
        params.insert("query".to_string(), Value::String(query.to_string()));
        Some(params)
    }

    async fn execute_search(
        &self,
        params: &QueryParams,
        _credentials: &Credentials,
        limit: usize,
    ) -> SearchOutcome {
        let Some(query) = params.get("query").and_then(|v| v.as_str()) else {
            return SearchOutcome::failed(
                WEB_SOURCE,
                SourceFailure::new("Missing 'query' parameter"),
            );
        };

        let search_args = daedra::SearchArgs {
            query: query.to_string(),
            options: Some(daedra::SearchOptions {
                num_results: limit,
                ..Default::default()
            }),
        };

        match daedra::tools::search::perform_search(&search_args).await {
            Ok(response) => {
                let results: Vec<ResultRecord> = response
                    .data
                    .iter()
                    .map(|r| {
                        ResultRecord::new(
                            r.title.clone(),
                            r.url.clone(),
                            r.description.clone(),
                            WEB_SOURCE,
                        )
                    })
                    .collect();
                SearchOutcome::ok(WEB_SOURCE, results)
            }
            Err(e) => SearchOutcome::failed(
                WEB_SOURCE,
                SourceFailure::new(format!("Search failed: {}", e)),
            ),
        }
    }
}

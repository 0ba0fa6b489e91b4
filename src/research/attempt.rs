//! One search attempt: pick sources, fan out to them concurrently, collect
//! results and a per-source outcome report.
//!
//! A source error never fails the attempt. Throttling goes through the circuit
//! breaker: non-critical sources are excluded for the rest of the run, critical
//! ones are retried with linear backoff.

use crate::decision::{call_site, DecisionService};
use crate::research::resources::{BreakerVerdict, ResourceManager};
use crate::research::task::{ResultRecord, TaskId};
use crate::research::trace::{TraceEvent, Tracer};
use crate::sources::{QueryParams, SearchOutcome, SourceIntegration, SourceRegistry};
use crate::utils::toml_config::ArgusConfig;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Source id -> extra query parameters
pub type ParamHints = BTreeMap<String, BTreeMap<String, Value>>;

/// How one source fared in one attempt. Errors are kept apart from empty
/// result sets so reformulation can tell them apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Ok { result_count: usize },
    Empty,
    Error { message: String },
    RateLimited { message: String, excluded: bool },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(flatten)]
    pub status: SourceStatus,
}

impl SourceReport {
    fn skipped(source: &str, reason: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            query: None,
            status: SourceStatus::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.status,
            SourceStatus::Error { .. } | SourceStatus::RateLimited { .. }
        )
    }
}

/// Combined output of one attempt, in source-id order.
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    pub results: Vec<ResultRecord>,
    pub reports: Vec<SourceReport>,
}

impl AttemptOutcome {
    pub fn error_count(&self) -> usize {
        self.reports.iter().filter(|r| r.is_error()).count()
    }
}

pub struct SearchExecutor {
    config: Arc<ArgusConfig>,
    registry: Arc<SourceRegistry>,
    resources: Arc<ResourceManager>,
    decision: Arc<dyn DecisionService>,
    tracer: Tracer,
}

impl SearchExecutor {
    pub fn new(
        config: Arc<ArgusConfig>,
        registry: Arc<SourceRegistry>,
        resources: Arc<ResourceManager>,
        decision: Arc<dyn DecisionService>,
        tracer: Tracer,
    ) -> Self {
        Self {
            config,
            registry,
            resources,
            decision,
            tracer,
        }
    }

    /// Registered, enabled and not circuit-broken
    pub fn available_sources(&self) -> Vec<String> {
        self.registry
            .source_names()
            .into_iter()
            .filter(|s| self.config.is_source_enabled(s))
            .filter(|s| !self.resources.breaker().is_tripped(s))
            .collect()
    }

    pub fn description(&self, source: &str) -> String {
        self.registry
            .get(source)
            .map(|s| s.description().to_string())
            .unwrap_or_default()
    }

    /// Drop anything no longer available, keeping order.
    pub fn still_available(&self, sources: &[String]) -> Vec<String> {
        let available = self.available_sources();
        sources
            .iter()
            .filter(|s| available.contains(s))
            .cloned()
            .collect()
    }

    /// Ask the decision service which sources suit `query`.
    ///
    /// Falls back to every available source that claims relevance.
    pub async fn select(&self, task_id: TaskId, query: &str) -> Vec<String> {
        let candidates: Vec<(String, String)> = self
            .available_sources()
            .into_iter()
            .filter_map(|name| {
                let source = self.registry.get(&name)?;
                source
                    .is_relevant(query)
                    .then(|| (name, source.description().to_string()))
            })
            .collect();

        if candidates.is_empty() {
            return Vec::new();
        }

        match self.decision.select_sources(query, &candidates).await {
            Ok(selection) => selection.sources,
            Err(e) => {
                tracing::warn!(
                    task_id,
                    call_site = call_site::SELECT_SOURCES,
                    error = %e,
                    "Source selection failed, using all relevant sources"
                );
                self.tracer
                    .task(
                        task_id,
                        TraceEvent::DecisionFallback {
                            call_site: call_site::SELECT_SOURCES.to_string(),
                            error: e.to_string(),
                            fallback: "all relevant sources".to_string(),
                        },
                    )
                    .await;
                candidates.into_iter().map(|(name, _)| name).collect()
            }
        }
    }

    /// Query every source concurrently.
    pub async fn search(
        &self,
        task_id: TaskId,
        query: &str,
        sources: &[String],
        hints: &ParamHints,
    ) -> AttemptOutcome {
        let calls = sources
            .iter()
            .map(|source| self.search_one(task_id, source, query, hints.get(source)));

        let mut outcome = AttemptOutcome::default();
        for (report, results) in join_all(calls).await {
            outcome.reports.push(report);
            outcome.results.extend(results);
        }
        outcome
    }

    /// Query a single source with `query`, merging any parameter hints.
    pub async fn search_one(
        &self,
        task_id: TaskId,
        source: &str,
        query: &str,
        hints: Option<&BTreeMap<String, Value>>,
    ) -> (SourceReport, Vec<ResultRecord>) {
        if self.resources.breaker().is_tripped(source) {
            return (SourceReport::skipped(source, "circuit breaker open"), Vec::new());
        }
        let Some(integration) = self.registry.get(source) else {
            return (SourceReport::skipped(source, "unknown source"), Vec::new());
        };
        let Some(mut params) = integration.generate_query(query).await else {
            return (SourceReport::skipped(source, "not applicable to query"), Vec::new());
        };
        if let Some(hints) = hints {
            for (key, value) in hints {
                params.insert(key.clone(), value.clone());
            }
        }

        let credentials = match self.config.resolve_credentials(source) {
            Ok(credentials) => credentials,
            Err(e) => {
                let report = SourceReport {
                    source: source.to_string(),
                    query: Some(query.to_string()),
                    status: SourceStatus::Error {
                        message: e.to_string(),
                    },
                };
                return (report, Vec::new());
            }
        };

        let (outcome, excluded) = self
            .call_with_breaker(task_id, integration.as_ref(), &params, &credentials)
            .await;

        self.tracer
            .task(
                task_id,
                TraceEvent::SourceCall {
                    source: source.to_string(),
                    query: query.to_string(),
                    success: outcome.success,
                    result_count: outcome.results.len(),
                    error: outcome.error.as_ref().map(|e| e.message.clone()),
                    rate_limited: outcome.is_rate_limited(),
                },
            )
            .await;
        if excluded {
            self.tracer
                .task(
                    task_id,
                    TraceEvent::SourceExcluded {
                        source: source.to_string(),
                    },
                )
                .await;
        }

        let status = match &outcome.error {
            Some(failure) if failure.rate_limited => SourceStatus::RateLimited {
                message: failure.message.clone(),
                excluded,
            },
            Some(failure) => SourceStatus::Error {
                message: failure.message.clone(),
            },
            None if outcome.results.is_empty() => SourceStatus::Empty,
            None => SourceStatus::Ok {
                result_count: outcome.results.len(),
            },
        };
        let report = SourceReport {
            source: source.to_string(),
            query: Some(query.to_string()),
            status,
        };

        let results = outcome
            .results
            .into_iter()
            .map(|mut r| {
                if r.source.is_empty() {
                    r.source = source.to_string();
                }
                r
            })
            .collect();

        (report, results)
    }

    /// Call a source through its rate gate; returns the outcome and whether
    /// the source was excluded by the breaker.
    async fn call_with_breaker(
        &self,
        task_id: TaskId,
        integration: &dyn SourceIntegration,
        params: &QueryParams,
        credentials: &crate::sources::Credentials,
    ) -> (SearchOutcome, bool) {
        let name = integration.name().to_string();
        let source_config = self.config.source(&name);
        let limit = self.config.results_limit(&name);
        let mut throttled_retries = 0u32;

        loop {
            let outcome = self
                .resources
                .call_source(&name, || integration.execute_search(params, credentials, limit))
                .await;

            if let Some(failure) = &outcome.error {
                tracing::warn!(
                    task_id,
                    source = %name,
                    rate_limited = failure.rate_limited,
                    error = %failure.message,
                    "Source call failed"
                );
            }
            if !outcome.is_rate_limited() {
                return (outcome, false);
            }

            match self.resources.breaker().report_rate_limited(&name) {
                BreakerVerdict::Critical
                    if throttled_retries < source_config.critical_retry_attempts =>
                {
                    throttled_retries += 1;
                    let backoff = Duration::from_millis(
                        source_config.critical_retry_backoff_ms * u64::from(throttled_retries),
                    );
                    tracing::info!(
                        task_id,
                        source = %name,
                        attempt = throttled_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Critical source throttled, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                BreakerVerdict::Critical => return (outcome, false),
                BreakerVerdict::Tripped | BreakerVerdict::AlreadyTripped => {
                    return (outcome, true)
                }
            }
        }
    }
}

// ============= Result Filtering =============

/// Keep the records at `accepted` in their original order. Indices may
/// arrive in any order, repeated or out of range.
pub fn take_accepted(results: Vec<ResultRecord>, accepted: &[usize]) -> Vec<ResultRecord> {
    let accepted: BTreeSet<usize> = accepted.iter().copied().collect();
    results
        .into_iter()
        .enumerate()
        .filter(|(i, _)| accepted.contains(i))
        .map(|(_, r)| r)
        .collect()
}

/// Parse the date formats integrations commonly emit.
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// A date more than `tolerance_days` after `now`. Unparseable dates pass.
pub fn is_implausibly_future(record: &ResultRecord, now: DateTime<Utc>, tolerance_days: i64) -> bool {
    record
        .date
        .as_deref()
        .and_then(parse_date)
        .is_some_and(|date| date > now + chrono::Duration::days(tolerance_days))
}

pub fn drop_future_dated(
    results: Vec<ResultRecord>,
    tolerance_days: i64,
) -> (Vec<ResultRecord>, usize) {
    let now = Utc::now();
    let before = results.len();
    let kept: Vec<ResultRecord> = results
        .into_iter()
        .filter(|r| !is_implausibly_future(r, now, tolerance_days))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

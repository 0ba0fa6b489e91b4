//! Task, hypothesis and result records shared across the orchestration core.

use crate::types::Decision;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub type TaskId = u64;

/// Metadata key under which the coverage-decision history is kept.
pub const COVERAGE_HISTORY_KEY: &str = "coverage_decisions";
/// Metadata key recording a best-effort entity extraction failure.
pub const ENTITY_ERROR_KEY: &str = "entity_extraction_error";

/// Lowest (most urgent) and highest task priority.
pub const PRIORITY_HIGHEST: u8 = 1;
pub const PRIORITY_LOWEST: u8 = 10;
const DEFAULT_PRIORITY: u8 = 5;

/// `PENDING -> IN_PROGRESS -> {RETRY -> IN_PROGRESS}* -> COMPLETED | FAILED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Retry,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Why a task ended in `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Sources returned results but every one was rejected as irrelevant.
    AllResultsRejected,
    /// No source returned anything.
    NoResultsFound,
    /// The per-task budget covering all retries ran out.
    Timeout,
    /// Anything else that escaped the retry loop.
    Error(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::AllResultsRejected => write!(f, "all results rejected"),
            FailureReason::NoResultsFound => write!(f, "no results found"),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// One item returned by a source integration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Set by the hypothesis that first produced this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis_id: Option<String>,
    /// Set once a duplicate from another hypothesis has been merged in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hypothesis_ids: Vec<String>,
    /// Entity names the integration attached to this record, if any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
}

impl ResultRecord {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        snippet: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn with_entities(mut self, entities: Vec<String>) -> Self {
        self.entities = entities;
        self
    }

    /// All hypotheses this record is attributed to.
    pub fn attributions(&self) -> Vec<&str> {
        if !self.hypothesis_ids.is_empty() {
            self.hypothesis_ids.iter().map(String::as_str).collect()
        } else {
            self.hypothesis_id.as_deref().into_iter().collect()
        }
    }
}

/// How a hypothesis proposes to look for evidence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SearchStrategy {
    /// Source ids to query
    #[serde(default)]
    pub target_sources: Vec<String>,
    /// Signals that would indicate a match
    #[serde(default)]
    pub signals: Vec<String>,
    /// Entity names the hypothesis expects to surface
    #[serde(default)]
    pub expected_entities: Vec<String>,
}

/// One candidate investigative angle for a task. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Scoped to the owning task, e.g. `"4.2"`
    pub id: String,
    pub statement: String,
    pub confidence: u8,
    pub confidence_rationale: String,
    pub strategy: SearchStrategy,
    /// Lower is explored first
    pub exploration_priority: u8,
    pub priority_rationale: String,
}

/// Deterministic new-vs-duplicate counts for one hypothesis execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaMetrics {
    pub results_new: usize,
    pub results_duplicate: usize,
    pub entities_new: usize,
    pub entities_duplicate: usize,
    pub total_results: usize,
    pub total_entities: usize,
}

impl DeltaMetrics {
    /// Share of the pool contributed by this execution, in percent.
    pub fn incremental_gain_pct(&self) -> f64 {
        if self.total_results == 0 {
            0.0
        } else {
            self.results_new as f64 / self.total_results as f64 * 100.0
        }
    }
}

/// Record of one hypothesis's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisRun {
    pub hypothesis_id: String,
    pub statement: String,
    /// Source id -> query text issued
    pub queries: BTreeMap<String, String>,
    pub raw_result_count: usize,
    #[serde(flatten)]
    pub metrics: DeltaMetrics,
}

/// Ground-truth numbers injected next to every coverage assessment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageFacts {
    pub results_new: usize,
    pub results_duplicate: usize,
    pub latest_gain_pct: f64,
    pub entities_new: usize,
    pub hypotheses_executed: usize,
    pub hypotheses_remaining: usize,
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
}

/// One coverage assessment, with the facts it was made against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageDecision {
    pub decision: Decision,
    pub assessment: String,
    #[serde(default)]
    pub gaps: Vec<String>,
    pub facts: CoverageFacts,
}

/// Unit of investigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub query: String,
    pub rationale: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Append-only across retries
    accumulated_results: Vec<ResultRecord>,
    pub entities: BTreeSet<String>,
    pub hypotheses: Option<Vec<Hypothesis>>,
    pub hypothesis_runs: Vec<HypothesisRun>,
    pub metadata: serde_json::Map<String, Value>,
    pub parent_id: Option<TaskId>,
    pub priority: u8,
    pub priority_rationale: Option<String>,
    pub estimated_value: Option<u8>,
    pub estimated_redundancy: Option<u8>,
    pub failure: Option<FailureReason>,
}

impl Task {
    pub fn new(id: TaskId, query: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            id,
            query: query.into(),
            rationale: rationale.into(),
            status: TaskStatus::Pending,
            retry_count: 0,
            accumulated_results: Vec::new(),
            entities: BTreeSet::new(),
            hypotheses: None,
            hypothesis_runs: Vec::new(),
            metadata: serde_json::Map::new(),
            parent_id: None,
            priority: DEFAULT_PRIORITY,
            priority_rationale: None,
            estimated_value: None,
            estimated_redundancy: None,
            failure: None,
        }
    }

    /// A follow-up spawned from `parent`.
    pub fn follow_up(
        id: TaskId,
        parent: TaskId,
        query: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        let mut task = Self::new(id, query, rationale);
        task.parent_id = Some(parent);
        task
    }

    pub fn accumulated_results(&self) -> &[ResultRecord] {
        &self.accumulated_results
    }

    /// Append a batch. Existing results are never replaced or reordered.
    pub fn append_results(&mut self, batch: impl IntoIterator<Item = ResultRecord>) {
        self.accumulated_results.extend(batch);
    }

    /// Mutable access for in-place attribution merges; length stays fixed.
    pub(crate) fn results_mut(&mut self) -> &mut [ResultRecord] {
        &mut self.accumulated_results
    }

    pub fn has_results(&self) -> bool {
        !self.accumulated_results.is_empty()
    }

    pub fn coverage_history(&self) -> Vec<CoverageDecision> {
        self.metadata
            .get(COVERAGE_HISTORY_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn latest_coverage(&self) -> Option<CoverageDecision> {
        self.coverage_history().pop()
    }

    pub fn record_coverage(&mut self, decision: &CoverageDecision) {
        let entry = serde_json::to_value(decision).unwrap_or(Value::Null);
        match self.metadata.get_mut(COVERAGE_HISTORY_KEY) {
            Some(Value::Array(history)) => history.push(entry),
            _ => {
                self.metadata
                    .insert(COVERAGE_HISTORY_KEY.to_string(), Value::Array(vec![entry]));
            }
        }
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.failure = None;
    }

    pub fn fail(&mut self, reason: FailureReason) {
        self.status = TaskStatus::Failed;
        self.failure = Some(reason);
    }
}

//! Decision Service
//!
//! The language-model collaborator the orchestration core consults for every
//! judgment it cannot make locally. Each call site has a fixed structured
//! output type; implementations validate the response before returning it and
//! report anything unusable as [`AppError::Decision`](crate::types::AppError).
//!
//! Callers own the fallback policy. The service itself never guesses.
//!
//! | Call site | Output | Caller fallback on error |
//! |-----------|--------|--------------------------|
//! | `decompose` | [`TaskSpec`]s | fatal to the run |
//! | `select_sources` | [`SourceSelection`] | all available sources |
//! | `judge_relevance` | [`RelevanceVerdict`] | the attempt fails |
//! | `reformulate_query` | new query text | stop retrying |
//! | `generate_hypotheses` | [`HypothesisDraft`]s | no hypotheses |
//! | `hypothesis_query` | query text | integration's own query |
//! | `assess_coverage` | [`CoverageAssessment`] | continue while ceilings allow |
//! | `prioritize` | [`PriorityAssignment`]s | submission order |
//! | `assess_saturation` | [`SaturationAssessment`] | not saturated |
//! | `extract_entities` | entity names | empty, error kept in metadata |
//! | `generate_follow_ups` | [`TaskSpec`]s | no follow-ups |

/// Decision service backed by an [`LLMClient`](crate::llm::LLMClient).
pub mod llm;

use crate::research::attempt::SourceReport;
use crate::research::resources::TaskSummary;
use crate::research::task::{
    CoverageFacts, Hypothesis, HypothesisRun, ResultRecord, SearchStrategy, Task, TaskId,
};
use crate::types::{Decision, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub use llm::LlmDecisionService;

/// Call site names used in errors, logs and trace entries.
pub mod call_site {
    pub const DECOMPOSE: &str = "decompose";
    pub const SELECT_SOURCES: &str = "select_sources";
    pub const JUDGE_RELEVANCE: &str = "judge_relevance";
    pub const REFORMULATE_QUERY: &str = "reformulate_query";
    pub const GENERATE_HYPOTHESES: &str = "generate_hypotheses";
    pub const HYPOTHESIS_QUERY: &str = "hypothesis_query";
    pub const ASSESS_COVERAGE: &str = "assess_coverage";
    pub const PRIORITIZE: &str = "prioritize";
    pub const ASSESS_SATURATION: &str = "assess_saturation";
    pub const EXTRACT_ENTITIES: &str = "extract_entities";
    pub const GENERATE_FOLLOW_UPS: &str = "generate_follow_ups";
}

// ============= Structured Outputs =============

/// A task to create: what to search for and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskSpec {
    pub query: String,
    #[serde(default)]
    pub rationale: String,
}

impl TaskSpec {
    pub fn new(query: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            rationale: rationale.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SourceSelection {
    /// Source ids to query, drawn from the available list
    pub sources: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

/// Source changes to apply on the next retry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SourceAdjustments {
    /// If non-empty, only these sources are kept
    #[serde(default)]
    pub keep: Vec<String>,
    #[serde(default)]
    pub drop: Vec<String>,
    #[serde(default)]
    pub add: Vec<String>,
}

impl SourceAdjustments {
    pub fn is_empty(&self) -> bool {
        self.keep.is_empty() && self.drop.is_empty() && self.add.is_empty()
    }

    /// Apply to the current selection; only ids in `available` survive.
    pub fn apply(&self, current: &[String], available: &[String]) -> Vec<String> {
        let mut next: Vec<String> = current
            .iter()
            .filter(|s| self.keep.is_empty() || self.keep.contains(s))
            .filter(|s| !self.drop.contains(s))
            .cloned()
            .collect();
        for added in &self.add {
            if !next.contains(added) && !self.drop.contains(added) {
                next.push(added.clone());
            }
        }
        next.retain(|s| available.contains(s));
        next
    }
}

/// Relevance judgment over one attempt's combined raw results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RelevanceVerdict {
    /// Whether any of the results are usable
    pub accept: bool,
    /// Zero-based indices into the presented result list
    #[serde(default)]
    pub accepted_indices: Vec<usize>,
    /// Whether another attempt with a new query is worthwhile
    pub decision: Decision,
    #[serde(default)]
    pub reformulated_query: Option<String>,
    /// Source id -> parameters to merge into that source's next query
    #[serde(default)]
    pub param_hints: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub source_adjustments: SourceAdjustments,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Reformulation {
    pub query: String,
    #[serde(default)]
    pub rationale: String,
}

/// A generated hypothesis before the core assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HypothesisDraft {
    pub statement: String,
    /// 0-100
    pub confidence: u8,
    #[serde(default)]
    pub confidence_rationale: String,
    #[serde(default)]
    pub strategy: SearchStrategy,
    /// 1 is explored first
    pub exploration_priority: u8,
    #[serde(default)]
    pub priority_rationale: String,
}

impl HypothesisDraft {
    pub fn into_hypothesis(self, id: String) -> Hypothesis {
        Hypothesis {
            id,
            statement: self.statement,
            confidence: self.confidence,
            confidence_rationale: self.confidence_rationale,
            strategy: self.strategy,
            exploration_priority: self.exploration_priority,
            priority_rationale: self.priority_rationale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CoverageAssessment {
    pub decision: Decision,
    #[serde(default)]
    pub assessment: String,
    #[serde(default)]
    pub gaps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PriorityAssignment {
    pub task_id: TaskId,
    /// 1 (highest) to 10 (lowest)
    pub priority: u8,
    /// 0-100
    pub estimated_value: u8,
    /// 0-100
    pub estimated_redundancy: u8,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SaturationRecommendation {
    Stop,
    ContinueLimited,
    ContinueFull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SaturationAssessment {
    pub saturated: bool,
    /// 0-100
    pub confidence: u8,
    #[serde(default)]
    pub rationale: String,
    pub recommendation: SaturationRecommendation,
    /// Only meaningful when not saturated
    #[serde(default)]
    pub recommended_additional_tasks: Option<usize>,
}

impl SaturationAssessment {
    /// The conservative answer used when the service cannot be consulted.
    pub fn not_saturated(rationale: impl Into<String>) -> Self {
        Self {
            saturated: false,
            confidence: 0,
            rationale: rationale.into(),
            recommendation: SaturationRecommendation::ContinueFull,
            recommended_additional_tasks: None,
        }
    }
}

// ============= Call Inputs =============

pub struct RelevanceRequest<'a> {
    pub question: &'a str,
    pub task_query: &'a str,
    pub current_query: &'a str,
    pub results: &'a [ResultRecord],
    pub source_reports: &'a [SourceReport],
    pub retry_count: u32,
    pub max_retries: u32,
}

pub struct ReformulationRequest<'a> {
    pub task_query: &'a str,
    pub current_query: &'a str,
    pub source_reports: &'a [SourceReport],
    pub accepted_so_far: usize,
    /// Why the relevance judgment wanted another attempt
    pub rationale: &'a str,
}

pub struct HypothesisRequest<'a> {
    pub question: &'a str,
    pub task_query: &'a str,
    pub max_hypotheses: usize,
    /// Earlier hypotheses from this task and its siblings
    pub prior: &'a [Hypothesis],
    pub available_sources: &'a [(String, String)],
}

pub struct CoverageRequest<'a> {
    pub task_query: &'a str,
    pub executed: &'a [HypothesisRun],
    pub remaining: &'a [Hypothesis],
    pub facts: &'a CoverageFacts,
}

pub struct FollowUpRequest<'a> {
    pub question: &'a str,
    pub task: &'a Task,
    pub gaps: &'a [String],
    pub max_follow_ups: usize,
}

/// What the saturation monitor shows the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaturationDigest {
    pub question: String,
    pub completed: Vec<TaskSummary>,
    /// (id, query) of every task still queued
    pub pending: Vec<(TaskId, String)>,
    pub total_results: usize,
    pub total_entities: usize,
    pub elapsed_secs: f64,
}

// ============= Decision Service Trait =============

#[async_trait]
pub trait DecisionService: Send + Sync {
    /// Break the research question into at most `max_tasks` initial tasks
    async fn decompose(&self, question: &str, max_tasks: usize) -> Result<Vec<TaskSpec>>;

    /// Pick sources for a query from `(id, description)` pairs
    async fn select_sources(
        &self,
        query: &str,
        available: &[(String, String)],
    ) -> Result<SourceSelection>;

    async fn judge_relevance(&self, request: &RelevanceRequest<'_>) -> Result<RelevanceVerdict>;

    async fn reformulate_query(&self, request: &ReformulationRequest<'_>) -> Result<String>;

    async fn generate_hypotheses(
        &self,
        request: &HypothesisRequest<'_>,
    ) -> Result<Vec<HypothesisDraft>>;

    /// One query for one hypothesis against one targeted source
    async fn hypothesis_query(
        &self,
        hypothesis: &Hypothesis,
        source: &str,
        source_description: &str,
    ) -> Result<String>;

    async fn assess_coverage(&self, request: &CoverageRequest<'_>) -> Result<CoverageAssessment>;

    async fn prioritize(
        &self,
        pending: &[Task],
        completed: &[TaskSummary],
    ) -> Result<Vec<PriorityAssignment>>;

    async fn assess_saturation(&self, digest: &SaturationDigest) -> Result<SaturationAssessment>;

    async fn extract_entities(&self, query: &str, results: &[ResultRecord]) -> Result<Vec<String>>;

    async fn generate_follow_ups(&self, request: &FollowUpRequest<'_>) -> Result<Vec<TaskSpec>>;
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use crate::types::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every call, except `select_sources` when a selection is set.
    #[derive(Default)]
    pub(crate) struct StubDecision {
        pub selection: Option<Vec<String>>,
        calls: AtomicUsize,
    }

    impl StubDecision {
        pub fn selecting(sources: &[&str]) -> Self {
            Self {
                selection: Some(sources.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn fail<T>(&self, site: &str) -> Result<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::decision(site, "stubbed failure"))
        }
    }

    #[async_trait]
    impl DecisionService for StubDecision {
        async fn decompose(&self, _: &str, _: usize) -> Result<Vec<TaskSpec>> {
            self.fail(call_site::DECOMPOSE)
        }
        async fn select_sources(&self, _: &str, _: &[(String, String)]) -> Result<SourceSelection> {
            match &self.selection {
                Some(sources) => {
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    Ok(SourceSelection {
                        sources: sources.clone(),
                        rationale: String::new(),
                    })
                }
                None => self.fail(call_site::SELECT_SOURCES),
            }
        }
        async fn judge_relevance(&self, _: &RelevanceRequest<'_>) -> Result<RelevanceVerdict> {
            self.fail(call_site::JUDGE_RELEVANCE)
        }
        async fn reformulate_query(&self, _: &ReformulationRequest<'_>) -> Result<String> {
            self.fail(call_site::REFORMULATE_QUERY)
        }
        async fn generate_hypotheses(&self, _: &HypothesisRequest<'_>) -> Result<Vec<HypothesisDraft>> {
            self.fail(call_site::GENERATE_HYPOTHESES)
        }
        async fn hypothesis_query(&self, _: &Hypothesis, _: &str, _: &str) -> Result<String> {
            self.fail(call_site::HYPOTHESIS_QUERY)
        }
        async fn assess_coverage(&self, _: &CoverageRequest<'_>) -> Result<CoverageAssessment> {
            self.fail(call_site::ASSESS_COVERAGE)
        }
        async fn prioritize(&self, _: &[Task], _: &[TaskSummary]) -> Result<Vec<PriorityAssignment>> {
            self.fail(call_site::PRIORITIZE)
        }
        async fn assess_saturation(&self, _: &SaturationDigest) -> Result<SaturationAssessment> {
            self.fail(call_site::ASSESS_SATURATION)
        }
        async fn extract_entities(&self, _: &str, _: &[ResultRecord]) -> Result<Vec<String>> {
            self.fail(call_site::EXTRACT_ENTITIES)
        }
        async fn generate_follow_ups(&self, _: &FollowUpRequest<'_>) -> Result<Vec<TaskSpec>> {
            self.fail(call_site::GENERATE_FOLLOW_UPS)
        }
    }
}

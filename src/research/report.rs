//! Final research report and its synthesis.

use crate::llm::LLMClient;
use crate::research::dedup::{dedupe_results, normalize};
use crate::research::entity_graph::EntityGraph;
use crate::research::task::{
    CoverageDecision, FailureReason, Hypothesis, HypothesisRun, ResultRecord, Task, TaskId,
    TaskStatus,
};
use crate::types::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Why the coordinator loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    QueueExhausted,
    TaskCeiling,
    Budget,
    Saturated { confidence: u8 },
    /// The run failed before or after the loop
    Aborted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::QueueExhausted => write!(f, "queue exhausted"),
            StopReason::TaskCeiling => write!(f, "task ceiling reached"),
            StopReason::Budget => write!(f, "run budget exhausted"),
            StopReason::Saturated { confidence } => {
                write!(f, "saturated ({}% confidence)", confidence)
            }
            StopReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// Per-task metadata carried into the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub query: String,
    pub rationale: String,
    pub parent_id: Option<TaskId>,
    pub status: TaskStatus,
    pub priority: u8,
    pub retry_count: u32,
    pub result_count: usize,
    pub entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hypotheses: Vec<Hypothesis>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hypothesis_runs: Vec<HypothesisRun>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coverage: Vec<CoverageDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl From<&Task> for TaskReport {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            query: task.query.clone(),
            rationale: task.rationale.clone(),
            parent_id: task.parent_id,
            status: task.status,
            priority: task.priority,
            retry_count: task.retry_count,
            result_count: task.accumulated_results().len(),
            entities: task.entities.iter().cloned().collect(),
            hypotheses: task.hypotheses.clone().unwrap_or_default(),
            hypothesis_runs: task.hypothesis_runs.clone(),
            coverage: task.coverage_history(),
            failure: task.failure.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub id: TaskId,
    pub query: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub run_id: String,
    pub question: String,
    pub started_at: DateTime<Utc>,
    pub report_text: String,
    /// Deduplicated across every completed task
    pub results: Vec<ResultRecord>,
    /// Lower-cased union of entities from completed tasks
    pub entities: Vec<String>,
    pub entity_graph: EntityGraph,
    pub tasks: Vec<TaskReport>,
    pub failed_tasks: Vec<FailedTask>,
    pub stop_reason: StopReason,
    pub elapsed_secs: f64,
}

impl ResearchReport {
    /// Everything but the report text, from the coordinator's final state.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        run_id: &str,
        question: &str,
        started_at: DateTime<Utc>,
        completed: &[Task],
        failed: &[Task],
        entity_graph: EntityGraph,
        stop_reason: StopReason,
        elapsed_secs: f64,
    ) -> Self {
        let results = dedupe_results(
            completed
                .iter()
                .flat_map(|t| t.accumulated_results().iter().cloned()),
        );

        let entities: BTreeSet<String> = completed
            .iter()
            .flat_map(|t| t.entities.iter())
            .map(|e| normalize(e))
            .filter(|e| !e.is_empty())
            .collect();

        let mut tasks: Vec<TaskReport> = completed
            .iter()
            .chain(failed.iter())
            .map(TaskReport::from)
            .collect();
        tasks.sort_by_key(|t| t.id);

        let failed_tasks = failed
            .iter()
            .map(|t| FailedTask {
                id: t.id,
                query: t.query.clone(),
                reason: t
                    .failure
                    .clone()
                    .unwrap_or_else(|| FailureReason::Error("unknown".to_string())),
            })
            .collect();

        Self {
            run_id: run_id.to_string(),
            question: question.to_string(),
            started_at,
            report_text: String::new(),
            results,
            entities: entities.into_iter().collect(),
            entity_graph,
            tasks,
            failed_tasks,
            stop_reason,
            elapsed_secs,
        }
    }
}

/// A run that could not produce a report, with whatever state existed.
#[derive(Debug, thiserror::Error)]
#[error("research run failed: {error}")]
pub struct RunFailure {
    #[source]
    pub error: AppError,
    pub partial: Box<ResearchReport>,
}

// ============= Synthesis =============

/// Turns the aggregated findings into report text. The core never inspects it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportSynthesizer: Send + Sync {
    async fn synthesize(&self, report: &ResearchReport) -> Result<String>;
}

pub struct LlmReportSynthesizer {
    llm: Arc<dyn LLMClient>,
    max_results: usize,
}

impl LlmReportSynthesizer {
    pub fn new(llm: Arc<dyn LLMClient>) -> Self {
        Self {
            llm,
            max_results: 60,
        }
    }

    /// Cap on results quoted in the prompt
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    fn build_prompt(&self, report: &ResearchReport) -> String {
        let findings: Vec<String> = report
            .results
            .iter()
            .take(self.max_results)
            .enumerate()
            .map(|(i, r)| {
                let date = r.date.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default();
                format!("[{}] {}{} - {}\n    {}", i + 1, r.title, date, r.url, r.snippet)
            })
            .collect();

        let tasks: Vec<String> = report
            .tasks
            .iter()
            .map(|t| match &t.failure {
                Some(reason) => format!("- #{} {} (failed: {})", t.id, t.query, reason),
                None => format!("- #{} {} ({} results)", t.id, t.query, t.result_count),
            })
            .collect();

        let relationships: Vec<String> = report
            .entity_graph
            .adjacency()
            .iter()
            .filter(|(_, n)| !n.is_empty())
            .map(|(entity, neighbours)| {
                format!(
                    "- {}: {}",
                    entity,
                    neighbours.iter().cloned().collect::<Vec<_>>().join(", ")
                )
            })
            .collect();

        format!(
            r#"Research question: {}

Investigated tasks:
{}

Findings ({} total, numbered for citation):
{}

Entities: {}

Entity co-occurrence:
{}

Write a well-structured research report that answers the question. Include:
1. Direct answer to the question
2. Key findings, citing results by their [number]
3. Notable entities and how they relate
4. Gaps, failed lines of inquiry and caveats"#,
            report.question,
            tasks.join("\n"),
            report.results.len(),
            findings.join("\n"),
            report.entities.join(", "),
            relationships.join("\n"),
        )
    }
}

#[async_trait]
impl ReportSynthesizer for LlmReportSynthesizer {
    async fn synthesize(&self, report: &ResearchReport) -> Result<String> {
        let text = self.llm.generate(&self.build_prompt(report)).await?;
        if text.trim().is_empty() {
            return Err(AppError::LLM("report synthesis returned no text".to_string()));
        }
        Ok(text)
    }
}

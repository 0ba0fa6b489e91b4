//! Per-task procedure: hypothesis execution when enabled, then the
//! retry/reformulation loop.
//!
//! The runner owns its task exclusively while it runs. Every mutation is
//! mirrored into a [`Checkpoint`] so the coordinator can recover partial
//! progress if the task's timeout cancels the runner mid-flight.

use crate::decision::{
    call_site, DecisionService, ReformulationRequest, RelevanceRequest, RelevanceVerdict,
    SourceAdjustments,
};
use crate::research::attempt::{drop_future_dated, take_accepted, ParamHints, SearchExecutor};
use crate::research::hypothesis::HypothesisEngine;
use crate::research::resources::{ResourceManager, TaskSummary};
use crate::research::task::{FailureReason, Task, TaskId, TaskStatus};
use crate::research::trace::{TraceEvent, Tracer};
use crate::types::Decision;
use crate::utils::toml_config::ArgusConfig;
use parking_lot::Mutex;
use std::sync::Arc;

/// Latest consistent copy of a running task.
pub type Checkpoint = Arc<Mutex<Task>>;

pub fn checkpoint(task: &Task) -> Checkpoint {
    Arc::new(Mutex::new(task.clone()))
}

pub struct TaskRunner {
    config: Arc<ArgusConfig>,
    decision: Arc<dyn DecisionService>,
    executor: Arc<SearchExecutor>,
    hypotheses: Arc<HypothesisEngine>,
    resources: Arc<ResourceManager>,
    tracer: Tracer,
    question: String,
}

impl TaskRunner {
    pub fn new(
        config: Arc<ArgusConfig>,
        decision: Arc<dyn DecisionService>,
        executor: Arc<SearchExecutor>,
        hypotheses: Arc<HypothesisEngine>,
        resources: Arc<ResourceManager>,
        tracer: Tracer,
        question: impl Into<String>,
    ) -> Self {
        Self {
            config,
            decision,
            executor,
            hypotheses,
            resources,
            tracer,
            question: question.into(),
        }
    }

    /// Drive `task` to `COMPLETED` or `FAILED`.
    pub async fn run(&self, mut task: Task, checkpoint: Checkpoint) -> Task {
        task.status = TaskStatus::InProgress;
        *checkpoint.lock() = task.clone();

        let has_hypotheses = task.hypotheses.as_ref().is_some_and(|h| !h.is_empty());
        if self.hypotheses.enabled() && has_hypotheses {
            self.hypotheses.execute(&mut task, &checkpoint).await;
            if !task.has_results() {
                tracing::info!(
                    task_id = task.id,
                    "Hypotheses produced no results, falling back to the retry loop"
                );
            }
        }

        let mut saw_raw = task.hypothesis_runs.iter().any(|r| r.raw_result_count > 0);
        if !task.has_results() {
            saw_raw |= self.retry_loop(&mut task, &checkpoint).await;
        }

        if task.has_results() {
            task.complete();
        } else if saw_raw {
            task.fail(FailureReason::AllResultsRejected);
        } else {
            task.fail(FailureReason::NoResultsFound);
        }
        *checkpoint.lock() = task.clone();
        self.resources.record_summary(TaskSummary::from_task(&task));

        tracing::info!(
            task_id = task.id,
            status = ?task.status,
            results = task.accumulated_results().len(),
            retries = task.retry_count,
            "Task finished"
        );
        task
    }

    /// Search, judge, append, maybe reformulate. Returns whether any source
    /// produced raw results at all.
    async fn retry_loop(&self, task: &mut Task, checkpoint: &Checkpoint) -> bool {
        let max_retries = self.config.research.max_retries;
        let tolerance = self.config.research.future_date_tolerance_days;
        let mut query = task.query.clone();
        let mut carried: Option<Vec<String>> = None;
        let mut hints = ParamHints::new();
        let mut saw_raw = false;

        loop {
            let sources = match carried.take().map(|s| self.executor.still_available(&s)) {
                Some(sources) if !sources.is_empty() => sources,
                _ => self.executor.select(task.id, &query).await,
            };
            if sources.is_empty() {
                tracing::warn!(task_id = task.id, query = %query, "No sources available for query");
                break;
            }

            tracing::info!(
                task_id = task.id,
                retry = task.retry_count,
                query = %query,
                sources = ?sources,
                "Search attempt"
            );
            let attempt = self
                .executor
                .search(task.id, &query, &sources, &std::mem::take(&mut hints))
                .await;
            saw_raw |= !attempt.results.is_empty();

            let verdict = if attempt.results.is_empty() {
                Some(nothing_to_judge(attempt.error_count()))
            } else {
                let request = RelevanceRequest {
                    question: &self.question,
                    task_query: &task.query,
                    current_query: &query,
                    results: &attempt.results,
                    source_reports: &attempt.reports,
                    retry_count: task.retry_count,
                    max_retries,
                };
                match self.decision.judge_relevance(&request).await {
                    Ok(verdict) => Some(verdict),
                    Err(e) => {
                        tracing::warn!(
                            task_id = task.id,
                            retry = task.retry_count,
                            call_site = call_site::JUDGE_RELEVANCE,
                            error = %e,
                            "Relevance judgment failed, attempt discarded"
                        );
                        self.fallback(task.id, call_site::JUDGE_RELEVANCE, &e.to_string(), "attempt failed")
                            .await;
                        None
                    }
                }
            };

            let Some(verdict) = verdict else {
                if task.retry_count < max_retries {
                    self.advance_retry(task, checkpoint);
                    carried = Some(sources);
                    task.status = TaskStatus::InProgress;
                    continue;
                }
                break;
            };

            let presented = attempt.results.len();
            let accepted = take_accepted(attempt.results, &verdict.accepted_indices);
            let (accepted, dropped) = drop_future_dated(accepted, tolerance);
            if dropped > 0 {
                tracing::debug!(task_id = task.id, dropped, "Dropped future-dated results");
            }

            self.tracer
                .task(
                    task.id,
                    TraceEvent::RelevanceVerdict {
                        retry: task.retry_count,
                        presented,
                        accepted: accepted.len(),
                        decision: verdict.decision,
                        reformulated_query: verdict.reformulated_query.clone(),
                        rationale: verdict.rationale.clone(),
                    },
                )
                .await;

            if !accepted.is_empty() {
                task.append_results(accepted);
                *checkpoint.lock() = task.clone();
                self.tracer.snapshot(task).await;
            }

            if verdict.decision != Decision::Continue || task.retry_count >= max_retries {
                break;
            }

            let next_query = match verdict.reformulated_query.clone() {
                Some(next) => next,
                None => {
                    let request = ReformulationRequest {
                        task_query: &task.query,
                        current_query: &query,
                        source_reports: &attempt.reports,
                        accepted_so_far: task.accumulated_results().len(),
                        rationale: &verdict.rationale,
                    };
                    match self.decision.reformulate_query(&request).await {
                        Ok(next) => next,
                        Err(e) => {
                            tracing::warn!(
                                task_id = task.id,
                                call_site = call_site::REFORMULATE_QUERY,
                                error = %e,
                                "Query reformulation failed, stopping"
                            );
                            self.fallback(task.id, call_site::REFORMULATE_QUERY, &e.to_string(), "stop")
                                .await;
                            break;
                        }
                    }
                }
            };

            self.advance_retry(task, checkpoint);
            self.tracer
                .task(
                    task.id,
                    TraceEvent::Reformulation {
                        retry: task.retry_count,
                        from: query.clone(),
                        to: next_query.clone(),
                    },
                )
                .await;
            tracing::info!(
                task_id = task.id,
                retry = task.retry_count,
                from = %query,
                to = %next_query,
                "Reformulated query"
            );

            query = next_query;
            carried = carry_sources(&verdict.source_adjustments, &sources, &self.executor.available_sources());
            hints = verdict.param_hints;
            task.status = TaskStatus::InProgress;
        }

        saw_raw
    }

    fn advance_retry(&self, task: &mut Task, checkpoint: &Checkpoint) {
        task.retry_count += 1;
        task.status = TaskStatus::Retry;
        *checkpoint.lock() = task.clone();
    }

    async fn fallback(&self, task_id: TaskId, site: &str, error: &str, fallback: &str) {
        self.tracer
            .task(
                task_id,
                TraceEvent::DecisionFallback {
                    call_site: site.to_string(),
                    error: error.to_string(),
                    fallback: fallback.to_string(),
                },
            )
            .await;
    }
}

/// Verdict for an attempt that returned nothing: keep going, let
/// reformulation explain why.
fn nothing_to_judge(error_count: usize) -> RelevanceVerdict {
    RelevanceVerdict {
        accept: false,
        accepted_indices: Vec::new(),
        decision: Decision::Continue,
        reformulated_query: None,
        param_hints: Default::default(),
        source_adjustments: SourceAdjustments::default(),
        rationale: if error_count > 0 {
            format!("no results; {} source(s) returned errors", error_count)
        } else {
            "no results from any source".to_string()
        },
    }
}

/// Sources for the next attempt when the verdict carried adjustments;
/// `None` means select again.
fn carry_sources(
    adjustments: &SourceAdjustments,
    current: &[String],
    available: &[String],
) -> Option<Vec<String>> {
    (!adjustments.is_empty()).then(|| adjustments.apply(current, available))
}

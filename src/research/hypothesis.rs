//! Hypothesis branching: generate competing investigative angles for a task
//! and execute them, either all at once or one by one with coverage-driven
//! stopping.

use crate::decision::{
    call_site, CoverageRequest, DecisionService, HypothesisRequest, RelevanceRequest,
};
use crate::research::attempt::{drop_future_dated, take_accepted, SearchExecutor, SourceReport};
use crate::research::dedup::{absorb_batch, batch_entities};
use crate::research::runner::Checkpoint;
use crate::research::task::{
    CoverageDecision, CoverageFacts, DeltaMetrics, Hypothesis, HypothesisRun, ResultRecord, Task,
    TaskId,
};
use crate::research::trace::{TraceEvent, Tracer};
use crate::utils::toml_config::{ArgusConfig, HypothesisMode};
use crate::types::Decision;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Accepted output of one hypothesis, before it is merged into the task.
struct HypothesisBatch {
    queries: BTreeMap<String, String>,
    raw_count: usize,
    accepted: Vec<ResultRecord>,
}

pub struct HypothesisEngine {
    config: Arc<ArgusConfig>,
    decision: Arc<dyn DecisionService>,
    executor: Arc<SearchExecutor>,
    tracer: Tracer,
    question: String,
}

impl HypothesisEngine {
    pub fn new(
        config: Arc<ArgusConfig>,
        decision: Arc<dyn DecisionService>,
        executor: Arc<SearchExecutor>,
        tracer: Tracer,
        question: impl Into<String>,
    ) -> Self {
        Self {
            config,
            decision,
            executor,
            tracer,
            question: question.into(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.hypotheses.enabled
    }

    /// Generate hypotheses for `task`. `prior` holds earlier hypotheses from
    /// this run so the service can steer away from near-duplicates.
    ///
    /// Returns an empty list if the service fails.
    pub async fn generate(&self, task: &Task, prior: &[Hypothesis]) -> Vec<Hypothesis> {
        let available: Vec<(String, String)> = self
            .executor
            .available_sources()
            .into_iter()
            .map(|s| {
                let description = self.executor.description(&s);
                (s, description)
            })
            .collect();

        let request = HypothesisRequest {
            question: &self.question,
            task_query: &task.query,
            max_hypotheses: self.config.hypotheses.max_hypotheses,
            prior,
            available_sources: &available,
        };

        match self.decision.generate_hypotheses(&request).await {
            Ok(drafts) => {
                let hypotheses: Vec<Hypothesis> = drafts
                    .into_iter()
                    .enumerate()
                    .map(|(i, d)| d.into_hypothesis(format!("{}.{}", task.id, i + 1)))
                    .collect();
                tracing::info!(
                    task_id = task.id,
                    count = hypotheses.len(),
                    "Generated hypotheses"
                );
                self.tracer
                    .task(
                        task.id,
                        TraceEvent::HypothesesGenerated {
                            hypothesis_ids: hypotheses.iter().map(|h| h.id.clone()).collect(),
                        },
                    )
                    .await;
                hypotheses
            }
            Err(e) => {
                tracing::warn!(
                    task_id = task.id,
                    call_site = call_site::GENERATE_HYPOTHESES,
                    error = %e,
                    "Hypothesis generation failed, task runs without hypotheses"
                );
                self.fallback(task.id, call_site::GENERATE_HYPOTHESES, &e.to_string(), "no hypotheses")
                    .await;
                Vec::new()
            }
        }
    }

    /// Execute the task's hypotheses in the configured mode.
    pub async fn execute(&self, task: &mut Task, checkpoint: &Checkpoint) {
        let ordered = execution_order(task.hypotheses.as_deref().unwrap_or_default());
        if ordered.is_empty() {
            return;
        }

        match self.config.hypotheses.mode {
            HypothesisMode::Parallel => self.execute_parallel(task, ordered, checkpoint).await,
            HypothesisMode::Sequential => self.execute_sequential(task, ordered, checkpoint).await,
        }
    }

    async fn execute_parallel(&self, task: &mut Task, ordered: Vec<Hypothesis>, checkpoint: &Checkpoint) {
        let budget: Vec<Hypothesis> = ordered
            .into_iter()
            .take(self.config.hypotheses.max_hypotheses_to_execute)
            .collect();
        let query = task.query.clone();
        let task_id = task.id;

        let batches = join_all(budget.iter().map(|h| self.run_one(task_id, &query, h))).await;

        for (hypothesis, batch) in budget.iter().zip(batches) {
            self.absorb(task, hypothesis, batch, checkpoint).await;
        }
    }

    async fn execute_sequential(
        &self,
        task: &mut Task,
        ordered: Vec<Hypothesis>,
        checkpoint: &Checkpoint,
    ) {
        let max = self.config.hypotheses.max_hypotheses_to_execute;
        let time_budget = self.config.hypotheses.max_hypothesis_time();
        let started = Instant::now();
        let query = task.query.clone();

        for (i, hypothesis) in ordered.iter().enumerate() {
            if i >= max {
                tracing::info!(task_id = task.id, max, "Hypothesis count ceiling reached");
                break;
            }
            if started.elapsed() >= time_budget {
                tracing::info!(task_id = task.id, "Hypothesis time ceiling reached");
                break;
            }

            let left = time_budget.saturating_sub(started.elapsed());
            let batch = match tokio::time::timeout(left, self.run_one(task.id, &query, hypothesis)).await {
                Ok(batch) => batch,
                Err(_) => {
                    tracing::info!(
                        task_id = task.id,
                        hypothesis_id = %hypothesis.id,
                        "Hypothesis time ceiling reached mid-execution"
                    );
                    break;
                }
            };
            self.absorb(task, hypothesis, batch, checkpoint).await;

            let executed = i + 1;
            let remaining: Vec<Hypothesis> = ordered[executed..]
                .iter()
                .take(max.saturating_sub(executed))
                .cloned()
                .collect();
            let elapsed = started.elapsed();
            let facts = coverage_facts(&task.hypothesis_runs, remaining.len(), elapsed, time_budget);
            let ceilings_allow = !remaining.is_empty() && elapsed < time_budget;

            let request = CoverageRequest {
                task_query: &query,
                executed: &task.hypothesis_runs,
                remaining: &remaining,
                facts: &facts,
            };
            match self.decision.assess_coverage(&request).await {
                Ok(assessment) => {
                    let coverage = CoverageDecision {
                        decision: assessment.decision,
                        assessment: assessment.assessment,
                        gaps: assessment.gaps,
                        facts,
                    };
                    task.record_coverage(&coverage);
                    *checkpoint.lock() = task.clone();
                    self.tracer
                        .task(task.id, TraceEvent::CoverageAssessed { coverage: coverage.clone() })
                        .await;

                    if coverage.decision == Decision::Stop {
                        tracing::info!(
                            task_id = task.id,
                            executed,
                            "Coverage assessment says stop"
                        );
                        break;
                    }
                }
                Err(e) => {
                    let fallback = if ceilings_allow { "continue" } else { "stop" };
                    tracing::warn!(
                        task_id = task.id,
                        call_site = call_site::ASSESS_COVERAGE,
                        error = %e,
                        fallback,
                        "Coverage assessment failed"
                    );
                    self.fallback(task.id, call_site::ASSESS_COVERAGE, &e.to_string(), fallback)
                        .await;
                    if !ceilings_allow {
                        break;
                    }
                }
            }
        }
    }

    /// Query every targeted source for one hypothesis and filter for relevance.
    async fn run_one(&self, task_id: TaskId, task_query: &str, hypothesis: &Hypothesis) -> HypothesisBatch {
        let available = self.executor.available_sources();
        let mut targets: Vec<String> = Vec::new();
        for source in &hypothesis.strategy.target_sources {
            if available.contains(source) && !targets.contains(source) {
                targets.push(source.clone());
            }
        }
        if targets.is_empty() {
            targets = available;
        }

        let calls = targets.iter().map(|source| async move {
            let description = self.executor.description(source);
            let query = match self
                .decision
                .hypothesis_query(hypothesis, source, &description)
                .await
            {
                Ok(query) => query,
                Err(e) => {
                    tracing::warn!(
                        task_id,
                        hypothesis_id = %hypothesis.id,
                        source = %source,
                        error = %e,
                        "Hypothesis query generation failed, using the statement"
                    );
                    self.fallback(
                        task_id,
                        call_site::HYPOTHESIS_QUERY,
                        &e.to_string(),
                        "hypothesis statement as query",
                    )
                    .await;
                    hypothesis.statement.clone()
                }
            };
            let (report, results) = self.executor.search_one(task_id, source, &query, None).await;
            (source.clone(), query, report, results)
        });

        let mut queries = BTreeMap::new();
        let mut reports: Vec<SourceReport> = Vec::new();
        let mut raw: Vec<ResultRecord> = Vec::new();
        for (source, query, report, results) in join_all(calls).await {
            queries.insert(source, query);
            reports.push(report);
            raw.extend(results.into_iter().map(|mut r| {
                r.hypothesis_id = Some(hypothesis.id.clone());
                r.hypothesis_ids.clear();
                r
            }));
        }

        let raw_count = raw.len();
        let accepted = if raw.is_empty() {
            Vec::new()
        } else {
            self.judge(task_id, task_query, hypothesis, raw, &reports).await
        };

        HypothesisBatch {
            queries,
            raw_count,
            accepted,
        }
    }

    /// Relevance-filter one hypothesis batch. A failed judgment contributes nothing.
    async fn judge(
        &self,
        task_id: TaskId,
        task_query: &str,
        hypothesis: &Hypothesis,
        raw: Vec<ResultRecord>,
        reports: &[SourceReport],
    ) -> Vec<ResultRecord> {
        let request = RelevanceRequest {
            question: &self.question,
            task_query,
            current_query: &hypothesis.statement,
            results: &raw,
            source_reports: reports,
            retry_count: 0,
            max_retries: 0,
        };

        match self.decision.judge_relevance(&request).await {
            Ok(verdict) => {
                self.tracer
                    .task(
                        task_id,
                        TraceEvent::RelevanceVerdict {
                            retry: 0,
                            presented: raw.len(),
                            accepted: verdict.accepted_indices.len(),
                            decision: verdict.decision,
                            reformulated_query: None,
                            rationale: verdict.rationale.clone(),
                        },
                    )
                    .await;
                let accepted = take_accepted(raw, &verdict.accepted_indices);
                drop_future_dated(accepted, self.config.research.future_date_tolerance_days).0
            }
            Err(e) => {
                tracing::warn!(
                    task_id,
                    hypothesis_id = %hypothesis.id,
                    call_site = call_site::JUDGE_RELEVANCE,
                    error = %e,
                    "Relevance judgment failed, hypothesis contributes no results"
                );
                self.fallback(task_id, call_site::JUDGE_RELEVANCE, &e.to_string(), "batch discarded")
                    .await;
                Vec::new()
            }
        }
    }

    /// Merge a batch into the task's pool and record the run.
    async fn absorb(
        &self,
        task: &mut Task,
        hypothesis: &Hypothesis,
        batch: HypothesisBatch,
        checkpoint: &Checkpoint,
    ) -> DeltaMetrics {
        let entities = batch_entities(&batch.accepted, &hypothesis.strategy.expected_entities);
        let metrics = absorb_batch(task, batch.accepted, &entities);

        let run = HypothesisRun {
            hypothesis_id: hypothesis.id.clone(),
            statement: hypothesis.statement.clone(),
            queries: batch.queries,
            raw_result_count: batch.raw_count,
            metrics,
        };
        task.hypothesis_runs.push(run.clone());
        *checkpoint.lock() = task.clone();

        tracing::info!(
            task_id = task.id,
            hypothesis_id = %hypothesis.id,
            results_new = metrics.results_new,
            results_duplicate = metrics.results_duplicate,
            gain_pct = metrics.incremental_gain_pct(),
            "Hypothesis executed"
        );
        self.tracer
            .task(task.id, TraceEvent::HypothesisExecuted { run })
            .await;
        if metrics.results_new > 0 {
            self.tracer.snapshot(task).await;
        }

        metrics
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

/// Ascending exploration priority, ties by id.
pub fn execution_order(hypotheses: &[Hypothesis]) -> Vec<Hypothesis> {
    let mut ordered = hypotheses.to_vec();
    ordered.sort_by(|a, b| {
        a.exploration_priority
            .cmp(&b.exploration_priority)
            .then_with(|| a.id.cmp(&b.id))
    });
    ordered
}

/// Ground-truth facts for a coverage assessment, from the runs so far.
pub fn coverage_facts(
    runs: &[HypothesisRun],
    remaining: usize,
    elapsed: Duration,
    budget: Duration,
) -> CoverageFacts {
    CoverageFacts {
        results_new: runs.iter().map(|r| r.metrics.results_new).sum(),
        results_duplicate: runs.iter().map(|r| r.metrics.results_duplicate).sum(),
        latest_gain_pct: runs
            .last()
            .map(|r| r.metrics.incremental_gain_pct())
            .unwrap_or(0.0),
        entities_new: runs.iter().map(|r| r.metrics.entities_new).sum(),
        hypotheses_executed: runs.len(),
        hypotheses_remaining: remaining,
        elapsed_secs: elapsed.as_secs_f64(),
        remaining_secs: budget.saturating_sub(elapsed).as_secs_f64(),
    }
}

use crate::decision::{call_site, DecisionService, FollowUpRequest, SaturationDigest, TaskSpec};
use crate::research::attempt::SearchExecutor;
use crate::research::dedup::normalize;
use crate::research::hypothesis::HypothesisEngine;
use crate::research::prioritizer::{
    limited_ceiling, Prioritizer, SaturationAction, SaturationMonitor,
};
use crate::research::report::{ReportSynthesizer, ResearchReport, RunFailure, StopReason};
use crate::research::resources::{ResourceManager, TaskSummary};
use crate::research::runner::{checkpoint, Checkpoint, TaskRunner};
use crate::research::task::{FailureReason, Hypothesis, Task, TaskId, TaskStatus, ENTITY_ERROR_KEY};
use crate::research::trace::{TraceEvent, TraceSink, Tracer};
use crate::sources::SourceRegistry;
use crate::types::{AppError, Decision};
use crate::utils::toml_config::ArgusConfig;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};

/// Runs a research question end to end: decompose, work the task queue in
/// bounded concurrent batches, then synthesize the report.
pub struct ResearchCoordinator {
    config: Arc<ArgusConfig>,
    registry: Arc<SourceRegistry>,
    decision: Arc<dyn DecisionService>,
    synthesizer: Arc<dyn ReportSynthesizer>,
    sink: Arc<dyn TraceSink>,
}

impl ResearchCoordinator {
    pub fn new(
        config: Arc<ArgusConfig>,
        registry: Arc<SourceRegistry>,
        decision: Arc<dyn DecisionService>,
        synthesizer: Arc<dyn ReportSynthesizer>,
        sink: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            config,
            registry,
            decision,
            synthesizer,
            sink,
        }
    }

    /// Research `question` under a fresh run id.
    pub async fn research(&self, question: &str) -> Result<ResearchReport, RunFailure> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.research_with_id(&run_id, question).await
    }

    /// Research `question` under a caller-chosen run id, e.g. one a trace
    /// sink was already created for.
    pub async fn research_with_id(
        &self,
        run_id: &str,
        question: &str,
    ) -> Result<ResearchReport, RunFailure> {
        let mut run = Run::new(self, run_id, question);
        tracing::info!(run_id = %run_id, question = %question, "Starting research run");
        run.tracer
            .emit(
                None,
                TraceEvent::RunStarted {
                    question: question.to_string(),
                },
            )
            .await;

        if let Err(error) = run.seed().await {
            tracing::error!(run_id = %run_id, error = %error, "Decomposition failed, aborting run");
            return Err(run.abort(error).await);
        }

        let stop_reason = run.work_queue().await;
        run.finish(stop_reason, self.synthesizer.as_ref()).await
    }
}

// ============= Run State =============

/// Services and mutable state for one run. The queue, the task lists and
/// the ceiling are touched by this loop only.
struct Run {
    config: Arc<ArgusConfig>,
    decision: Arc<dyn DecisionService>,
    resources: Arc<ResourceManager>,
    hypotheses: Arc<HypothesisEngine>,
    runner: Arc<TaskRunner>,
    prioritizer: Prioritizer,
    monitor: SaturationMonitor,
    tracer: Tracer,
    run_id: String,
    question: String,
    started: Instant,
    started_at: DateTime<Utc>,
    pending: VecDeque<Task>,
    completed: Vec<Task>,
    failed: Vec<Task>,
    prior: Vec<Hypothesis>,
    next_id: TaskId,
    ceiling: usize,
}

impl Run {
    fn new(coordinator: &ResearchCoordinator, run_id: &str, question: &str) -> Self {
        let config = coordinator.config.clone();
        let decision = coordinator.decision.clone();
        let tracer = Tracer::new(run_id, coordinator.sink.clone());
        let resources = Arc::new(ResourceManager::from_config(&config));
        let executor = Arc::new(SearchExecutor::new(
            config.clone(),
            coordinator.registry.clone(),
            resources.clone(),
            decision.clone(),
            tracer.clone(),
        ));
        let hypotheses = Arc::new(HypothesisEngine::new(
            config.clone(),
            decision.clone(),
            executor.clone(),
            tracer.clone(),
            question,
        ));
        let runner = Arc::new(TaskRunner::new(
            config.clone(),
            decision.clone(),
            executor,
            hypotheses.clone(),
            resources.clone(),
            tracer.clone(),
            question,
        ));

        Self {
            prioritizer: Prioritizer::new(decision.clone(), tracer.clone()),
            monitor: SaturationMonitor::new(decision.clone(), tracer.clone(), &config.research),
            ceiling: config.research.max_tasks,
            config,
            decision,
            resources,
            hypotheses,
            runner,
            tracer,
            run_id: run_id.to_string(),
            question: question.to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            pending: VecDeque::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            prior: Vec::new(),
            next_id: 1,
        }
    }

    /// Decompose the question into the initial queue.
    async fn seed(&mut self) -> crate::types::Result<()> {
        let max_initial = self
            .config
            .research
            .max_initial_tasks
            .min(self.config.research.max_tasks);
        let specs = self.decision.decompose(&self.question, max_initial).await?;
        tracing::info!(run_id = %self.run_id, tasks = specs.len(), "Question decomposed");

        let tasks = self.create_tasks(specs, None).await;
        self.pending.extend(tasks);
        Ok(())
    }

    /// Turn specs into tasks, with hypotheses when branching is enabled.
    async fn create_tasks(&mut self, specs: Vec<TaskSpec>, parent: Option<TaskId>) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = self.next_id;
            self.next_id += 1;
            let mut task = match parent {
                Some(parent) => Task::follow_up(id, parent, spec.query, spec.rationale),
                None => Task::new(id, spec.query, spec.rationale),
            };

            if self.hypotheses.enabled() {
                let generated = self.hypotheses.generate(&task, &self.prior).await;
                if !generated.is_empty() {
                    self.prior.extend(generated.iter().cloned());
                    task.hypotheses = Some(generated);
                }
            }
            tasks.push(task);
        }

        if !tasks.is_empty() {
            self.tracer
                .emit(
                    parent,
                    TraceEvent::TasksCreated {
                        task_ids: tasks.iter().map(|t| t.id).collect(),
                        parent_id: parent,
                    },
                )
                .await;
        }
        tasks
    }

    /// The top-level loop. Returns why it stopped.
    async fn work_queue(&mut self) -> StopReason {
        let budget = self.config.research.run_budget();

        loop {
            if self.pending.is_empty() {
                return StopReason::QueueExhausted;
            }
            if self.completed.len() >= self.ceiling {
                return StopReason::TaskCeiling;
            }
            if self.started.elapsed() >= budget {
                return StopReason::Budget;
            }

            if self.monitor.is_due(self.completed.len()) {
                if let Some(confidence) = self.check_saturation().await {
                    return StopReason::Saturated { confidence };
                }
                if self.completed.len() >= self.ceiling {
                    return StopReason::TaskCeiling;
                }
            }

            // Failures do not count, so every task in flight may still complete
            let room = self.ceiling - self.completed.len();
            let size = self.config.research.max_concurrent_tasks.min(room);
            let batch: Vec<Task> = (0..size).filter_map(|_| self.pending.pop_front()).collect();
            tracing::info!(
                run_id = %self.run_id,
                batch = ?batch.iter().map(|t| t.id).collect::<Vec<_>>(),
                pending = self.pending.len(),
                "Running task batch"
            );

            let finished = self.run_batch(batch).await;
            let mut newly_completed = Vec::new();
            for task in finished {
                match task.status {
                    TaskStatus::Completed => newly_completed.push(task),
                    _ => {
                        self.record_failure(&task).await;
                        self.failed.push(task);
                    }
                }
            }

            let first_new = self.completed.len();
            for mut task in newly_completed {
                self.extract_entities(&mut task).await;
                self.tracer
                    .task(
                        task.id,
                        TraceEvent::TaskCompleted {
                            result_count: task.accumulated_results().len(),
                            entity_count: task.entities.len(),
                            retry_count: task.retry_count,
                        },
                    )
                    .await;
                self.completed.push(task);
            }
            for index in first_new..self.completed.len() {
                let parent = self.completed[index].clone();
                self.spawn_follow_ups(&parent).await;
            }

            if self.config.research.reprioritize_after_batch && !self.pending.is_empty() {
                let summaries = self.resources.summaries();
                self.prioritizer.prioritize(&mut self.pending, &summaries).await;
            }
        }
    }

    /// Run a batch concurrently, each task under one timeout covering all
    /// of its retries. A task that times out or panics is recovered from its
    /// checkpoint and failed. Finished tasks come back in batch order.
    async fn run_batch(&self, batch: Vec<Task>) -> Vec<Task> {
        let timeout = self.config.research.task_timeout();
        let mut set = JoinSet::new();
        let mut slots: HashMap<tokio::task::Id, (usize, Checkpoint)> = HashMap::new();

        for (index, task) in batch.into_iter().enumerate() {
            let cp = checkpoint(&task);
            let runner = self.runner.clone();
            let run_cp = cp.clone();
            let handle = set.spawn(async move {
                tokio::time::timeout(timeout, runner.run(task, run_cp)).await
            });
            slots.insert(handle.id(), (index, cp));
        }

        let mut finished: Vec<(usize, Task)> = Vec::with_capacity(slots.len());
        while let Some(joined) = set.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome.map_err(|_| FailureReason::Timeout)),
                Err(e) => (e.id(), Err(FailureReason::Error(join_error_message(e)))),
            };
            let Some((index, cp)) = slots.remove(&id) else {
                continue;
            };

            let task = match outcome {
                Ok(task) => task,
                Err(reason) => {
                    let mut task = cp.lock().clone();
                    match &reason {
                        FailureReason::Timeout => tracing::warn!(
                            run_id = %self.run_id,
                            task_id = task.id,
                            timeout_secs = timeout.as_secs(),
                            partial_results = task.accumulated_results().len(),
                            "Task timed out"
                        ),
                        other => tracing::error!(
                            run_id = %self.run_id,
                            task_id = task.id,
                            reason = %other,
                            partial_results = task.accumulated_results().len(),
                            "Task aborted"
                        ),
                    }
                    task.fail(reason);
                    self.resources.record_summary(TaskSummary::from_task(&task));
                    task
                }
            };
            finished.push((index, task));
        }

        finished.sort_by_key(|(index, _)| *index);
        finished.into_iter().map(|(_, task)| task).collect()
    }

    /// Flush partial results and trace the failure.
    async fn record_failure(&self, task: &Task) {
        self.tracer.snapshot(task).await;
        let reason = task
            .failure
            .clone()
            .unwrap_or_else(|| FailureReason::Error("unknown".to_string()));
        self.tracer
            .task(
                task.id,
                TraceEvent::TaskFailed {
                    reason,
                    result_count: task.accumulated_results().len(),
                },
            )
            .await;
    }

    /// Best effort; never demotes a completed task.
    async fn extract_entities(&self, task: &mut Task) {
        match self
            .decision
            .extract_entities(&task.query, task.accumulated_results())
            .await
        {
            Ok(names) => {
                // Hypothesis runs may already have found some
                task.entities.extend(
                    names
                        .iter()
                        .map(|n| normalize(n))
                        .filter(|n| !n.is_empty()),
                );
                self.resources.record_entities(&task.entities);
            }
            Err(e) => {
                tracing::warn!(
                    task_id = task.id,
                    call_site = call_site::EXTRACT_ENTITIES,
                    error = %e,
                    "Entity extraction failed, task keeps no entities"
                );
                self.tracer
                    .task(
                        task.id,
                        TraceEvent::DecisionFallback {
                            call_site: call_site::EXTRACT_ENTITIES.to_string(),
                            error: e.to_string(),
                            fallback: "no entities".to_string(),
                        },
                    )
                    .await;
                task.entities.clear();
                task.metadata
                    .insert(ENTITY_ERROR_KEY.to_string(), Value::String(e.to_string()));
            }
        }
        self.resources.record_summary(TaskSummary::from_task(task));
    }

    async fn spawn_follow_ups(&mut self, parent: &Task) {
        if !wants_follow_ups(parent) {
            return;
        }
        let allowance = follow_up_allowance(
            self.ceiling,
            self.completed.len(),
            self.pending.len(),
            self.config.research.max_follow_ups_per_task,
        );
        if allowance == 0 {
            return;
        }

        let gaps = parent.latest_coverage().map(|c| c.gaps).unwrap_or_default();
        let request = FollowUpRequest {
            question: &self.question,
            task: parent,
            gaps: &gaps,
            max_follow_ups: allowance,
        };
        let mut specs = match self.decision.generate_follow_ups(&request).await {
            Ok(specs) => specs,
            Err(e) => {
                tracing::warn!(
                    task_id = parent.id,
                    call_site = call_site::GENERATE_FOLLOW_UPS,
                    error = %e,
                    "Follow-up generation failed, none spawned"
                );
                self.tracer
                    .task(
                        parent.id,
                        TraceEvent::DecisionFallback {
                            call_site: call_site::GENERATE_FOLLOW_UPS.to_string(),
                            error: e.to_string(),
                            fallback: "no follow-ups".to_string(),
                        },
                    )
                    .await;
                return;
            }
        };
        specs.truncate(allowance);
        if specs.is_empty() {
            return;
        }

        tracing::info!(task_id = parent.id, count = specs.len(), "Spawning follow-up tasks");
        let tasks = self.create_tasks(specs, Some(parent.id)).await;
        self.pending.extend(tasks);
    }

    /// Returns the confidence when the run should stop.
    async fn check_saturation(&mut self) -> Option<u8> {
        let completed: Vec<TaskSummary> = self
            .resources
            .summaries()
            .into_iter()
            .filter(|s| s.status == TaskStatus::Completed)
            .collect();
        let digest = SaturationDigest {
            question: self.question.clone(),
            total_results: self
                .completed
                .iter()
                .map(|t| t.accumulated_results().len())
                .sum(),
            total_entities: self.resources.entity_graph().len(),
            pending: self.pending.iter().map(|t| (t.id, t.query.clone())).collect(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            completed,
        };

        let assessment = self.monitor.check(&digest).await;
        let action = self.monitor.action(&assessment);
        if let SaturationAction::Limit { additional } = action {
            let limited = limited_ceiling(self.ceiling, self.completed.len(), additional);
            if limited != self.ceiling {
                tracing::info!(from = self.ceiling, to = limited, "Task ceiling reduced");
            }
            self.ceiling = limited;
        }

        tracing::info!(
            completed = self.completed.len(),
            saturated = assessment.saturated,
            confidence = assessment.confidence,
            recommendation = ?assessment.recommendation,
            "Saturation checked"
        );
        self.tracer
            .emit(
                None,
                TraceEvent::SaturationChecked {
                    completed: self.completed.len(),
                    saturated: assessment.saturated,
                    confidence: assessment.confidence,
                    recommendation: assessment.recommendation,
                    task_ceiling: self.ceiling,
                },
            )
            .await;

        match action {
            SaturationAction::Stop { confidence } => Some(confidence),
            _ => None,
        }
    }

    fn assemble(&self, stop_reason: StopReason) -> ResearchReport {
        ResearchReport::assemble(
            &self.run_id,
            &self.question,
            self.started_at,
            &self.completed,
            &self.failed,
            self.resources.entity_graph(),
            stop_reason,
            self.started.elapsed().as_secs_f64(),
        )
    }

    async fn trace_finish(&self, stop_reason: StopReason) {
        self.tracer
            .emit(
                None,
                TraceEvent::RunFinished {
                    stop_reason,
                    completed: self.completed.len(),
                    failed: self.failed.len(),
                },
            )
            .await;
    }

    async fn abort(&self, error: AppError) -> RunFailure {
        self.trace_finish(StopReason::Aborted).await;
        RunFailure {
            error,
            partial: Box::new(self.assemble(StopReason::Aborted)),
        }
    }

    async fn finish(
        &self,
        stop_reason: StopReason,
        synthesizer: &dyn ReportSynthesizer,
    ) -> Result<ResearchReport, RunFailure> {
        tracing::info!(
            run_id = %self.run_id,
            stop_reason = %stop_reason,
            completed = self.completed.len(),
            failed = self.failed.len(),
            "Research loop finished"
        );
        self.trace_finish(stop_reason).await;

        let mut report = self.assemble(stop_reason);
        match synthesizer.synthesize(&report).await {
            Ok(text) => {
                report.report_text = text;
                Ok(report)
            }
            Err(error) => {
                tracing::error!(run_id = %self.run_id, error = %error, "Report synthesis failed");
                Err(RunFailure {
                    error,
                    partial: Box::new(report),
                })
            }
        }
    }
}

/// Panic payload or cancellation cause of a task that did not finish.
fn join_error_message(error: JoinError) -> String {
    if !error.is_panic() {
        return format!("task cancelled: {}", error);
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", message)
    } else {
        "task panicked".to_string()
    }
}

/// No coverage assessment, or the latest one wanted more or named gaps.
fn wants_follow_ups(task: &Task) -> bool {
    match task.latest_coverage() {
        None => true,
        Some(coverage) => coverage.decision == Decision::Continue || !coverage.gaps.is_empty(),
    }
}

/// Largest `n` with `completed + queued + n < ceiling`, capped per task.
fn follow_up_allowance(ceiling: usize, completed: usize, queued: usize, per_task: usize) -> usize {
    ceiling
        .saturating_sub(completed + queued)
        .saturating_sub(1)
        .min(per_task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::stub::StubDecision;
    use crate::research::report::MockReportSynthesizer;
    use crate::research::task::{CoverageDecision, CoverageFacts};
    use crate::research::trace::MemoryTraceSink;

    fn coverage(decision: Decision, gaps: &[&str]) -> CoverageDecision {
        CoverageDecision {
            decision,
            assessment: String::new(),
            gaps: gaps.iter().map(|g| g.to_string()).collect(),
            facts: CoverageFacts::default(),
        }
    }

    #[test]
    fn test_follow_up_allowance_keeps_strictly_under_ceiling() {
        assert_eq!(follow_up_allowance(12, 3, 2, 2), 2);
        assert_eq!(follow_up_allowance(6, 3, 1, 5), 1);
        assert_eq!(follow_up_allowance(6, 3, 2, 5), 0);
        assert_eq!(follow_up_allowance(4, 5, 0, 2), 0);
    }

    #[test]
    fn test_wants_follow_ups_follows_latest_coverage() {
        let mut task = Task::new(1, "q", "r");
        assert!(wants_follow_ups(&task));

        task.record_coverage(&coverage(Decision::Stop, &[]));
        assert!(!wants_follow_ups(&task));

        task.record_coverage(&coverage(Decision::Stop, &["pricing"]));
        assert!(wants_follow_ups(&task));

        task.record_coverage(&coverage(Decision::Continue, &[]));
        assert!(wants_follow_ups(&task));
    }

    #[tokio::test]
    async fn test_decomposition_failure_aborts_with_partial_report() {
        let sink = Arc::new(MemoryTraceSink::new());
        let mut synthesizer = MockReportSynthesizer::new();
        synthesizer.expect_synthesize().never();

        let coordinator = ResearchCoordinator::new(
            Arc::new(ArgusConfig::default()),
            Arc::new(SourceRegistry::new()),
            Arc::new(StubDecision::default()),
            Arc::new(synthesizer),
            sink.clone(),
        );

        let failure = coordinator
            .research_with_id("run-1", "who builds it?")
            .await
            .expect_err("decomposition cannot succeed");

        assert!(matches!(failure.error, AppError::Decision { .. }));
        assert_eq!(failure.partial.stop_reason, StopReason::Aborted);
        assert_eq!(failure.partial.question, "who builds it?");
        assert!(failure.partial.tasks.is_empty());

        let entries = sink.entries();
        assert!(matches!(
            entries.last().map(|e| &e.event),
            Some(TraceEvent::RunFinished {
                stop_reason: StopReason::Aborted,
                ..
            })
        ));
    }
}

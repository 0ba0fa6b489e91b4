//! Queue prioritization and the saturation monitor.

use crate::decision::{
    call_site, DecisionService, SaturationAssessment, SaturationDigest, SaturationRecommendation,
};
use crate::research::resources::TaskSummary;
use crate::research::task::{Task, PRIORITY_HIGHEST};
use crate::research::trace::{TraceEvent, Tracer};
use crate::utils::toml_config::ResearchConfig;
use std::collections::VecDeque;
use std::sync::Arc;

// ============= Prioritizer =============

pub struct Prioritizer {
    decision: Arc<dyn DecisionService>,
    tracer: Tracer,
}

impl Prioritizer {
    pub fn new(decision: Arc<dyn DecisionService>, tracer: Tracer) -> Self {
        Self { decision, tracer }
    }

    /// Re-score and re-sort the pending queue: priority ascending, ties by id.
    ///
    /// A single pending task gets top priority without a service call. On
    /// failure the queue falls back to submission (id) order.
    pub async fn prioritize(&self, pending: &mut VecDeque<Task>, completed: &[TaskSummary]) {
        match pending.len() {
            0 => return,
            1 => {
                if let Some(task) = pending.front_mut() {
                    task.priority = PRIORITY_HIGHEST;
                    task.priority_rationale = Some("only pending task".to_string());
                }
                return;
            }
            _ => {}
        }

        let snapshot: Vec<Task> = pending.iter().cloned().collect();
        match self.decision.prioritize(&snapshot, completed).await {
            Ok(assignments) => {
                for assignment in assignments {
                    if let Some(task) = pending.iter_mut().find(|t| t.id == assignment.task_id) {
                        task.priority = assignment.priority;
                        task.estimated_value = Some(assignment.estimated_value);
                        task.estimated_redundancy = Some(assignment.estimated_redundancy);
                        task.priority_rationale = Some(assignment.rationale);
                    }
                }
                pending
                    .make_contiguous()
                    .sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
            }
            Err(e) => {
                tracing::warn!(
                    call_site = call_site::PRIORITIZE,
                    error = %e,
                    "Prioritization failed, using submission order"
                );
                self.tracer
                    .emit(
                        None,
                        TraceEvent::DecisionFallback {
                            call_site: call_site::PRIORITIZE.to_string(),
                            error: e.to_string(),
                            fallback: "submission order".to_string(),
                        },
                    )
                    .await;
                pending.make_contiguous().sort_by_key(|t| t.id);
            }
        }

        let order: Vec<_> = pending.iter().map(|t| t.id).collect();
        tracing::debug!(order = ?order, "Pending queue reprioritized");
        self.tracer.emit(None, TraceEvent::Reprioritized { order }).await;
    }
}

// ============= Saturation Monitor =============

/// What the coordinator should do after a saturation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaturationAction {
    Stop { confidence: u8 },
    /// Allow at most this many more tasks
    Limit { additional: usize },
    Continue,
}

pub struct SaturationMonitor {
    decision: Arc<dyn DecisionService>,
    tracer: Tracer,
    interval: usize,
    min_completed: usize,
    threshold: u8,
    last_checked_at: Option<usize>,
}

impl SaturationMonitor {
    pub fn new(decision: Arc<dyn DecisionService>, tracer: Tracer, config: &ResearchConfig) -> Self {
        Self {
            decision,
            tracer,
            interval: config.saturation_check_interval,
            min_completed: config.saturation_min_completed,
            threshold: config.saturation_confidence_threshold,
            last_checked_at: None,
        }
    }

    /// First at `min_completed` completions, then every `interval` more.
    pub fn is_due(&self, completed: usize) -> bool {
        match self.last_checked_at {
            None => completed >= self.min_completed,
            Some(last) => completed >= self.min_completed && completed >= last + self.interval,
        }
    }

    /// Ask the service; failures count as "not saturated".
    pub async fn check(&mut self, digest: &SaturationDigest) -> SaturationAssessment {
        self.last_checked_at = Some(digest.completed.len());

        match self.decision.assess_saturation(digest).await {
            Ok(assessment) => assessment,
            Err(e) => {
                tracing::warn!(
                    call_site = call_site::ASSESS_SATURATION,
                    error = %e,
                    "Saturation check failed, assuming not saturated"
                );
                self.tracer
                    .emit(
                        None,
                        TraceEvent::DecisionFallback {
                            call_site: call_site::ASSESS_SATURATION.to_string(),
                            error: e.to_string(),
                            fallback: "not saturated".to_string(),
                        },
                    )
                    .await;
                SaturationAssessment::not_saturated(format!("assessment unavailable: {}", e))
            }
        }
    }

    /// Early stop needs `saturated` and confidence at or above the threshold.
    pub fn action(&self, assessment: &SaturationAssessment) -> SaturationAction {
        if assessment.saturated && assessment.confidence >= self.threshold {
            return SaturationAction::Stop {
                confidence: assessment.confidence,
            };
        }
        match (assessment.recommendation, assessment.recommended_additional_tasks) {
            (SaturationRecommendation::ContinueLimited, Some(additional)) => {
                SaturationAction::Limit { additional }
            }
            _ => SaturationAction::Continue,
        }
    }
}

/// Shrink (never grow) the ceiling, never below `floor`.
pub fn limited_ceiling(ceiling: usize, floor: usize, additional: usize) -> usize {
    ceiling.min(floor + additional).max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::stub::StubDecision;
    use crate::research::trace::MemoryTraceSink;

    fn assessment(
        saturated: bool,
        confidence: u8,
        recommendation: SaturationRecommendation,
        additional: Option<usize>,
    ) -> SaturationAssessment {
        SaturationAssessment {
            saturated,
            confidence,
            rationale: String::new(),
            recommendation,
            recommended_additional_tasks: additional,
        }
    }

    #[test]
    fn test_limited_ceiling_only_shrinks() {
        assert_eq!(limited_ceiling(12, 4, 3), 7);
        assert_eq!(limited_ceiling(6, 4, 10), 6);
        assert_eq!(limited_ceiling(12, 4, 0), 4);
        assert_eq!(limited_ceiling(3, 5, 0), 5);
    }

    #[test]
    fn test_action_thresholds() {
        let tracer = Tracer::new("t", Arc::new(MemoryTraceSink::new()));
        let config = ResearchConfig::default();
        let monitor = SaturationMonitor::new(Arc::new(StubDecision::default()), tracer, &config);

        let high = assessment(true, 85, SaturationRecommendation::Stop, None);
        assert_eq!(monitor.action(&high), SaturationAction::Stop { confidence: 85 });

        let low = assessment(true, 60, SaturationRecommendation::Stop, None);
        assert_eq!(monitor.action(&low), SaturationAction::Continue);

        let limited = assessment(false, 30, SaturationRecommendation::ContinueLimited, Some(2));
        assert_eq!(monitor.action(&limited), SaturationAction::Limit { additional: 2 });

        let unsized_limit = assessment(false, 30, SaturationRecommendation::ContinueLimited, None);
        assert_eq!(monitor.action(&unsized_limit), SaturationAction::Continue);
    }

    #[test]
    fn test_is_due_schedule() {
        let tracer = Tracer::new("t", Arc::new(MemoryTraceSink::new()));
        let config = ResearchConfig {
            saturation_check_interval: 2,
            ..Default::default()
        };
        let mut monitor = SaturationMonitor::new(Arc::new(StubDecision::default()), tracer, &config);

        assert!(!monitor.is_due(0));
        assert!(!monitor.is_due(2));
        assert!(monitor.is_due(3));
        monitor.last_checked_at = Some(3);
        assert!(!monitor.is_due(4));
        assert!(monitor.is_due(5));
    }

    #[test]
    fn test_first_check_at_minimum_even_with_long_interval() {
        let tracer = Tracer::new("t", Arc::new(MemoryTraceSink::new()));
        let config = ResearchConfig {
            saturation_check_interval: 5,
            ..Default::default()
        };
        let mut monitor = SaturationMonitor::new(Arc::new(StubDecision::default()), tracer, &config);

        assert!(!monitor.is_due(2));
        assert!(monitor.is_due(3));
        monitor.last_checked_at = Some(3);
        assert!(!monitor.is_due(7));
        assert!(monitor.is_due(8));
    }

    #[tokio::test]
    async fn test_single_pending_task_needs_no_call() {
        let tracer = Tracer::new("t", Arc::new(MemoryTraceSink::new()));
        let decision = Arc::new(StubDecision::default());
        let prioritizer = Prioritizer::new(decision.clone(), tracer);

        let mut pending = VecDeque::from(vec![Task::new(4, "q", "r")]);
        prioritizer.prioritize(&mut pending, &[]).await;
        assert_eq!(pending[0].priority, PRIORITY_HIGHEST);
        assert_eq!(decision.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_prioritization_uses_submission_order() {
        let tracer = Tracer::new("t", Arc::new(MemoryTraceSink::new()));
        let decision = Arc::new(StubDecision::default());
        let prioritizer = Prioritizer::new(decision.clone(), tracer);

        let mut pending = VecDeque::from(vec![
            Task::new(9, "c", "r"),
            Task::new(2, "a", "r"),
            Task::new(5, "b", "r"),
        ]);
        prioritizer.prioritize(&mut pending, &[]).await;

        let ids: Vec<_> = pending.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(decision.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_saturation_check_is_not_saturated() {
        let tracer = Tracer::new("t", Arc::new(MemoryTraceSink::new()));
        let mut monitor =
            SaturationMonitor::new(Arc::new(StubDecision::default()), tracer, &ResearchConfig::default());

        let assessment = monitor.check(&SaturationDigest::default()).await;
        assert!(!assessment.saturated);
        assert_eq!(monitor.action(&assessment), SaturationAction::Continue);
    }
}

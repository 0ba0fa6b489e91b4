//! Shared resources for concurrently running tasks.
//!
//! Three independent exclusive locks live here:
//! - a per-source [`RateGate`] for strictly rate-limited sources, held across
//!   the wait *and* the call so the spacing holds under concurrency
//! - the entity graph lock
//! - the results table lock (task id -> [`TaskSummary`])
//!
//! plus the process-wide [`CircuitBreaker`].

use crate::research::entity_graph::EntityGraph;
use crate::research::task::{FailureReason, Task, TaskId, TaskStatus};
use crate::utils::toml_config::ArgusConfig;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant};

// ============= Rate Gate =============

/// Enforces a minimum start-to-start interval between calls to one source.
pub struct RateGate {
    min_interval: Duration,
    last_call: tokio::sync::Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: tokio::sync::Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait out the interval, then run `call` while still holding the gate.
    pub async fn run<F, Fut, T>(&self, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
        call().await
    }
}

// ============= Circuit Breaker =============

/// What the breaker did with a throttling report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerVerdict {
    /// Source is critical; the caller should keep retrying it
    Critical,
    /// Source was just added to the set
    Tripped,
    /// Source was already in the set
    AlreadyTripped,
}

/// Run-wide set of sources excluded after reporting throttling.
///
/// Sources are never removed mid-run. Critical sources are never added.
pub struct CircuitBreaker {
    tripped: RwLock<BTreeSet<String>>,
    critical: HashSet<String>,
}

impl CircuitBreaker {
    pub fn new<I, S>(critical: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tripped: RwLock::new(BTreeSet::new()),
            critical: critical.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_critical(&self, source: &str) -> bool {
        self.critical.contains(source)
    }

    pub fn is_tripped(&self, source: &str) -> bool {
        self.tripped.read().contains(source)
    }

    pub fn report_rate_limited(&self, source: &str) -> BreakerVerdict {
        if self.is_critical(source) {
            return BreakerVerdict::Critical;
        }
        if self.tripped.write().insert(source.to_string()) {
            tracing::warn!(source = %source, "Circuit breaker tripped; source excluded for the rest of the run");
            BreakerVerdict::Tripped
        } else {
            BreakerVerdict::AlreadyTripped
        }
    }

    pub fn tripped_sources(&self) -> Vec<String> {
        self.tripped.read().iter().cloned().collect()
    }
}

// ============= Results Table =============

/// Per-task outcome digest written by task runners, read by the prioritizer,
/// the saturation monitor and the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub query: String,
    pub status: TaskStatus,
    pub parent_id: Option<TaskId>,
    pub retry_count: u32,
    pub result_count: usize,
    pub entity_count: usize,
    pub hypotheses_executed: usize,
    /// Gaps named by the latest coverage assessment
    #[serde(default)]
    pub gaps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl TaskSummary {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            query: task.query.clone(),
            status: task.status,
            parent_id: task.parent_id,
            retry_count: task.retry_count,
            result_count: task.accumulated_results().len(),
            entity_count: task.entities.len(),
            hypotheses_executed: task.hypothesis_runs.len(),
            gaps: task.latest_coverage().map(|c| c.gaps).unwrap_or_default(),
            failure: task.failure.clone(),
        }
    }
}

// ============= Resource Manager =============

pub struct ResourceManager {
    gates: HashMap<String, RateGate>,
    breaker: CircuitBreaker,
    entity_graph: Mutex<EntityGraph>,
    results: Mutex<BTreeMap<TaskId, TaskSummary>>,
}

impl ResourceManager {
    /// `strict` maps source id to its minimum inter-request interval.
    pub fn new<C, S>(strict: HashMap<String, Duration>, critical: C) -> Self
    where
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let gates = strict
            .into_iter()
            .map(|(name, interval)| (name, RateGate::new(interval)))
            .collect();
        Self {
            gates,
            breaker: CircuitBreaker::new(critical),
            entity_graph: Mutex::new(EntityGraph::new()),
            results: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &ArgusConfig) -> Self {
        Self::new(config.strict_sources(), config.critical_sources())
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn is_strict(&self, source: &str) -> bool {
        self.gates.contains_key(source)
    }

    /// Run a source call, through its rate gate when the source is strict.
    pub async fn call_source<F, Fut, T>(&self, source: &str, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.gates.get(source) {
            Some(gate) => gate.run(call).await,
            None => call().await,
        }
    }

    /// Record co-occurrence for one task's extracted entities.
    pub fn record_entities(&self, entities: &BTreeSet<String>) {
        self.entity_graph.lock().record_cooccurrence(entities);
    }

    pub fn entity_graph(&self) -> EntityGraph {
        self.entity_graph.lock().clone()
    }

    pub fn record_summary(&self, summary: TaskSummary) {
        self.results.lock().insert(summary.task_id, summary);
    }

    pub fn summary(&self, task_id: TaskId) -> Option<TaskSummary> {
        self.results.lock().get(&task_id).cloned()
    }

    /// All summaries ordered by task id
    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.results.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::task::ResultRecord;
    use std::sync::Arc;

    #[test]
    fn test_critical_source_never_tripped() {
        let breaker = CircuitBreaker::new(["registry"]);

        for _ in 0..10 {
            assert_eq!(breaker.report_rate_limited("registry"), BreakerVerdict::Critical);
        }
        assert!(!breaker.is_tripped("registry"));
        assert!(breaker.tripped_sources().is_empty());
    }

    #[test]
    fn test_non_critical_source_stays_tripped() {
        let breaker = CircuitBreaker::new(Vec::<String>::new());

        assert_eq!(breaker.report_rate_limited("jobs"), BreakerVerdict::Tripped);
        assert_eq!(breaker.report_rate_limited("jobs"), BreakerVerdict::AlreadyTripped);
        assert!(breaker.is_tripped("jobs"));
        assert!(!breaker.is_tripped("web"));
        assert_eq!(breaker.tripped_sources(), vec!["jobs"]);
    }

    #[tokio::test]
    async fn test_rate_gate_spaces_concurrent_calls() {
        let interval = Duration::from_millis(40);
        let gate = Arc::new(RateGate::new(interval));
        let starts = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..3).map(|_| {
            let gate = gate.clone();
            let starts = starts.clone();
            async move {
                gate.run(move || async move {
                    starts.lock().push(Instant::now());
                })
                .await
            }
        });
        futures::future::join_all(calls).await;

        let mut starts = starts.lock().clone();
        starts.sort();
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(35));
        }
    }

    #[tokio::test]
    async fn test_unconstrained_source_bypasses_gate() {
        let manager = ResourceManager::new(
            HashMap::from([("registry".to_string(), Duration::from_millis(500))]),
            Vec::<String>::new(),
        );
        assert!(manager.is_strict("registry"));
        assert!(!manager.is_strict("web"));

        let started = Instant::now();
        for _ in 0..3 {
            manager.call_source("web", || async {}).await;
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_results_table_and_entity_graph() {
        let manager = ResourceManager::new(HashMap::new(), Vec::<String>::new());

        let mut task = Task::new(7, "rust jobs", "baseline");
        task.append_results(vec![ResultRecord::new("a", "https://x/a", "", "web")]);
        task.entities.insert("acme".to_string());
        task.complete();
        manager.record_summary(TaskSummary::from_task(&task));

        let summary = manager.summary(7).unwrap();
        assert_eq!(summary.result_count, 1);
        assert_eq!(summary.entity_count, 1);
        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(manager.summaries().len(), 1);

        manager.record_entities(&BTreeSet::from(["Acme".to_string(), "Globex".to_string()]));
        let graph = manager.entity_graph();
        assert!(graph.neighbours("acme").unwrap().contains("globex"));
    }

    #[test]
    fn test_from_config() {
        let config = ArgusConfig::from_toml_str(
            "[sources.registry]\nmin_interval_ms = 1000\ncritical = true\n",
        )
        .unwrap();
        let manager = ResourceManager::from_config(&config);
        assert!(manager.is_strict("registry"));
        assert!(manager.breaker().is_critical("registry"));
    }
}

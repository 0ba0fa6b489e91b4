//! Execution trace: append-only structured entries keyed by run and task id,
//! plus snapshots of a task's accumulated results.
//!
//! Layout written by [`JsonlTraceSink`]:
//!
//! ```text
//! <output_dir>/<run_id>/trace.jsonl      one TraceEntry per line
//! <output_dir>/<run_id>/task_<id>.json   latest snapshot for that task
//! ```

use crate::decision::SaturationRecommendation;
use crate::research::report::StopReason;
use crate::research::task::{
    CoverageDecision, FailureReason, HypothesisRun, ResultRecord, Task, TaskId,
};
use crate::types::{AppError, Decision, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub const TRACE_FILE: &str = "trace.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    RunStarted {
        question: String,
    },
    TasksCreated {
        task_ids: Vec<TaskId>,
        parent_id: Option<TaskId>,
    },
    SourceCall {
        source: String,
        query: String,
        success: bool,
        result_count: usize,
        error: Option<String>,
        rate_limited: bool,
    },
    SourceExcluded {
        source: String,
    },
    RelevanceVerdict {
        retry: u32,
        presented: usize,
        accepted: usize,
        decision: Decision,
        reformulated_query: Option<String>,
        rationale: String,
    },
    Reformulation {
        retry: u32,
        from: String,
        to: String,
    },
    HypothesesGenerated {
        hypothesis_ids: Vec<String>,
    },
    HypothesisExecuted {
        run: HypothesisRun,
    },
    CoverageAssessed {
        coverage: CoverageDecision,
    },
    TaskCompleted {
        result_count: usize,
        entity_count: usize,
        retry_count: u32,
    },
    TaskFailed {
        reason: FailureReason,
        result_count: usize,
    },
    Reprioritized {
        order: Vec<TaskId>,
    },
    SaturationChecked {
        completed: usize,
        saturated: bool,
        confidence: u8,
        recommendation: SaturationRecommendation,
        task_ceiling: usize,
    },
    DecisionFallback {
        call_site: String,
        error: String,
        fallback: String,
    },
    RunFinished {
        stop_reason: StopReason,
        completed: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(flatten)]
    pub event: TraceEvent,
}

/// Write-only persistence collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn record(&self, entry: TraceEntry) -> Result<()>;

    /// Replace the stored snapshot of a task's accumulated results
    async fn snapshot(&self, task_id: TaskId, results: &[ResultRecord]) -> Result<()>;
}

/// Run-scoped handle that stamps entries and swallows sink failures.
///
/// A trace write failing never fails a task; it is logged and dropped.
#[derive(Clone)]
pub struct Tracer {
    run_id: String,
    sink: Arc<dyn TraceSink>,
}

impl Tracer {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            run_id: run_id.into(),
            sink,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn emit(&self, task_id: Option<TaskId>, event: TraceEvent) {
        let entry = TraceEntry {
            timestamp: Utc::now(),
            run_id: self.run_id.clone(),
            task_id,
            event,
        };
        if let Err(e) = self.sink.record(entry).await {
            tracing::warn!(run_id = %self.run_id, error = %e, "Failed to write trace entry");
        }
    }

    pub async fn task(&self, task_id: TaskId, event: TraceEvent) {
        self.emit(Some(task_id), event).await;
    }

    pub async fn snapshot(&self, task: &Task) {
        if let Err(e) = self.sink.snapshot(task.id, task.accumulated_results()).await {
            tracing::error!(
                run_id = %self.run_id,
                task_id = task.id,
                error = %e,
                "Failed to persist task snapshot"
            );
        }
    }
}

// ============= JSONL Sink =============

#[derive(Serialize)]
struct Snapshot<'a> {
    task_id: TaskId,
    written_at: DateTime<Utc>,
    result_count: usize,
    results: &'a [ResultRecord],
}

pub struct JsonlTraceSink {
    dir: PathBuf,
    log: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlTraceSink {
    /// Create `<root>/<run_id>/` and open its trace log for appending.
    pub async fn create(root: &Path, run_id: &str) -> Result<Self> {
        let dir = root.join(run_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            AppError::Persistence(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let log_path = dir.join(TRACE_FILE);
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| {
                AppError::Persistence(format!("cannot open {}: {}", log_path.display(), e))
            })?;

        Ok(Self {
            dir,
            log: tokio::sync::Mutex::new(log),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, task_id: TaskId) -> PathBuf {
        self.dir.join(format!("task_{}.json", task_id))
    }
}

#[async_trait]
impl TraceSink for JsonlTraceSink {
    async fn record(&self, entry: TraceEntry) -> Result<()> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut log = self.log.lock().await;
        log.write_all(&line).await?;
        log.flush().await?;
        Ok(())
    }

    async fn snapshot(&self, task_id: TaskId, results: &[ResultRecord]) -> Result<()> {
        let body = serde_json::to_vec_pretty(&Snapshot {
            task_id,
            written_at: Utc::now(),
            result_count: results.len(),
            results,
        })?;

        let path = self.snapshot_path(task_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

// ============= In-Memory Sink =============

/// Keeps everything in process. Used when tracing to disk is disabled.
#[derive(Default)]
pub struct MemoryTraceSink {
    entries: Mutex<Vec<TraceEntry>>,
    snapshots: Mutex<BTreeMap<TaskId, Vec<ResultRecord>>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().clone()
    }

    pub fn entries_for(&self, task_id: TaskId) -> Vec<TraceEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.task_id == Some(task_id))
            .cloned()
            .collect()
    }

    pub fn snapshot_of(&self, task_id: TaskId) -> Option<Vec<ResultRecord>> {
        self.snapshots.lock().get(&task_id).cloned()
    }
}

#[async_trait]
impl TraceSink for MemoryTraceSink {
    async fn record(&self, entry: TraceEntry) -> Result<()> {
        self.entries.lock().push(entry);
        Ok(())
    }

    async fn snapshot(&self, task_id: TaskId, results: &[ResultRecord]) -> Result<()> {
        self.snapshots.lock().insert(task_id, results.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task_with_results(id: TaskId, n: usize) -> Task {
        let mut task = Task::new(id, "q", "r");
        task.append_results(
            (0..n).map(|i| ResultRecord::new(format!("t{}", i), format!("https://x/{}", i), "", "web")),
        );
        task
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let temp = TempDir::new().unwrap();
        let sink = JsonlTraceSink::create(temp.path(), "run-1").await.unwrap();
        let tracer = Tracer::new("run-1", Arc::new(sink));

        tracer
            .emit(None, TraceEvent::RunStarted { question: "q".to_string() })
            .await;
        tracer
            .task(
                3,
                TraceEvent::TaskFailed {
                    reason: FailureReason::Timeout,
                    result_count: 2,
                },
            )
            .await;

        let text = std::fs::read_to_string(temp.path().join("run-1").join(TRACE_FILE)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: TraceEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.run_id, "run-1");
        assert!(first.task_id.is_none());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "task_failed");
        assert_eq!(second["task_id"], 3);
        assert_eq!(second["reason"]["kind"], "timeout");
    }

    #[tokio::test]
    async fn test_jsonl_snapshot_overwrites() {
        let temp = TempDir::new().unwrap();
        let sink = JsonlTraceSink::create(temp.path(), "run-2").await.unwrap();
        let path = sink.snapshot_path(5);
        let tracer = Tracer::new("run-2", Arc::new(sink));

        tracer.snapshot(&task_with_results(5, 1)).await;
        tracer.snapshot(&task_with_results(5, 3)).await;

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["task_id"], 5);
        assert_eq!(json["result_count"], 3);
        assert_eq!(json["results"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_memory_sink_filters_by_task() {
        let sink = Arc::new(MemoryTraceSink::new());
        let tracer = Tracer::new("run", sink.clone());

        tracer
            .task(1, TraceEvent::Reprioritized { order: vec![1, 2] })
            .await;
        tracer
            .task(2, TraceEvent::Reprioritized { order: vec![2] })
            .await;
        tracer.snapshot(&task_with_results(2, 2)).await;

        assert_eq!(sink.entries().len(), 2);
        assert_eq!(sink.entries_for(2).len(), 1);
        assert_eq!(sink.snapshot_of(2).unwrap().len(), 2);
        assert!(sink.snapshot_of(1).is_none());
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let mut sink = MockTraceSink::new();
        sink.expect_record()
            .times(1)
            .returning(|_| Err(AppError::Persistence("disk full".to_string())));
        sink.expect_snapshot()
            .times(1)
            .returning(|_, _| Err(AppError::Persistence("disk full".to_string())));

        let tracer = Tracer::new("run", Arc::new(sink));
        tracer
            .emit(None, TraceEvent::RunStarted { question: "q".to_string() })
            .await;
        tracer.snapshot(&task_with_results(1, 1)).await;
    }
}

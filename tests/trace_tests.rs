//! A full run traced to disk.

mod common;

use argus::research::trace::TRACE_FILE;
use argus::research::{JsonlTraceSink, TraceEntry, TraceEvent};
use common::mocks::{accept_and_stop, Reply, ScriptedDecision, ScriptedSource};
use common::{coordinator, sequential_config};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_run_writes_jsonl_log_and_task_snapshots() {
    let temp = TempDir::new().unwrap();
    let sink = Arc::new(JsonlTraceSink::create(temp.path(), "run-1").await.unwrap());
    let run_dir = sink.dir().to_path_buf();

    let web = ScriptedSource::always("web", Reply::Echo);
    let decision = Arc::new(
        ScriptedDecision::new(&["first", "second"])
            .with_selection(&["web"])
            .with_verdicts(vec![Ok(accept_and_stop(&[0])), Ok(accept_and_stop(&[0]))]),
    );

    let report = coordinator(sequential_config(), vec![web], decision, sink)
        .research_with_id("run-1", "question")
        .await
        .unwrap();
    assert_eq!(report.run_id, "run-1");

    let log = std::fs::read_to_string(run_dir.join(TRACE_FILE)).unwrap();
    let entries: Vec<TraceEntry> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert!(matches!(
        &entries[0].event,
        TraceEvent::RunStarted { question } if question == "question"
    ));
    assert!(matches!(
        entries.last().map(|e| &e.event),
        Some(TraceEvent::RunFinished { completed: 2, failed: 0, .. })
    ));
    assert!(entries.iter().all(|e| e.run_id == "run-1"));
    assert_eq!(
        entries
            .iter()
            .filter(|e| matches!(e.event, TraceEvent::TaskCompleted { .. }))
            .count(),
        2
    );

    for task_id in [1, 2] {
        let path = run_dir.join(format!("task_{}.json", task_id));
        let snapshot: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(snapshot["task_id"], task_id);
        assert_eq!(snapshot["result_count"], 1);
    }
}

#[tokio::test]
async fn test_log_lines_use_snake_case_event_tags() {
    let temp = TempDir::new().unwrap();
    let sink = Arc::new(JsonlTraceSink::create(temp.path(), "run-2").await.unwrap());
    let log_path = sink.dir().join(TRACE_FILE);

    let web = ScriptedSource::always("web", Reply::Echo);
    let decision = Arc::new(ScriptedDecision::new(&["only"]));

    coordinator(sequential_config(), vec![web], decision, sink)
        .research_with_id("run-2", "question")
        .await
        .unwrap();

    let first: serde_json::Value = serde_json::from_str(
        std::fs::read_to_string(log_path)
            .unwrap()
            .lines()
            .next()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(first["event"], "run_started");
    assert_eq!(first["run_id"], "run-2");
    assert!(first.get("task_id").is_none());
}

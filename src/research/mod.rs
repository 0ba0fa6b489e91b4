//! Research Orchestration Core
//!
//! Turns one open-ended question into a set of tasks, runs them against the
//! registered sources with retries and query reformulation, optionally
//! branches each task into competing hypotheses, and stops when the queue,
//! the task ceiling, the run budget or information saturation says so.
//!
//! # Architecture
//!
//! Composed services, each injected into the next:
//! - [`coordinator::ResearchCoordinator`] - the top-level loop
//! - [`runner::TaskRunner`] - per-task hypotheses then retry/reformulation
//! - [`hypothesis::HypothesisEngine`] - parallel or sequential hypotheses
//! - [`attempt::SearchExecutor`] - one concurrent fan-out to sources
//! - [`prioritizer`] - queue ordering and the saturation monitor
//! - [`resources::ResourceManager`] - rate gates, circuit breaker, shared tables
//! - [`trace`] - the append-only execution trace and result snapshots
//!
//! # Usage
//!
//! ```ignore
//! use argus::research::ResearchCoordinator;
//!
//! let coordinator = ResearchCoordinator::new(config, registry, decision, synthesizer, sink);
//! let report = coordinator
//!     .research("Which companies are hiring Rust engineers in Berlin?")
//!     .await?;
//!
//! println!("{}", report.report_text);
//! for failed in &report.failed_tasks {
//!     println!("task {} failed: {}", failed.id, failed.reason);
//! }
//! ```

pub mod attempt;
pub mod coordinator;
pub mod dedup;
pub mod entity_graph;
pub mod hypothesis;
pub mod prioritizer;
pub mod report;
pub mod resources;
pub mod runner;
pub mod task;
pub mod trace;

pub use coordinator::ResearchCoordinator;
pub use entity_graph::EntityGraph;
pub use report::{LlmReportSynthesizer, ReportSynthesizer, ResearchReport, RunFailure, StopReason};
pub use task::{FailureReason, ResultRecord, Task, TaskId, TaskStatus};
pub use trace::{JsonlTraceSink, MemoryTraceSink, TraceEntry, TraceEvent, TraceSink};

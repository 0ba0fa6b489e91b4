//! Scripted collaborators for integration tests.
//!
//! The decision service, the sources and the report synthesizer are all
//! replaced with deterministic fakes so a full research run can be driven
//! without a model or a network.

use argus::decision::{
    call_site, CoverageAssessment, CoverageRequest, DecisionService, FollowUpRequest,
    HypothesisDraft, HypothesisRequest, PriorityAssignment, ReformulationRequest,
    RelevanceRequest, RelevanceVerdict, SaturationAssessment, SaturationDigest, SourceSelection,
    TaskSpec,
};
use argus::research::resources::TaskSummary;
use argus::research::task::{Hypothesis, ResultRecord, SearchStrategy, Task, TaskId};
use argus::research::{ReportSynthesizer, ResearchReport, TraceEntry, TraceSink};
use argus::sources::{
    Credentials, QueryParams, SearchOutcome, SourceFailure, SourceIntegration,
};
use argus::types::{AppError, Decision, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// ============= Decision Service =============

/// Decision service that answers from a script.
///
/// Unscripted relevance judgments accept everything and stop. Unscripted
/// source selection fails, so the executor falls back to every relevant
/// source. Every call is logged by call site.
#[derive(Default)]
pub struct ScriptedDecision {
    tasks: Vec<TaskSpec>,
    fail_decompose: bool,
    selection: Option<Vec<String>>,
    verdicts: Mutex<VecDeque<Result<RelevanceVerdict>>>,
    hypotheses: Vec<HypothesisDraft>,
    coverage: Option<Decision>,
    saturation: Option<SaturationAssessment>,
    entities: Vec<String>,
    follow_ups: Vec<TaskSpec>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedDecision {
    /// Decomposes every question into these task queries.
    pub fn new(queries: &[&str]) -> Self {
        Self {
            tasks: queries
                .iter()
                .map(|q| TaskSpec::new(*q, "scripted"))
                .collect(),
            ..Default::default()
        }
    }

    pub fn failing_decompose() -> Self {
        Self {
            fail_decompose: true,
            ..Default::default()
        }
    }

    pub fn with_selection(mut self, sources: &[&str]) -> Self {
        self.selection = Some(sources.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_verdicts(self, verdicts: Vec<Result<RelevanceVerdict>>) -> Self {
        *self.verdicts.lock() = verdicts.into();
        self
    }

    /// `count` hypotheses with ascending exploration priority.
    pub fn with_hypotheses(mut self, count: usize) -> Self {
        self.hypotheses = (1..=count)
            .map(|n| HypothesisDraft {
                statement: format!("angle {}", n),
                confidence: 50,
                confidence_rationale: String::new(),
                strategy: SearchStrategy::default(),
                exploration_priority: n as u8,
                priority_rationale: String::new(),
            })
            .collect();
        self
    }

    pub fn with_coverage(mut self, decision: Decision) -> Self {
        self.coverage = Some(decision);
        self
    }

    pub fn with_saturation(mut self, saturated: bool, confidence: u8) -> Self {
        self.saturation = Some(SaturationAssessment {
            saturated,
            confidence,
            rationale: "scripted".to_string(),
            recommendation: if saturated {
                argus::decision::SaturationRecommendation::Stop
            } else {
                argus::decision::SaturationRecommendation::ContinueFull
            },
            recommended_additional_tasks: None,
        });
        self
    }

    /// Not saturated, but only `additional` more tasks are worth running.
    pub fn with_saturation_limit(mut self, additional: usize) -> Self {
        self.saturation = Some(SaturationAssessment {
            saturated: false,
            confidence: 40,
            rationale: "scripted".to_string(),
            recommendation: argus::decision::SaturationRecommendation::ContinueLimited,
            recommended_additional_tasks: Some(additional),
        });
        self
    }

    pub fn with_entities(mut self, entities: &[&str]) -> Self {
        self.entities = entities.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn with_follow_ups(mut self, queries: &[&str]) -> Self {
        self.follow_ups = queries
            .iter()
            .map(|q| TaskSpec::new(*q, "follow-up"))
            .collect();
        self
    }

    /// How many times a call site was consulted.
    pub fn count(&self, site: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == site).count()
    }

    fn log(&self, site: &'static str) {
        self.calls.lock().push(site);
    }
}

/// Accept these indices and stop.
pub fn accept_and_stop(indices: &[usize]) -> RelevanceVerdict {
    RelevanceVerdict {
        accept: !indices.is_empty(),
        accepted_indices: indices.to_vec(),
        decision: Decision::Stop,
        reformulated_query: None,
        param_hints: BTreeMap::new(),
        source_adjustments: Default::default(),
        rationale: "enough".to_string(),
    }
}

/// Accept these indices and retry with `next_query`.
pub fn accept_and_continue(indices: &[usize], next_query: &str) -> RelevanceVerdict {
    RelevanceVerdict {
        decision: Decision::Continue,
        reformulated_query: Some(next_query.to_string()),
        rationale: "need more".to_string(),
        ..accept_and_stop(indices)
    }
}

#[async_trait]
impl DecisionService for ScriptedDecision {
    async fn decompose(&self, _question: &str, max_tasks: usize) -> Result<Vec<TaskSpec>> {
        self.log(call_site::DECOMPOSE);
        if self.fail_decompose {
            return Err(AppError::decision(call_site::DECOMPOSE, "scripted failure"));
        }
        Ok(self.tasks.iter().take(max_tasks).cloned().collect())
    }

    async fn select_sources(
        &self,
        _query: &str,
        available: &[(String, String)],
    ) -> Result<SourceSelection> {
        self.log(call_site::SELECT_SOURCES);
        match &self.selection {
            Some(sources) => Ok(SourceSelection {
                sources: sources
                    .iter()
                    .filter(|s| available.iter().any(|(name, _)| name == *s))
                    .cloned()
                    .collect(),
                rationale: String::new(),
            }),
            None => Err(AppError::decision(call_site::SELECT_SOURCES, "unscripted")),
        }
    }

    async fn judge_relevance(&self, request: &RelevanceRequest<'_>) -> Result<RelevanceVerdict> {
        self.log(call_site::JUDGE_RELEVANCE);
        match self.verdicts.lock().pop_front() {
            Some(verdict) => verdict,
            None => Ok(accept_and_stop(
                &(0..request.results.len()).collect::<Vec<_>>(),
            )),
        }
    }

    async fn reformulate_query(&self, request: &ReformulationRequest<'_>) -> Result<String> {
        self.log(call_site::REFORMULATE_QUERY);
        Ok(format!("{} (refined)", request.current_query))
    }

    async fn generate_hypotheses(
        &self,
        request: &HypothesisRequest<'_>,
    ) -> Result<Vec<HypothesisDraft>> {
        self.log(call_site::GENERATE_HYPOTHESES);
        if self.hypotheses.is_empty() {
            return Err(AppError::decision(call_site::GENERATE_HYPOTHESES, "unscripted"));
        }
        Ok(self
            .hypotheses
            .iter()
            .take(request.max_hypotheses)
            .cloned()
            .collect())
    }

    async fn hypothesis_query(
        &self,
        hypothesis: &Hypothesis,
        _source: &str,
        _source_description: &str,
    ) -> Result<String> {
        self.log(call_site::HYPOTHESIS_QUERY);
        Ok(hypothesis.statement.clone())
    }

    async fn assess_coverage(&self, _request: &CoverageRequest<'_>) -> Result<CoverageAssessment> {
        self.log(call_site::ASSESS_COVERAGE);
        match self.coverage {
            Some(decision) => Ok(CoverageAssessment {
                decision,
                assessment: "scripted".to_string(),
                gaps: Vec::new(),
            }),
            None => Err(AppError::decision(call_site::ASSESS_COVERAGE, "unscripted")),
        }
    }

    async fn prioritize(
        &self,
        _pending: &[Task],
        _completed: &[TaskSummary],
    ) -> Result<Vec<PriorityAssignment>> {
        self.log(call_site::PRIORITIZE);
        Ok(Vec::new())
    }

    async fn assess_saturation(&self, _digest: &SaturationDigest) -> Result<SaturationAssessment> {
        self.log(call_site::ASSESS_SATURATION);
        self.saturation
            .clone()
            .ok_or_else(|| AppError::decision(call_site::ASSESS_SATURATION, "unscripted"))
    }

    async fn extract_entities(&self, _query: &str, _results: &[ResultRecord]) -> Result<Vec<String>> {
        self.log(call_site::EXTRACT_ENTITIES);
        Ok(self.entities.clone())
    }

    async fn generate_follow_ups(&self, request: &FollowUpRequest<'_>) -> Result<Vec<TaskSpec>> {
        self.log(call_site::GENERATE_FOLLOW_UPS);
        Ok(self
            .follow_ups
            .iter()
            .take(request.max_follow_ups)
            .cloned()
            .collect())
    }
}

// ============= Sources =============

/// What a scripted source does on one call.
#[derive(Clone)]
pub enum Reply {
    /// Return these records
    Results(Vec<ResultRecord>),
    /// One fresh record per call, titled after the query
    Echo,
    /// Fail with this error
    Fail(SourceFailure),
    /// Wait, then behave like the inner reply
    Delayed(Duration, Box<Reply>),
    /// Panic inside the integration
    Panic(&'static str),
}

impl Reply {
    pub fn too_many_requests() -> Self {
        Reply::Fail(SourceFailure::new("HTTP 429 Too Many Requests"))
    }
}

/// Source that replays a script; the last reply repeats forever.
pub struct ScriptedSource {
    name: String,
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Reply>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new(name: &str, script: Vec<Reply>) -> Arc<Self> {
        let last = script.last().cloned().unwrap_or(Reply::Results(Vec::new()));
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            last: Mutex::new(last),
            queries: Mutex::new(Vec::new()),
        })
    }

    pub fn always(name: &str, reply: Reply) -> Arc<Self> {
        Self::new(name, vec![reply])
    }

    pub fn calls(&self) -> usize {
        self.queries.lock().len()
    }

    /// Query text of every call, in order
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    fn next_reply(&self) -> Reply {
        match self.script.lock().pop_front() {
            Some(reply) => {
                *self.last.lock() = reply.clone();
                reply
            }
            None => self.last.lock().clone(),
        }
    }
}

#[async_trait]
impl SourceIntegration for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test source"
    }

    fn is_relevant(&self, _query: &str) -> bool {
        true
    }

    async fn generate_query(&self, query: &str) -> Option<QueryParams> {
        let mut params = QueryParams::new();
        params.insert("q".to_string(), Value::String(query.to_string()));
        Some(params)
    }

    async fn execute_search(
        &self,
        params: &QueryParams,
        _credentials: &Credentials,
        _limit: usize,
    ) -> SearchOutcome {
        let query = params
            .get("q")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let call = {
            let mut queries = self.queries.lock();
            queries.push(query.clone());
            queries.len()
        };

        let mut reply = self.next_reply();
        while let Reply::Delayed(delay, inner) = reply {
            tokio::time::sleep(delay).await;
            reply = *inner;
        }

        match reply {
            Reply::Results(results) => SearchOutcome::ok(&self.name, results),
            Reply::Echo => SearchOutcome::ok(
                &self.name,
                vec![record(
                    &format!("{} #{}", query, call),
                    &format!("https://{}/{}", self.name, call),
                )],
            ),
            Reply::Fail(failure) => SearchOutcome::failed(&self.name, failure),
            Reply::Panic(message) => panic!("{}", message),
            Reply::Delayed(..) => SearchOutcome::ok(&self.name, Vec::new()),
        }
    }
}

pub fn record(title: &str, url: &str) -> ResultRecord {
    ResultRecord::new(title, url, "", "")
}

// ============= Synthesis & Trace =============

/// Synthesizer that reports what it was given.
pub struct CountingSynthesizer;

#[async_trait]
impl ReportSynthesizer for CountingSynthesizer {
    async fn synthesize(&self, report: &ResearchReport) -> Result<String> {
        Ok(format!(
            "{} results across {} tasks",
            report.results.len(),
            report.tasks.len()
        ))
    }
}

/// Sink that keeps the length of every snapshot it was sent.
#[derive(Default)]
pub struct SnapshotHistory {
    entries: Mutex<Vec<TraceEntry>>,
    snapshots: Mutex<BTreeMap<TaskId, Vec<Vec<ResultRecord>>>>,
}

impl SnapshotHistory {
    pub fn history(&self, task_id: TaskId) -> Vec<Vec<ResultRecord>> {
        self.snapshots
            .lock()
            .get(&task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl TraceSink for SnapshotHistory {
    async fn record(&self, entry: TraceEntry) -> Result<()> {
        self.entries.lock().push(entry);
        Ok(())
    }

    async fn snapshot(&self, task_id: TaskId, results: &[ResultRecord]) -> Result<()> {
        self.snapshots
            .lock()
            .entry(task_id)
            .or_default()
            .push(results.to_vec());
        Ok(())
    }
}

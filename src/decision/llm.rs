use super::{
    call_site, CoverageAssessment, CoverageRequest, DecisionService, FollowUpRequest,
    HypothesisDraft, HypothesisRequest, PriorityAssignment, ReformulationRequest,
    Reformulation, RelevanceRequest, RelevanceVerdict, SaturationAssessment, SaturationDigest,
    SourceSelection, TaskSpec,
};
use crate::llm::LLMClient;
use crate::research::resources::TaskSummary;
use crate::research::task::{Hypothesis, ResultRecord, Task, PRIORITY_HIGHEST, PRIORITY_LOWEST};
use crate::types::{AppError, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "You are the planning component of an automated research system. \
You answer every request with exactly one JSON object that conforms to the JSON Schema you are given. \
Never add prose, markdown or comments around the JSON.";

/// Snippets shown to the model are clipped to this many characters.
const SNIPPET_CHARS: usize = 280;

// Envelopes for call sites that return a list.

#[derive(Deserialize, JsonSchema)]
struct TaskList {
    tasks: Vec<TaskSpec>,
}

#[derive(Deserialize, JsonSchema)]
struct HypothesisList {
    hypotheses: Vec<HypothesisDraft>,
}

#[derive(Deserialize, JsonSchema)]
struct SourceQuery {
    query: String,
}

#[derive(Deserialize, JsonSchema)]
struct PriorityList {
    assignments: Vec<PriorityAssignment>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EntityList {
    entities: Vec<String>,
}

/// [`DecisionService`] that prompts an LLM for schema-constrained JSON.
pub struct LlmDecisionService {
    llm: Arc<dyn LLMClient>,
}

impl LlmDecisionService {
    pub fn new(llm: Arc<dyn LLMClient>) -> Self {
        Self { llm }
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Send one structured request and parse the reply as `T`.
    async fn ask<T>(&self, site: &str, instructions: &str, context: Value) -> Result<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = schemars::schema_for!(T);
        let prompt = format!(
            "{}\n\n## Context\n{}\n\n## Output\nRespond with one JSON object matching this JSON Schema:\n{}",
            instructions,
            serde_json::to_string_pretty(&context)?,
            serde_json::to_string_pretty(&schema)?,
        );

        tracing::debug!(call_site = site, model = self.llm.model_name(), "Decision request");

        let raw = self
            .llm
            .generate_with_system(SYSTEM_PROMPT, &prompt)
            .await
            .map_err(|e| AppError::decision(site, e.to_string()))?;

        parse_structured(site, &raw)
    }
}

/// Extract the JSON object from a model reply and deserialize it.
pub fn parse_structured<T: DeserializeOwned>(site: &str, raw: &str) -> Result<T> {
    let body = extract_json_object(raw)
        .ok_or_else(|| AppError::decision(site, "response contains no JSON object"))?;
    serde_json::from_str(body)
        .map_err(|e| AppError::decision(site, format!("response does not match schema: {}", e)))
}

/// The outermost `{...}` span, ignoring code fences and surrounding prose.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn present_results(results: &[ResultRecord]) -> Vec<Value> {
    results
        .iter()
        .enumerate()
        .map(|(index, r)| {
            json!({
                "index": index,
                "title": r.title,
                "url": r.url,
                "snippet": clip(&r.snippet, SNIPPET_CHARS),
                "source": r.source,
                "date": r.date,
            })
        })
        .collect()
}

fn present_hypotheses(hypotheses: &[Hypothesis]) -> Vec<Value> {
    hypotheses
        .iter()
        .map(|h| {
            json!({
                "id": h.id,
                "statement": h.statement,
                "target_sources": h.strategy.target_sources,
            })
        })
        .collect()
}

fn check_percent(site: &str, field: &str, value: u8) -> Result<()> {
    if value > 100 {
        return Err(AppError::decision(
            site,
            format!("{} must be within 0-100, got {}", field, value),
        ));
    }
    Ok(())
}

fn non_blank_specs(site: &str, specs: Vec<TaskSpec>) -> Result<Vec<TaskSpec>> {
    if specs.iter().any(|s| s.query.trim().is_empty()) {
        return Err(AppError::decision(site, "task query must not be blank"));
    }
    Ok(specs
        .into_iter()
        .map(|s| TaskSpec::new(s.query.trim(), s.rationale))
        .collect())
}

#[async_trait]
impl DecisionService for LlmDecisionService {
    async fn decompose(&self, question: &str, max_tasks: usize) -> Result<Vec<TaskSpec>> {
        let list: TaskList = self
            .ask(
                call_site::DECOMPOSE,
                &format!(
                    "Decompose the research question into at most {} focused, non-overlapping \
                     search tasks. Each task needs a concrete search query and a one-sentence rationale.",
                    max_tasks
                ),
                json!({ "question": question }),
            )
            .await?;

        let mut specs = non_blank_specs(call_site::DECOMPOSE, list.tasks)?;
        if specs.is_empty() {
            return Err(AppError::decision(call_site::DECOMPOSE, "no tasks returned"));
        }
        specs.truncate(max_tasks);
        Ok(specs)
    }

    async fn select_sources(
        &self,
        query: &str,
        available: &[(String, String)],
    ) -> Result<SourceSelection> {
        let mut selection: SourceSelection = self
            .ask(
                call_site::SELECT_SOURCES,
                "Choose which data sources are worth querying for this search. \
                 Only use ids from the available list.",
                json!({
                    "query": query,
                    "available_sources": available
                        .iter()
                        .map(|(id, description)| json!({ "id": id, "description": description }))
                        .collect::<Vec<_>>(),
                }),
            )
            .await?;

        let known: HashSet<&str> = available.iter().map(|(id, _)| id.as_str()).collect();
        let mut seen = HashSet::new();
        selection
            .sources
            .retain(|s| known.contains(s.as_str()) && seen.insert(s.clone()));
        if selection.sources.is_empty() {
            return Err(AppError::decision(
                call_site::SELECT_SOURCES,
                "no known source selected",
            ));
        }
        Ok(selection)
    }

    async fn judge_relevance(&self, request: &RelevanceRequest<'_>) -> Result<RelevanceVerdict> {
        let mut verdict: RelevanceVerdict = self
            .ask(
                call_site::JUDGE_RELEVANCE,
                "Judge which results are relevant to the task. List the indices of acceptable results. \
                 Decide whether another attempt with a reformulated query is worthwhile; if so, provide \
                 the new query and optionally per-source parameter hints and source keep/drop/add adjustments.",
                json!({
                    "research_question": request.question,
                    "task": request.task_query,
                    "current_query": request.current_query,
                    "attempt": request.retry_count + 1,
                    "max_attempts": request.max_retries + 1,
                    "sources": request.source_reports,
                    "results": present_results(request.results),
                }),
            )
            .await?;

        if let Some(bad) = verdict
            .accepted_indices
            .iter()
            .find(|&&i| i >= request.results.len())
        {
            return Err(AppError::decision(
                call_site::JUDGE_RELEVANCE,
                format!(
                    "accepted index {} out of range for {} results",
                    bad,
                    request.results.len()
                ),
            ));
        }
        if !verdict.accept {
            verdict.accepted_indices.clear();
        }
        verdict.accepted_indices.sort_unstable();
        verdict.accepted_indices.dedup();
        if let Some(q) = &verdict.reformulated_query {
            if q.trim().is_empty() {
                verdict.reformulated_query = None;
            }
        }
        Ok(verdict)
    }

    async fn reformulate_query(&self, request: &ReformulationRequest<'_>) -> Result<String> {
        let reformulation: Reformulation = self
            .ask(
                call_site::REFORMULATE_QUERY,
                "The previous attempt did not find enough relevant results. Write a different search \
                 query for the same task. Use the per-source outcomes: sources that errored failed for \
                 reasons unrelated to the query, sources with zero results suggest the query was too narrow.",
                json!({
                    "task": request.task_query,
                    "previous_query": request.current_query,
                    "accepted_so_far": request.accepted_so_far,
                    "judge_rationale": request.rationale,
                    "sources": request.source_reports,
                }),
            )
            .await?;

        let query = reformulation.query.trim();
        if query.is_empty() || query.eq_ignore_ascii_case(request.current_query.trim()) {
            return Err(AppError::decision(
                call_site::REFORMULATE_QUERY,
                "reformulated query is blank or unchanged",
            ));
        }
        Ok(query.to_string())
    }

    async fn generate_hypotheses(
        &self,
        request: &HypothesisRequest<'_>,
    ) -> Result<Vec<HypothesisDraft>> {
        let list: HypothesisList = self
            .ask(
                call_site::GENERATE_HYPOTHESES,
                &format!(
                    "Propose between 1 and {} competing investigative hypotheses for this task. Each \
                     needs a statement, a confidence (0-100) with rationale, a search strategy naming \
                     target source ids, matching signals and expected entity names, and an exploration \
                     priority (1 explores first). Avoid angles that duplicate the prior hypotheses.",
                    request.max_hypotheses
                ),
                json!({
                    "research_question": request.question,
                    "task": request.task_query,
                    "prior_hypotheses": present_hypotheses(request.prior),
                    "available_sources": request
                        .available_sources
                        .iter()
                        .map(|(id, description)| json!({ "id": id, "description": description }))
                        .collect::<Vec<_>>(),
                }),
            )
            .await?;

        let mut drafts = list.hypotheses;
        if drafts.is_empty() {
            return Err(AppError::decision(
                call_site::GENERATE_HYPOTHESES,
                "no hypotheses returned",
            ));
        }
        for draft in &drafts {
            if draft.statement.trim().is_empty() {
                return Err(AppError::decision(
                    call_site::GENERATE_HYPOTHESES,
                    "hypothesis statement must not be blank",
                ));
            }
            check_percent(call_site::GENERATE_HYPOTHESES, "confidence", draft.confidence)?;
            if draft.exploration_priority == 0 {
                return Err(AppError::decision(
                    call_site::GENERATE_HYPOTHESES,
                    "exploration_priority starts at 1",
                ));
            }
        }
        drafts.truncate(request.max_hypotheses);
        Ok(drafts)
    }

    async fn hypothesis_query(
        &self,
        hypothesis: &Hypothesis,
        source: &str,
        source_description: &str,
    ) -> Result<String> {
        let answer: SourceQuery = self
            .ask(
                call_site::HYPOTHESIS_QUERY,
                "Write one search query that tests this hypothesis against the given source.",
                json!({
                    "hypothesis": hypothesis.statement,
                    "signals": hypothesis.strategy.signals,
                    "expected_entities": hypothesis.strategy.expected_entities,
                    "source": { "id": source, "description": source_description },
                }),
            )
            .await?;

        let query = answer.query.trim();
        if query.is_empty() {
            return Err(AppError::decision(call_site::HYPOTHESIS_QUERY, "blank query"));
        }
        Ok(query.to_string())
    }

    async fn assess_coverage(&self, request: &CoverageRequest<'_>) -> Result<CoverageAssessment> {
        self.ask(
            call_site::ASSESS_COVERAGE,
            "Assess whether the hypotheses executed so far cover the task. The facts block is computed \
             locally and is authoritative; base the decision on it. Answer \"stop\" when further \
             hypotheses are unlikely to add new results, otherwise \"continue\" and name the gaps.",
            json!({
                "task": request.task_query,
                "executed": request.executed,
                "remaining": present_hypotheses(request.remaining),
                "facts": request.facts,
            }),
        )
        .await
    }

    async fn prioritize(
        &self,
        pending: &[Task],
        completed: &[TaskSummary],
    ) -> Result<Vec<PriorityAssignment>> {
        let list: PriorityList = self
            .ask(
                call_site::PRIORITIZE,
                "Assign every pending task a priority (1 highest, 10 lowest), an estimated information \
                 value (0-100) and an estimated redundancy with completed work (0-100).",
                json!({
                    "pending": pending
                        .iter()
                        .map(|t| json!({ "task_id": t.id, "query": t.query, "rationale": t.rationale }))
                        .collect::<Vec<_>>(),
                    "completed": completed,
                }),
            )
            .await?;

        for a in &list.assignments {
            if !(PRIORITY_HIGHEST..=PRIORITY_LOWEST).contains(&a.priority) {
                return Err(AppError::decision(
                    call_site::PRIORITIZE,
                    format!("priority for task {} must be within 1-10", a.task_id),
                ));
            }
            check_percent(call_site::PRIORITIZE, "estimated_value", a.estimated_value)?;
            check_percent(call_site::PRIORITIZE, "estimated_redundancy", a.estimated_redundancy)?;
        }
        Ok(list.assignments)
    }

    async fn assess_saturation(&self, digest: &SaturationDigest) -> Result<SaturationAssessment> {
        let assessment: SaturationAssessment = self
            .ask(
                call_site::ASSESS_SATURATION,
                "Judge whether the investigation is saturated: would further tasks add new information \
                 relative to what has been found? Give a confidence (0-100), a recommendation and, if \
                 not saturated, how many additional tasks are worthwhile.",
                serde_json::to_value(digest)?,
            )
            .await?;

        check_percent(call_site::ASSESS_SATURATION, "confidence", assessment.confidence)?;
        Ok(assessment)
    }

    async fn extract_entities(&self, query: &str, results: &[ResultRecord]) -> Result<Vec<String>> {
        let list: EntityList = self
            .ask(
                call_site::EXTRACT_ENTITIES,
                "List the named entities (organisations, people, places, products) that appear in these results.",
                json!({
                    "task": query,
                    "results": present_results(results),
                }),
            )
            .await?;

        Ok(list
            .entities
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect())
    }

    async fn generate_follow_ups(&self, request: &FollowUpRequest<'_>) -> Result<Vec<TaskSpec>> {
        let task = request.task;
        let list: TaskList = self
            .ask(
                call_site::GENERATE_FOLLOW_UPS,
                &format!(
                    "Propose at most {} follow-up search tasks that close the listed gaps or pursue leads \
                     found in the results. Return an empty list if nothing is worth following up.",
                    request.max_follow_ups
                ),
                json!({
                    "research_question": request.question,
                    "task": task.query,
                    "gaps": request.gaps,
                    "entities": task.entities,
                    "results": present_results(task.accumulated_results()),
                }),
            )
            .await?;

        let mut specs = non_blank_specs(call_site::GENERATE_FOLLOW_UPS, list.tasks)?;
        specs.truncate(request.max_follow_ups);
        Ok(specs)
    }
}

//! Agent loop for tool-based root cause analysis.
//!
//! A session is an explicit state machine:
//!
//! ```text
//! CallingModel -> ExecutingTools -> CallingModel -> ... -> Finalizing
//!       \___________________________________________/
//!                          Failed
//! ```
//!
//! The number of model turns is capped. When the cap is reached the model is
//! asked once more, with no tools offered, for its best answer. Every session
//! ends in an [`AnalysisResult`], including when the model never answers.

use crate::agent::finding::{parse_final_answer, Finding, ParseMethod};
use crate::agent::llm::{ChatMessage, ChatModel, ModelReply};
use crate::agent::prompts;
use crate::agent::tools::{ToolCall, ToolRegistry};
use crate::agent::{to_payload, Agent};
use crate::error::{EnvelopeError, ModelError};
use crate::message::RequestEnvelope;
use crate::models::{
    clamp_confidence, AnalysisResult, BugReport, CommitInfo, CritiqueVerdict, ReviewStatus,
    SessionOutcome, ToolCallRecord,
};
use crate::repo::LineRange;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const ANALYSIS_AGENT_ID: &str = "rca_agent";

/// Confidence ceiling when the report carries no error message or stack trace.
const LIMITED_EVIDENCE_CAP: f64 = 0.5;
const EVIDENCE_FALLBACK_CONFIDENCE: f64 = 0.2;
const NO_EVIDENCE_CONFIDENCE: f64 = 0.05;

/// Tools whose `file_path` argument points at the code under suspicion.
const FILE_TOOLS: [&str; 6] = [
    "get_file_content",
    "get_file_blame",
    "search_in_file",
    "find_when_line_was_added",
    "analyze_function",
    "find_file_dependencies",
];

/// Configuration for the analysis agent.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Model turns per session before the answer is forced.
    pub max_iterations: usize,
    /// Messages kept after the system prompt and the request (sliding window).
    pub max_context_messages: usize,
    /// Wall-clock limit for one session.
    pub session_timeout: Option<Duration>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            max_context_messages: 20,
            session_timeout: None,
        }
    }
}

enum State {
    CallingModel,
    ExecutingTools(Vec<ToolCall>),
    Finalizing(Finalize),
    Failed(ModelError),
}

enum Finalize {
    Answer(String),
    BudgetExhausted,
    Unreadable(String),
}

/// How a session's state machine stopped.
struct Conclusion {
    outcome: SessionOutcome,
    answer: Option<String>,
    failure: Option<String>,
}

/// Conversation and audit trail of one session.
struct Session {
    attempt: u32,
    budget: usize,
    turns: usize,
    messages: Vec<ChatMessage>,
    records: Vec<ToolCallRecord>,
    started_at: DateTime<Utc>,
}

impl Session {
    fn new(attempt: u32, budget: usize, request: String, history: Vec<ToolCallRecord>) -> Self {
        Self {
            attempt,
            budget,
            turns: 0,
            messages: vec![
                ChatMessage::system(prompts::ANALYSIS_SYSTEM_PROMPT),
                ChatMessage::user(request),
            ],
            records: history,
            started_at: Utc::now(),
        }
    }

    /// Prune old messages to keep context small (sliding window).
    fn prune_old_messages(&mut self, max_context_messages: usize) {
        // Keep: system prompt + initial request + last N messages
        let max_keep = max_context_messages + 2;
        if self.messages.len() > max_keep {
            let remove_count = self.messages.len() - max_keep;
            self.messages.drain(2..2 + remove_count);
            debug!("Pruned {} old messages to save context", remove_count);
        }
    }
}

/// The root cause analysis agent.
pub struct AnalysisAgent {
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    config: AnalysisConfig,
}

impl AnalysisAgent {
    pub fn new(model: Arc<dyn ChatModel>, tools: ToolRegistry, config: AnalysisConfig) -> Self {
        info!(
            "Initializing analysis agent with model {} ({} tools, {} turns)",
            model.name(),
            tools.tools().len(),
            config.max_iterations
        );
        Self {
            model,
            tools,
            config,
        }
    }

    /// Investigate a bug report from scratch.
    pub async fn analyze(&self, bug: &BugReport) -> AnalysisResult {
        info!("Starting root cause analysis: {}", bug.title);
        let mut session = Session::new(
            1,
            self.config.max_iterations.max(1),
            prompts::analysis_request(bug),
            Vec::new(),
        );
        let conclusion = self.drive(&mut session).await;
        self.finish(bug, session, conclusion, None).await
    }

    /// Investigate again, addressing a critique of `previous`.
    ///
    /// Tool history is carried over and the new calls are appended to it.
    pub async fn improve(
        &self,
        bug: &BugReport,
        previous: &AnalysisResult,
        verdict: &CritiqueVerdict,
    ) -> AnalysisResult {
        let attempt = previous.iterations + 1;
        info!("Improving analysis of '{}' (attempt {})", bug.title, attempt);
        let mut session = Session::new(
            attempt,
            (self.config.max_iterations / 2).max(1),
            prompts::improvement_request(bug, previous, verdict),
            previous.tool_calls.clone(),
        );
        let conclusion = self.drive(&mut session).await;
        self.finish(bug, session, conclusion, Some((previous, verdict)))
            .await
    }

    async fn drive(&self, session: &mut Session) -> Conclusion {
        let Some(limit) = self.config.session_timeout else {
            return self.run_states(session).await;
        };
        let finished = tokio::time::timeout(limit, self.run_states(session)).await;
        match finished {
            Ok(conclusion) => conclusion,
            Err(_) => {
                warn!(
                    "Session timed out after {:?} ({} tool calls gathered)",
                    limit,
                    session.records.len()
                );
                Conclusion {
                    outcome: SessionOutcome::TimedOut,
                    answer: None,
                    failure: None,
                }
            }
        }
    }

    async fn run_states(&self, session: &mut Session) -> Conclusion {
        let definitions = self.tools.definitions();
        let mut state = State::CallingModel;

        loop {
            state = match state {
                State::CallingModel => {
                    session.turns += 1;
                    debug!(
                        "Attempt {} turn {}/{}",
                        session.attempt, session.turns, session.budget
                    );
                    match self.model.chat(&session.messages, &definitions).await {
                        Ok(ModelReply::ToolCalls { content, calls }) => {
                            session
                                .messages
                                .push(ChatMessage::assistant(content, Some(calls.clone())));
                            State::ExecutingTools(calls)
                        }
                        Ok(ModelReply::Final(text)) => {
                            session.messages.push(ChatMessage::assistant(text.clone(), None));
                            State::Finalizing(Finalize::Answer(text))
                        }
                        Err(ModelError::Malformed(detail)) => {
                            State::Finalizing(Finalize::Unreadable(detail))
                        }
                        Err(err) => State::Failed(err),
                    }
                }
                State::ExecutingTools(calls) => {
                    for call in &calls {
                        self.execute_tool(session, call).await;
                    }
                    if session.turns >= session.budget {
                        State::Finalizing(Finalize::BudgetExhausted)
                    } else {
                        State::CallingModel
                    }
                }
                State::Finalizing(Finalize::Answer(text)) => {
                    info!("Agent answered after {} turns", session.turns);
                    return Conclusion {
                        outcome: SessionOutcome::Answered,
                        answer: Some(text),
                        failure: None,
                    };
                }
                State::Finalizing(Finalize::BudgetExhausted) => {
                    info!(
                        "Turn budget of {} spent, forcing a final answer",
                        session.budget
                    );
                    session
                        .messages
                        .push(ChatMessage::user(prompts::finalization_request(session.budget)));
                    let answer = match self.model.chat(&session.messages, &[]).await {
                        Ok(ModelReply::Final(text)) => Some(text),
                        Ok(ModelReply::ToolCalls { content, .. }) => {
                            Some(content).filter(|c| !c.trim().is_empty())
                        }
                        Err(err) => {
                            warn!("Forced final answer failed: {}", err);
                            None
                        }
                    };
                    return Conclusion {
                        outcome: SessionOutcome::BudgetExhausted,
                        answer,
                        failure: None,
                    };
                }
                State::Finalizing(Finalize::Unreadable(detail)) => {
                    warn!(
                        "Unreadable model reply on turn {} ({} tool calls gathered): {}",
                        session.turns,
                        session.records.len(),
                        detail
                    );
                    return Conclusion {
                        outcome: SessionOutcome::Unparseable,
                        answer: None,
                        failure: Some(detail),
                    };
                }
                State::Failed(err) => {
                    error!("Model call failed: {}", err);
                    return Conclusion {
                        outcome: SessionOutcome::Failed,
                        answer: None,
                        failure: Some(err.to_string()),
                    };
                }
            };
        }
    }

    async fn execute_tool(&self, session: &mut Session, call: &ToolCall) {
        let result = self.tools.execute(call).await;
        let output = result.for_model();

        session.records.push(ToolCallRecord {
            ordinal: session.records.len() + 1,
            attempt: session.attempt,
            tool_name: call.function.name.clone(),
            arguments: call.function.arguments.clone(),
            output: output.clone(),
            success: result.success,
            duration_ms: result.duration_ms,
        });
        session
            .messages
            .push(ChatMessage::tool(call.function.name.clone(), output));

        // Sliding window: prune old tool messages to save context
        session.prune_old_messages(self.config.max_context_messages);
    }

    async fn finish(
        &self,
        bug: &BugReport,
        session: Session,
        conclusion: Conclusion,
        previous: Option<(&AnalysisResult, &CritiqueVerdict)>,
    ) -> AnalysisResult {
        let mut notes = Vec::new();
        let mut finding = match &conclusion.answer {
            Some(text) => parse_final_answer(text),
            None => evidence_finding(&session.records, conclusion.outcome),
        };

        match conclusion.outcome {
            SessionOutcome::Answered => {}
            SessionOutcome::BudgetExhausted => notes.push(format!(
                "Investigation budget of {} turns was exhausted; the answer was forced.",
                session.budget
            )),
            SessionOutcome::TimedOut => notes.push(
                "The session deadline expired; the finding was reconstructed from the tool calls made so far."
                    .to_string(),
            ),
            SessionOutcome::Unparseable => notes.push(format!(
                "The model's reply could not be read ({}); the finding was reconstructed from the tool calls made so far.",
                conclusion.failure.as_deref().unwrap_or("no detail")
            )),
            SessionOutcome::Failed => notes.push(format!(
                "The model could not be reached: {}",
                conclusion.failure.as_deref().unwrap_or("unknown error")
            )),
        }
        if conclusion.answer.is_some() && finding.method == ParseMethod::Unparsed {
            notes.push("The model's final answer did not name a code location.".to_string());
        }

        let commit_info = self.resolve_commit(&finding, &mut notes).await;

        if !bug.has_diagnostics() {
            if finding.root_cause.confidence_score > LIMITED_EVIDENCE_CAP {
                finding.root_cause.confidence_score = LIMITED_EVIDENCE_CAP;
            }
            notes.push(format!(
                "Limited evidence: the report has no error message or stack trace, so confidence is capped at {:.2}.",
                LIMITED_EVIDENCE_CAP
            ));
        }

        let (iterations, adjustment_total, previous_attempts, started_at, feedback) =
            match previous {
                Some((prev, verdict)) => {
                    let mut attempts = prev.previous_attempts.clone();
                    attempts.push(prev.root_cause.clone());
                    (
                        prev.iterations + 1,
                        prev.confidence_adjustment_total,
                        attempts,
                        prev.started_at,
                        Some(verdict.feedback_text()),
                    )
                }
                None => (1, 0.0, Vec::new(), session.started_at, None),
            };
        let confidence = clamp_confidence(finding.root_cause.confidence_score + adjustment_total);

        info!(
            "Attempt {} finished ({:?}): {} at {:.2} confidence, {} tool calls",
            iterations,
            conclusion.outcome,
            finding.root_cause.file_path,
            confidence,
            session.records.len()
        );

        AnalysisResult {
            bug_report_title: bug.title.clone(),
            root_cause: finding.root_cause,
            commit_info,
            confidence_score: confidence,
            iterations,
            tool_calls: session.records,
            critique_approved: false,
            review_status: ReviewStatus::Unreviewed,
            critique_feedback: feedback,
            confidence_adjustment_total: adjustment_total,
            previous_attempts,
            suggested_fix: finding.suggested_fix,
            verification_steps: finding.verification_steps,
            notes,
            outcome: conclusion.outcome,
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// The cited commit, or failing that, the commit blame gives for the first cited line.
    async fn resolve_commit(
        &self,
        finding: &Finding,
        notes: &mut Vec<String>,
    ) -> Option<CommitInfo> {
        let inspector = self.tools.inspector();

        if let Some(sha) = &finding.commit_sha {
            match inspector.commit_details(sha).await {
                Ok(detail) => return Some(detail.to_commit_info()),
                Err(err) => notes.push(format!(
                    "Cited commit {} could not be resolved: {}",
                    sha,
                    err.public_message()
                )),
            }
        }

        let root = &finding.root_cause;
        if !root.has_location() {
            return None;
        }
        let line = *root.line_numbers.iter().next()? as usize;
        let range = LineRange::new(line, line).ok()?;
        let blame = inspector.file_blame(&root.file_path, Some(range)).await.ok()?;
        let detail = inspector.commit_details(&blame.first()?.commit_id).await.ok()?;
        notes.push(format!(
            "Commit {} traced from blame of {}:{}.",
            detail.summary.short_id, root.file_path, line
        ));
        Some(detail.to_commit_info())
    }
}

/// Best guess from the tool calls alone: the file the session looked at most.
fn evidence_finding(records: &[ToolCallRecord], outcome: SessionOutcome) -> Finding {
    let reason = match outcome {
        SessionOutcome::TimedOut => "The session timed out before the model answered",
        SessionOutcome::Failed => "The model stopped responding before it answered",
        SessionOutcome::Unparseable => "The model's reply could not be read",
        _ => "The model gave no final answer",
    };

    // path -> (successful calls, last ordinal, lines)
    let mut files: HashMap<&str, (usize, usize, BTreeSet<u32>)> = HashMap::new();
    for record in records.iter().filter(|r| r.success) {
        if !FILE_TOOLS.contains(&record.tool_name.as_str()) {
            continue;
        }
        let Some(path) = record.arguments.get("file_path").and_then(Value::as_str) else {
            continue;
        };
        let entry = files.entry(path).or_default();
        entry.0 += 1;
        entry.1 = record.ordinal;
        for key in ["line_number", "line_start"] {
            if let Some(line) = record
                .arguments
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .filter(|&n| n > 0)
            {
                entry.2.insert(line);
            }
        }
    }

    let Some((path, (count, _, lines))) = files
        .into_iter()
        .max_by_key(|(_, (count, last, _))| (*count, *last))
    else {
        return Finding::undetermined(
            format!("{}, and no file had been inspected.", reason),
            NO_EVIDENCE_CONFIDENCE,
        );
    };

    let mut finding = Finding::undetermined(
        format!(
            "{}. The investigation concentrated on {} ({} successful tool calls), which is the most likely location but was not confirmed.",
            reason, path, count
        ),
        EVIDENCE_FALLBACK_CONFIDENCE,
    );
    finding.root_cause.file_path = path.to_string();
    finding.root_cause.line_numbers = lines;
    finding.method = ParseMethod::Heuristic;
    finding
}

const TASKS: [&str; 3] = ["analyze_bug", "improve_analysis", "get_analysis_status"];
const CAPABILITIES: [&str; 4] = [
    "bug_analysis",
    "root_cause_identification",
    "commit_tracing",
    "self_improvement",
];

#[async_trait]
impl Agent for AnalysisAgent {
    fn agent_id(&self) -> &str {
        ANALYSIS_AGENT_ID
    }

    fn description(&self) -> &str {
        "Locates the root cause of a bug by investigating the repository with tools"
    }

    fn capabilities(&self) -> &[&'static str] {
        &CAPABILITIES
    }

    fn supported_tasks(&self) -> &[&'static str] {
        &TASKS
    }

    async fn handle_task(&self, request: &RequestEnvelope) -> Result<Value, EnvelopeError> {
        match request.task() {
            "analyze_bug" => {
                let bug = read_bug(request)?;
                to_payload(&self.analyze(&bug).await)
            }
            "improve_analysis" => {
                let bug = read_bug(request)?;
                let previous: AnalysisResult = request.field("previous_result")?;
                let verdict: CritiqueVerdict = request.field("critique")?;
                to_payload(&self.improve(&bug, &previous, &verdict).await)
            }
            "get_analysis_status" => Ok(json!({
                "agent": self.info(),
                "model": self.model.name(),
                "max_iterations": self.config.max_iterations,
                "tools": self.tools.tools().iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            })),
            other => Err(EnvelopeError::UnsupportedTask {
                task: other.to_string(),
                supported: TASKS.iter().map(|t| t.to_string()).collect(),
            }),
        }
    }
}

pub(crate) fn read_bug(request: &RequestEnvelope) -> Result<BugReport, EnvelopeError> {
    let bug: BugReport = request.field("bug_report")?;
    bug.validate()
        .map_err(|e| EnvelopeError::InvalidData(e.to_string()))?;
    Ok(bug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::testing::{final_reply, tool_reply, ScriptedModel};
    use crate::agent::tools::ToolDefinition;
    use crate::message::task_data;
    use crate::models::tests::sample_bug;
    use crate::repo::fixture::FixtureRepo;
    use crate::repo::{ContentCache, GitInspector};

    const STATS_PY: &str =
        "def average(values):\n    total = sum(values)\n    return total / len(values)\n";

    fn fixture() -> (FixtureRepo, String) {
        let fixture = FixtureRepo::new();
        let commit = fixture.commit(
            "Add stats helpers",
            &[
                ("app/stats.py", STATS_PY),
                ("app/main.py", "from app.stats import average\n"),
            ],
        );
        (fixture, commit)
    }

    fn registry(fixture: &FixtureRepo) -> ToolRegistry {
        let inspector =
            GitInspector::open(fixture.path(), "HEAD", Arc::new(ContentCache::new(16)), 64 * 1024)
                .unwrap();
        ToolRegistry::new(Arc::new(inspector))
    }

    fn agent(
        fixture: &FixtureRepo,
        model: Arc<dyn ChatModel>,
        config: AnalysisConfig,
    ) -> AnalysisAgent {
        AnalysisAgent::new(model, registry(fixture), config)
    }

    fn answer(confidence: f64) -> String {
        json!({
            "file_path": "app/stats.py",
            "line_numbers": [3],
            "code_snippet": "return total / len(values)",
            "explanation": "len(values) is zero for an empty list",
            "confidence": confidence,
            "suggested_fix": "Return 0.0 when values is empty"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_answer_after_tool_calls() {
        let (fixture, commit) = fixture();
        let model = Arc::new(ScriptedModel::new(vec![
            tool_reply("get_file_content", json!({"file_path": "app/stats.py"})),
            final_reply(&answer(0.8)),
        ]));
        let agent = agent(&fixture, model.clone(), AnalysisConfig::default());

        let result = agent.analyze(&sample_bug()).await;
        assert_eq!(result.outcome, SessionOutcome::Answered);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.root_cause.file_path, "app/stats.py");
        assert!((result.confidence_score - 0.8).abs() < 1e-9);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].ordinal, 1);
        assert!(result.tool_calls[0].output.contains("return total / len(values)"));
        assert_eq!(result.suggested_fix.as_deref(), Some("Return 0.0 when values is empty"));
        assert_eq!(result.review_status, ReviewStatus::Unreviewed);

        // Commit traced through blame of line 3.
        let info = result.commit_info.unwrap();
        assert_eq!(info.commit_id, commit);
        assert_eq!(info.author.name, "Ada Lovelace");

        let calls = model.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_names.len(), 12);
        assert_eq!(calls[1].messages.last().unwrap().role, "tool");
    }

    #[tokio::test]
    async fn test_unknown_tool_does_not_end_session() {
        let (fixture, _) = fixture();
        let model = Arc::new(ScriptedModel::new(vec![
            tool_reply("delete_repository", json!({})),
            final_reply(&answer(0.7)),
        ]));
        let agent = agent(&fixture, model.clone(), AnalysisConfig::default());

        let result = agent.analyze(&sample_bug()).await;
        assert_eq!(model.call_count(), 2);
        assert!(!result.tool_calls[0].success);
        assert!(result.tool_calls[0].output.contains("Unknown tool: delete_repository"));
        assert_eq!(result.outcome, SessionOutcome::Answered);
    }

    #[tokio::test]
    async fn test_unknown_commit_is_followed_by_another_turn() {
        let (fixture, _) = fixture();
        let model = Arc::new(ScriptedModel::new(vec![
            tool_reply("get_commit_details", json!({"commit_sha": "deadbeefdeadbeef"})),
            final_reply(&answer(0.6)),
        ]));
        let agent = agent(&fixture, model.clone(), AnalysisConfig::default());

        let result = agent.analyze(&sample_bug()).await;
        let record = &result.tool_calls[0];
        assert!(!record.success);
        assert!(record.output.starts_with("Error: "));
        assert!(!record.output.contains("class="));
        assert!(!record.output.contains("libgit2"));

        assert_eq!(model.call_count(), 2);
        let second = &model.calls()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.tool_name.as_deref(), Some("get_commit_details"));
    }

    #[tokio::test]
    async fn test_budget_forces_final_answer_without_tools() {
        let (fixture, _) = fixture();
        let model = Arc::new(ScriptedModel::new(vec![
            tool_reply("search_code", json!({"query": "average"})),
            tool_reply("get_file_content", json!({"file_path": "app/stats.py"})),
            final_reply(&answer(0.75)),
        ]));
        let config = AnalysisConfig {
            max_iterations: 2,
            ..AnalysisConfig::default()
        };
        let agent = agent(&fixture, model.clone(), config);

        let result = agent.analyze(&sample_bug()).await;
        assert_eq!(model.call_count(), 3);
        assert!(model.calls()[2].tool_names.is_empty());
        assert_eq!(result.outcome, SessionOutcome::BudgetExhausted);
        assert_eq!(result.root_cause.file_path, "app/stats.py");
        assert!(result.notes.iter().any(|n| n.contains("budget of 2 turns")));
    }

    #[tokio::test]
    async fn test_budget_without_answer_falls_back_to_evidence() {
        let (fixture, _) = fixture();
        let model = Arc::new(
            ScriptedModel::new(vec![]).then_always(tool_reply(
                "get_file_content",
                json!({"file_path": "app/stats.py", "line_start": 3}),
            )),
        );
        let config = AnalysisConfig {
            max_iterations: 3,
            ..AnalysisConfig::default()
        };
        let agent = agent(&fixture, model.clone(), config);

        let result = agent.analyze(&sample_bug()).await;
        assert_eq!(model.call_count(), 4);
        assert_eq!(result.tool_calls.len(), 3);
        assert_eq!(result.outcome, SessionOutcome::BudgetExhausted);
        assert_eq!(result.root_cause.file_path, "app/stats.py");
        assert_eq!(result.root_cause.line_list(), "3");
        assert!(result.confidence_score <= EVIDENCE_FALLBACK_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_report_without_diagnostics_is_capped() {
        let (fixture, _) = fixture();
        let model = Arc::new(ScriptedModel::new(vec![final_reply(&answer(0.95))]));
        let agent = agent(&fixture, model, AnalysisConfig::default());
        let bug = BugReport::new("Average is wrong", "Stats page shows an error for new users")
            .unwrap();

        let result = agent.analyze(&bug).await;
        assert!(result.confidence_score <= 0.5);
        assert!(result.notes.iter().any(|n| n.contains("Limited evidence")));
    }

    #[tokio::test]
    async fn test_unparseable_answer_still_produces_result() {
        let (fixture, _) = fixture();
        let model = Arc::new(ScriptedModel::new(vec![final_reply("I am not sure.")]));
        let agent = agent(&fixture, model, AnalysisConfig::default());

        let result = agent.analyze(&sample_bug()).await;
        assert!(!result.root_cause.has_location());
        assert!(result.confidence_score <= 0.1);
        assert!(result.commit_info.is_none());
        assert!(result.notes.iter().any(|n| n.contains("did not name")));
    }

    #[tokio::test]
    async fn test_model_failure_ends_in_failed_result() {
        let (fixture, _) = fixture();
        let model = Arc::new(ScriptedModel::new(vec![Err(ModelError::Connect(
            "http://localhost:11434".into(),
        ))]));
        let agent = agent(&fixture, model, AnalysisConfig::default());

        let result = agent.analyze(&sample_bug()).await;
        assert_eq!(result.outcome, SessionOutcome::Failed);
        assert_eq!(result.iterations, 1);
        assert!(result.notes.iter().any(|n| n.contains("could not be reached")));
    }

    #[tokio::test]
    async fn test_malformed_reply_falls_back_to_gathered_evidence() {
        let (fixture, _) = fixture();
        let model = Arc::new(ScriptedModel::new(vec![
            tool_reply("get_file_content", json!({"file_path": "app/stats.py"})),
            Err(ModelError::Malformed("expected value at line 1".into())),
        ]));
        let agent = agent(&fixture, model.clone(), AnalysisConfig::default());

        let result = agent.analyze(&sample_bug()).await;
        assert_eq!(model.call_count(), 2);
        assert_eq!(result.outcome, SessionOutcome::Unparseable);
        assert_eq!(result.root_cause.file_path, "app/stats.py");
        assert_eq!(result.tool_calls.len(), 1);
        assert!(result.notes.iter().any(|n| n.contains("could not be read")));
        assert!(!result.notes.iter().any(|n| n.contains("could not be reached")));
    }

    #[tokio::test]
    async fn test_improvement_appends_history() {
        let (fixture, _) = fixture();
        let model = Arc::new(ScriptedModel::new(vec![
            tool_reply("search_code", json!({"query": "average"})),
            final_reply(&answer(0.6)),
            tool_reply("get_file_blame", json!({"file_path": "app/stats.py"})),
            final_reply(&answer(0.7)),
        ]));
        let agent = agent(&fixture, model.clone(), AnalysisConfig::default());
        let bug = sample_bug();

        let mut first = agent.analyze(&bug).await;
        first.apply_confidence_adjustment(-0.2);
        let verdict = CritiqueVerdict {
            approved: false,
            confidence_adjustment: -0.2,
            concerns: vec!["The commit was not traced".into()],
            suggested_improvements: vec!["Run blame on line 3".into()],
        };

        let second = agent.improve(&bug, &first, &verdict).await;
        assert_eq!(second.iterations, 2);
        assert_eq!(second.tool_calls.len(), 2);
        assert_eq!(second.tool_calls[1].ordinal, 2);
        assert_eq!(second.tool_calls[1].attempt, 2);
        assert_eq!(second.previous_attempts.len(), 1);
        assert!((second.confidence_score - 0.5).abs() < 1e-9);
        assert!((second.confidence_adjustment_total + 0.2).abs() < 1e-9);
        assert_eq!(second.started_at, first.started_at);

        let improvement_prompt = &model.calls()[2].messages[1].content;
        assert!(improvement_prompt.contains("The commit was not traced"));
    }

    struct StalledModel;

    #[async_trait]
    impl ChatModel for StalledModel {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<ModelReply, ModelError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ModelReply::Final(String::new()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timeout_returns_best_effort() {
        let (fixture, _) = fixture();
        let config = AnalysisConfig {
            session_timeout: Some(Duration::from_secs(5)),
            ..AnalysisConfig::default()
        };
        let agent = agent(&fixture, Arc::new(StalledModel), config);

        let result = agent.analyze(&sample_bug()).await;
        assert_eq!(result.outcome, SessionOutcome::TimedOut);
        assert!(!result.root_cause.has_location());
        assert!(result.notes.iter().any(|n| n.contains("deadline")));
    }

    #[tokio::test]
    async fn test_envelope_tasks() {
        let (fixture, _) = fixture();
        let model = Arc::new(ScriptedModel::new(vec![final_reply(&answer(0.8))]));
        let agent = agent(&fixture, model, AnalysisConfig::default());

        let request = RequestEnvelope::new(
            "orchestrator",
            ANALYSIS_AGENT_ID,
            "analyze_bug",
            task_data([("bug_report", serde_json::to_value(sample_bug()).unwrap())]),
        );
        let response = agent.process(&request).await;
        let result: AnalysisResult =
            serde_json::from_value(response.into_result().unwrap()).unwrap();
        assert_eq!(result.root_cause.file_path, "app/stats.py");

        let status = RequestEnvelope::new(
            "cli",
            ANALYSIS_AGENT_ID,
            "get_analysis_status",
            Default::default(),
        );
        let value = agent.process(&status).await.into_result().unwrap();
        assert_eq!(value["agent"]["agent_id"], ANALYSIS_AGENT_ID);
        assert_eq!(value["tools"].as_array().unwrap().len(), 12);

        let bad = RequestEnvelope::new(
            "orchestrator",
            ANALYSIS_AGENT_ID,
            "analyze_bug",
            task_data([("bug_report", json!({"title": "", "description": "x"}))]),
        );
        let err = agent.process(&bad).await.into_result().unwrap_err();
        assert!(err.contains("missing a title"));
    }
}

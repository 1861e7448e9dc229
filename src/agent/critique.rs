//! Critique agent.
//!
//! Reviews one analysis attempt. The verdict combines three things: a few
//! deterministic checks on the finding, at most a fixed number of verification
//! tool calls against the repository, and the model's own review. Approval
//! needs all three to agree and the adjusted confidence to clear the threshold.

use crate::agent::agent_loop::read_bug;
use crate::agent::llm::{ChatMessage, ChatModel, ModelReply};
use crate::agent::prompts;
use crate::agent::tools::{ToolCall, ToolName, ToolRegistry};
use crate::agent::{to_payload, Agent};
use crate::error::EnvelopeError;
use crate::message::RequestEnvelope;
use crate::models::{clamp_confidence, AnalysisResult, BugReport, CritiqueVerdict};
use crate::repo::RepositoryInspector;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

pub const CRITIQUE_AGENT_ID: &str = "critique_agent";

const CONTEXT_LINES: u32 = 2;
const MAX_EVIDENCE_CHARS: usize = 2000;
const MIN_EXPLANATION_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct CritiqueConfig {
    /// Adjusted confidence needed for approval.
    pub approval_threshold: f64,
    /// Repository calls allowed per critique.
    pub max_verification_calls: usize,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        Self {
            approval_threshold: 0.7,
            max_verification_calls: 2,
        }
    }
}

/// Result of one deterministic check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        }
    }
}

/// How well an analysis is backed by concrete evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceAssessment {
    /// 0.0 (nothing) to 1.0 (every kind of evidence present).
    pub score: f64,
    pub present: Vec<String>,
    pub missing: Vec<String>,
}

/// One prioritized next step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub priority: String,
    pub action: String,
    #[serde(default)]
    pub reason: String,
}

/// The model's review, as parsed from its reply.
#[derive(Debug, Clone, Default, PartialEq)]
struct ModelReview {
    approved: bool,
    adjustment: f64,
    concerns: Vec<String>,
    improvements: Vec<String>,
    alternatives: Vec<String>,
}

pub struct CritiqueAgent {
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    config: CritiqueConfig,
}

impl CritiqueAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        inspector: Arc<dyn RepositoryInspector>,
        config: CritiqueConfig,
    ) -> Self {
        Self {
            model,
            tools: ToolRegistry::subset(inspector, &ToolName::VERIFICATION),
            config,
        }
    }

    /// Review `result`. Never mutates it.
    pub async fn critique(&self, bug: &BugReport, result: &AnalysisResult) -> CritiqueVerdict {
        info!(
            "Critiquing attempt {} for '{}' ({} at {:.2})",
            result.iterations, bug.title, result.root_cause.file_path, result.confidence_score
        );

        let (checks, evidence) = self.run_checks(result).await;
        let checks_passed = checks.iter().all(|c| c.passed);
        let check_lines: Vec<String> = checks
            .iter()
            .map(|c| {
                let status = if c.passed { "pass" } else { "FAIL" };
                format!("{}: {} ({})", c.name, status, c.detail)
            })
            .collect();

        let mut concerns: Vec<String> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.detail.clone())
            .collect();
        let mut improvements = check_suggestions(&checks);

        let prompt = prompts::critique_request(bug, result, &check_lines, &evidence);
        let messages = [
            ChatMessage::system(prompts::CRITIQUE_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];

        let (model_approved, adjustment) = match self.model.chat(&messages, &[]).await {
            Ok(reply) => {
                let review = parse_review(&reply_text(reply));
                debug!("Model review: {:?}", review);
                concerns.extend(review.concerns);
                concerns.extend(
                    review
                        .alternatives
                        .into_iter()
                        .map(|a| format!("Alternative explanation to rule out: {}", a)),
                );
                improvements.extend(review.improvements);
                (review.approved, review.adjustment)
            }
            Err(err) => {
                warn!("Critique model call failed: {}", err);
                concerns.push(format!(
                    "Model review unavailable ({}); the finding cannot be approved without it.",
                    err
                ));
                (false, 0.0)
            }
        };

        let adjusted = clamp_confidence(result.confidence_score + adjustment);
        let clears_threshold = adjusted >= self.config.approval_threshold;
        if !clears_threshold {
            concerns.push(format!(
                "Confidence {:.2} is below the approval threshold {:.2}.",
                adjusted, self.config.approval_threshold
            ));
        }
        dedup(&mut concerns);
        dedup(&mut improvements);

        let verdict = CritiqueVerdict {
            approved: model_approved && checks_passed && clears_threshold,
            confidence_adjustment: adjustment,
            concerns,
            suggested_improvements: improvements,
        };
        info!(
            "Verdict: {} (adjustment {:+.2}, {} concerns)",
            if verdict.approved { "approved" } else { "rejected" },
            verdict.confidence_adjustment,
            verdict.concerns.len()
        );
        verdict
    }

    /// Score the evidence behind `result` without calling the model.
    pub fn validate_evidence(&self, result: &AnalysisResult) -> EvidenceAssessment {
        let root = &result.root_cause;
        let criteria = [
            ("file path", root.has_location()),
            ("line numbers", !root.line_numbers.is_empty()),
            ("code snippet", !root.code_snippet.trim().is_empty()),
            ("commit information", result.commit_info.is_some()),
            (
                "detailed explanation",
                root.explanation.trim().len() >= MIN_EXPLANATION_CHARS,
            ),
        ];

        let mut present = Vec::new();
        let mut missing = Vec::new();
        for (name, ok) in criteria {
            if ok {
                present.push(name.to_string());
            } else {
                missing.push(name.to_string());
            }
        }
        EvidenceAssessment {
            score: present.len() as f64 / criteria.len() as f64,
            present,
            missing,
        }
    }

    /// Prioritized next steps for `result`.
    pub async fn suggest_improvements(
        &self,
        bug: &BugReport,
        result: &AnalysisResult,
    ) -> Vec<Suggestion> {
        let messages = [
            ChatMessage::system(prompts::CRITIQUE_SYSTEM_PROMPT),
            ChatMessage::user(prompts::suggestion_request(bug, result)),
        ];
        match self.model.chat(&messages, &[]).await {
            Ok(reply) => {
                let suggestions = parse_suggestions(&reply_text(reply));
                if !suggestions.is_empty() {
                    return suggestions;
                }
                debug!("No suggestions parsed from the model reply");
            }
            Err(err) => warn!("Suggestion model call failed: {}", err),
        }

        self.validate_evidence(result)
            .missing
            .into_iter()
            .map(|missing| Suggestion {
                priority: "high".to_string(),
                action: format!("Establish the {} for the finding", missing),
                reason: "The analysis does not provide it yet".to_string(),
            })
            .collect()
    }

    /// Deterministic checks plus the verification calls they need.
    async fn run_checks(&self, result: &AnalysisResult) -> (Vec<Check>, String) {
        let root = &result.root_cause;
        let mut checks = Vec::new();
        let mut evidence = String::new();
        let mut budget = self.config.max_verification_calls;

        let mut file_ok = root.has_location();
        let mut file_detail = if file_ok {
            format!("cites {}", root.file_path)
        } else {
            "No file path identified for the root cause.".to_string()
        };

        let range = root
            .line_numbers
            .first()
            .zip(root.line_numbers.last())
            .map(|(first, last)| {
                (
                    first.saturating_sub(CONTEXT_LINES).max(1),
                    last.saturating_add(CONTEXT_LINES),
                )
            });
        let mut range_args = json!({ "file_path": root.file_path });
        if let Some((start, end)) = range {
            range_args["line_start"] = json!(start);
            range_args["line_end"] = json!(end);
        }

        let mut snippet_detail = None;
        if file_ok && budget > 0 {
            budget -= 1;
            let call = ToolCall::new(ToolName::GetFileContent.as_str(), range_args.clone());
            let output = self.tools.execute(&call).await;
            push_evidence(&mut evidence, "get_file_content", &output.for_model());
            if !output.success {
                file_ok = false;
                file_detail = format!(
                    "Cited file {} could not be read at the analysed revision.",
                    root.file_path
                );
            } else if let Some(first_line) = root
                .code_snippet
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
            {
                let found = output.output.contains(first_line);
                snippet_detail = Some(found);
            }
        }
        checks.push(Check::new("file_path_present", file_ok, file_detail));

        let successful_calls = result.tool_calls.iter().filter(|c| c.success).count();
        let explanation = root.explanation.trim();
        let references_code = !root.code_snippet.trim().is_empty()
            || (!root.line_numbers.is_empty() && root.has_location())
            || mentions_file(explanation, &root.file_path);
        let concrete = !explanation.is_empty()
            && references_code
            && successful_calls > 0
            && snippet_detail != Some(false);
        let concrete_detail = if concrete {
            format!("backed by {} successful tool calls", successful_calls)
        } else if snippet_detail == Some(false) {
            "The cited code snippet does not appear at the cited location.".to_string()
        } else if successful_calls == 0 {
            "The analysis made no successful repository calls to support its claim.".to_string()
        } else {
            "The explanation does not reference concrete code (file, lines or snippet)."
                .to_string()
        };
        checks.push(Check::new("references_concrete_evidence", concrete, concrete_detail));

        let commit_check = match (&result.commit_info, range) {
            (None, _) => Check::new("commit_consistent_with_blame", true, "no commit cited"),
            (Some(_), _) if !file_ok => Check::new(
                "commit_consistent_with_blame",
                false,
                "Cited commit cannot be checked because the cited file is unavailable.",
            ),
            (Some(commit), _) if commit.files_changed.iter().any(|f| f == &root.file_path) => {
                Check::new(
                    "commit_consistent_with_blame",
                    true,
                    format!("commit {} changed {}", commit.short_id, root.file_path),
                )
            }
            (Some(commit), Some(_)) if budget > 0 => {
                let call = ToolCall::new(ToolName::GetFileBlame.as_str(), range_args.clone());
                let output = self.tools.execute(&call).await;
                push_evidence(&mut evidence, "get_file_blame", &output.for_model());
                let blamed = blamed_commits(&output.output);
                let consistent =
                    output.success && blamed.iter().any(|id| id == &commit.commit_id);
                Check::new(
                    "commit_consistent_with_blame",
                    consistent,
                    if consistent {
                        format!("blame attributes the cited lines to {}", commit.short_id)
                    } else {
                        format!(
                            "Commit {} neither touched {} nor appears in the blame of the cited lines.",
                            commit.short_id, root.file_path
                        )
                    },
                )
            }
            (Some(commit), _) => Check::new(
                "commit_consistent_with_blame",
                false,
                format!(
                    "Commit {} did not change {} and could not be checked against blame.",
                    commit.short_id, root.file_path
                ),
            ),
        };
        checks.push(commit_check);

        (checks, evidence)
    }
}

fn reply_text(reply: ModelReply) -> String {
    match reply {
        ModelReply::Final(text) => text,
        ModelReply::ToolCalls { content, .. } => content,
    }
}

fn push_evidence(evidence: &mut String, tool: &str, output: &str) {
    let excerpt: String = output.chars().take(MAX_EVIDENCE_CHARS).collect();
    evidence.push_str(&format!("### {}\n{}\n", tool, excerpt));
}

fn mentions_file(text: &str, path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    !name.is_empty() && text.contains(name)
}

/// Commit ids in a rendered `get_file_blame` output.
fn blamed_commits(output: &str) -> Vec<String> {
    let Ok(Value::Array(lines)) = serde_json::from_str::<Value>(output) else {
        return Vec::new();
    };
    lines
        .iter()
        .filter_map(|line| line.get("commit_id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn check_suggestions(checks: &[Check]) -> Vec<String> {
    checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| match c.name.as_str() {
            "file_path_present" => {
                "Identify the exact file responsible and confirm it exists with get_file_content."
            }
            "references_concrete_evidence" => {
                "Quote the offending code and explain how it produces the reported behaviour."
            }
            _ => "Trace the cited lines with get_file_blame or find_when_line_was_added and cite that commit.",
        })
        .map(str::to_string)
        .collect()
}

fn dedup(items: &mut Vec<String>) {
    let mut seen = Vec::with_capacity(items.len());
    items.retain(|item| {
        if seen.contains(item) {
            false
        } else {
            seen.push(item.clone());
            true
        }
    });
}

fn parse_review(text: &str) -> ModelReview {
    static ADJUSTMENT: OnceLock<Option<Regex>> = OnceLock::new();
    let adjustment = ADJUSTMENT
        .get_or_init(|| Regex::new(r"CONFIDENCE_ADJUSTMENT:\s*\[?\s*([-+]?\d*\.?\d+)").ok())
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1)?.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(-1.0, 1.0))
        .unwrap_or(0.0);

    #[derive(PartialEq)]
    enum Section {
        None,
        Concerns,
        Improvements,
        Alternatives,
    }

    let mut review = ModelReview {
        adjustment,
        ..ModelReview::default()
    };
    let mut section = Section::None;
    for line in text.lines().map(str::trim) {
        let upper = line.to_uppercase();
        if let Some(rest) = upper.strip_prefix("APPROVED:") {
            review.approved = rest.trim_start().starts_with("YES");
            section = Section::None;
        } else if upper.starts_with("CONFIDENCE_ADJUSTMENT:") {
            section = Section::None;
        } else if upper.starts_with("MAIN_CONCERNS") {
            section = Section::Concerns;
        } else if upper.starts_with("SUGGESTED_IMPROVEMENTS") {
            section = Section::Improvements;
        } else if upper.starts_with("ALTERNATIVE_EXPLANATIONS") {
            section = Section::Alternatives;
        } else if let Some(item) = bullet(line) {
            match section {
                Section::Concerns => review.concerns.push(item),
                Section::Improvements => review.improvements.push(item),
                Section::Alternatives => review.alternatives.push(item),
                Section::None => {}
            }
        }
    }
    review
}

/// Text of a "- item", "* item" or "1. item" line, skipping placeholders.
fn bullet(line: &str) -> Option<String> {
    let item = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| {
            let (number, rest) = line.split_once(". ")?;
            let numbered = !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
            numbered.then_some(rest)
        })?
        .trim();
    let lowered = item.to_lowercase();
    if item.is_empty() || lowered == "none" || lowered == "n/a" {
        None
    } else {
        Some(item.to_string())
    }
}

fn parse_suggestions(text: &str) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();
    let mut current: Option<Suggestion> = None;

    for line in text.lines().map(str::trim) {
        if line.to_uppercase().starts_with("SUGGESTION") {
            suggestions.extend(current.take().filter(|s| !s.action.is_empty()));
            current = Some(Suggestion {
                priority: "medium".to_string(),
                action: String::new(),
                reason: String::new(),
            });
            continue;
        }
        let (Some(suggestion), Some((key, value))) = (current.as_mut(), line.split_once(':'))
        else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim().to_lowercase().as_str() {
            "priority" => suggestion.priority = value.to_lowercase(),
            "action" => suggestion.action = value,
            "reason" => suggestion.reason = value,
            _ => {}
        }
    }
    suggestions.extend(current.filter(|s| !s.action.is_empty()));
    suggestions
}

const TASKS: [&str; 4] = [
    "critique_analysis",
    "validate_evidence",
    "suggest_improvements",
    "get_agent_info",
];
const CAPABILITIES: [&str; 3] = [
    "analysis_review",
    "evidence_validation",
    "improvement_suggestions",
];

#[async_trait]
impl Agent for CritiqueAgent {
    fn agent_id(&self) -> &str {
        CRITIQUE_AGENT_ID
    }

    fn description(&self) -> &str {
        "Reviews root cause analyses and decides whether they are well supported"
    }

    fn capabilities(&self) -> &[&'static str] {
        &CAPABILITIES
    }

    fn supported_tasks(&self) -> &[&'static str] {
        &TASKS
    }

    async fn handle_task(&self, request: &RequestEnvelope) -> Result<Value, EnvelopeError> {
        match request.task() {
            "critique_analysis" => {
                let bug = read_bug(request)?;
                let result: AnalysisResult = request.field("analysis_result")?;
                to_payload(&self.critique(&bug, &result).await)
            }
            "validate_evidence" => {
                let result: AnalysisResult = request.field("analysis_result")?;
                to_payload(&self.validate_evidence(&result))
            }
            "suggest_improvements" => {
                let bug = read_bug(request)?;
                let result: AnalysisResult = request.field("analysis_result")?;
                let suggestions = self.suggest_improvements(&bug, &result).await;
                Ok(json!({ "suggestions": suggestions }))
            }
            "get_agent_info" => Ok(json!({
                "agent": self.info(),
                "approval_threshold": self.config.approval_threshold,
                "max_verification_calls": self.config.max_verification_calls,
            })),
            other => Err(EnvelopeError::UnsupportedTask {
                task: other.to_string(),
                supported: TASKS.iter().map(|t| t.to_string()).collect(),
            }),
        }
    }
}

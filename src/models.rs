//! Data models for root cause analysis.
//!
//! This module contains the values exchanged between the agents: the bug
//! report under investigation, the finding an analysis produces, the verdict a
//! critique returns, and the audit trail of tool calls.

use crate::error::BugReportError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Severity level of a reported bug.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cosmetic or minor inconvenience
    Low,
    /// Default for untriaged reports
    #[default]
    Medium,
    /// Broken feature, no workaround
    High,
    /// Data loss, security, or outage
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

impl Severity {
    /// Returns an emoji representation of the severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Low => "🟢",
            Severity::Medium => "🟡",
            Severity::High => "🟠",
            Severity::Critical => "🔴",
        }
    }
}

/// A structured bug report. Treated as immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BugReport {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub steps_to_reproduce: Vec<String>,
    #[serde(default)]
    pub expected_behavior: String,
    #[serde(default)]
    pub actual_behavior: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<String>,
}

impl BugReport {
    /// Create a report with the two required fields.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> std::result::Result<Self, BugReportError> {
        let report = Self {
            title: title.into(),
            description: description.into(),
            steps_to_reproduce: Vec::new(),
            expected_behavior: String::new(),
            actual_behavior: String::new(),
            error_message: None,
            stack_trace: None,
            environment: BTreeMap::new(),
            severity: Severity::default(),
            affected_version: None,
            reporter: None,
        };
        report.validate()?;
        Ok(report)
    }

    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps_to_reproduce = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_behavior(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected_behavior = expected.into();
        self.actual_behavior = actual.into();
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Reject reports without a title or description.
    pub fn validate(&self) -> std::result::Result<(), BugReportError> {
        if self.title.trim().is_empty() {
            return Err(BugReportError::MissingTitle);
        }
        if self.description.trim().is_empty() {
            return Err(BugReportError::MissingDescription);
        }
        Ok(())
    }

    /// Parse and validate a report from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let report: BugReport =
            serde_json::from_str(json).context("Failed to parse bug report JSON")?;
        report.validate()?;
        Ok(report)
    }

    /// Load and validate a report from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read bug report: {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("Invalid bug report: {}", path.display()))
    }

    /// True when the report carries an error message or stack trace.
    pub fn has_diagnostics(&self) -> bool {
        let present = |field: &Option<String>| {
            field
                .as_deref()
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false)
        };
        present(&self.error_message) || present(&self.stack_trace)
    }
}

/// One executed tool call. Append-only within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Position in the session's call history, starting at 1.
    pub ordinal: usize,
    /// Analysis attempt that issued the call.
    pub attempt: u32,
    pub tool_name: String,
    pub arguments: Value,
    pub output: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// The located defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub file_path: String,
    pub line_numbers: BTreeSet<u32>,
    #[serde(default)]
    pub code_snippet: String,
    pub explanation: String,
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_trace: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<String>,
}

/// Placeholder path used when no file could be identified.
pub const UNKNOWN_FILE: &str = "unknown";

impl RootCause {
    /// A finding that names no location.
    pub fn undetermined(explanation: impl Into<String>, confidence: f64) -> Self {
        Self {
            file_path: UNKNOWN_FILE.to_string(),
            line_numbers: BTreeSet::new(),
            code_snippet: String::new(),
            explanation: explanation.into(),
            confidence_score: clamp_confidence(confidence),
            execution_trace: Vec::new(),
            related_files: Vec::new(),
        }
    }

    /// Whether the finding points at a concrete file.
    pub fn has_location(&self) -> bool {
        let path = self.file_path.trim();
        !path.is_empty() && path != UNKNOWN_FILE
    }

    /// Line numbers rendered as "12, 13, 20".
    pub fn line_list(&self) -> String {
        self.line_numbers
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Author of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

/// The commit a finding is traced to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit_id: String,
    pub short_id: String,
    pub author: CommitAuthor,
    pub date: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub additions: usize,
    #[serde(default)]
    pub deletions: usize,
}

/// Whether a critique looked at the result, and what it decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// No critique ran (disabled, or no refinement budget).
    #[default]
    Unreviewed,
    Approved,
    /// Critique ran and the refinement budget ran out without approval.
    Rejected,
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewStatus::Unreviewed => write!(f, "Unreviewed"),
            ReviewStatus::Approved => write!(f, "Approved"),
            ReviewStatus::Rejected => write!(f, "Rejected"),
        }
    }
}

/// How the most recent analysis session ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The model produced a final answer on its own.
    #[default]
    Answered,
    /// The turn budget ran out and the answer was forced.
    BudgetExhausted,
    /// The session deadline fired.
    TimedOut,
    /// A model reply could not be read as tool calls or an answer.
    Unparseable,
    /// The model could not be reached at all.
    Failed,
}

/// Outcome of one refinement loop. Returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub bug_report_title: String,
    pub root_cause: RootCause,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_info: Option<CommitInfo>,
    pub confidence_score: f64,
    /// Number of analysis attempts (initial analysis plus improvements).
    pub iterations: u32,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub critique_approved: bool,
    #[serde(default)]
    pub review_status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique_feedback: Option<String>,
    /// Sum of every critique adjustment applied so far.
    #[serde(default)]
    pub confidence_adjustment_total: f64,
    /// Findings superseded by later attempts, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_attempts: Vec<RootCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default)]
    pub outcome: SessionOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Apply a critique adjustment, keeping the score inside [0, 1].
    pub fn apply_confidence_adjustment(&mut self, delta: f64) -> f64 {
        let delta = if delta.is_finite() { delta } else { 0.0 };
        self.confidence_adjustment_total += delta;
        self.confidence_score = clamp_confidence(self.confidence_score + delta);
        self.confidence_score
    }

    /// Distinct tool names in first-use order.
    pub fn tools_used(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for record in &self.tool_calls {
            if !seen.contains(&record.tool_name.as_str()) {
                seen.push(record.tool_name.as_str());
            }
        }
        seen
    }
}

/// A critique's judgement of one analysis attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CritiqueVerdict {
    pub approved: bool,
    pub confidence_adjustment: f64,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub suggested_improvements: Vec<String>,
}

impl CritiqueVerdict {
    /// Feedback text folded into the analysis result.
    pub fn feedback_text(&self) -> String {
        let mut lines = vec![format!(
            "{} (confidence adjustment {:+.2})",
            if self.approved { "Approved" } else { "Not approved" },
            self.confidence_adjustment
        )];
        if !self.concerns.is_empty() {
            lines.push("Concerns:".to_string());
            lines.extend(self.concerns.iter().map(|c| format!("- {}", c)));
        }
        if !self.suggested_improvements.is_empty() {
            lines.push("Suggested improvements:".to_string());
            lines.extend(
                self.suggested_improvements
                    .iter()
                    .map(|s| format!("- {}", s)),
            );
        }
        lines.join("\n")
    }
}

/// Metadata about a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub repository: String,
    /// Ref the tools read from, with the commit it resolved to.
    pub reference: String,
    pub analysis_date: DateTime<Utc>,
    pub model_used: String,
    pub critique_enabled: bool,
    pub duration_seconds: f64,
}

/// One bug report and what came of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BugAnalysis {
    pub bug_report: BugReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    /// Set when the refinement loop itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counts by review status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub total: usize,
    pub approved: usize,
    pub rejected: usize,
    pub unreviewed: usize,
    pub failed: usize,
}

/// The complete output of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub summary: ReviewSummary,
    pub analyses: Vec<BugAnalysis>,
}

impl ReviewSummary {
    /// Process exit code: failures (1) outrank rejections (2).
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else if self.rejected > 0 {
            2
        } else {
            0
        }
    }
}

impl Report {
    pub fn new(metadata: ReportMetadata, analyses: Vec<BugAnalysis>) -> Self {
        let mut summary = ReviewSummary {
            total: analyses.len(),
            ..Default::default()
        };
        for analysis in &analyses {
            // A session that never reached the model is a failure, not a pending review.
            match analysis.result.as_ref() {
                None => summary.failed += 1,
                Some(r) if r.outcome == SessionOutcome::Failed => summary.failed += 1,
                Some(r) => match r.review_status {
                    ReviewStatus::Approved => summary.approved += 1,
                    ReviewStatus::Rejected => summary.rejected += 1,
                    ReviewStatus::Unreviewed => summary.unreviewed += 1,
                },
            }
        }
        Self {
            metadata,
            summary,
            analyses,
        }
    }
}

/// Clamp a confidence value into [0, 1]; non-finite values become 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_bug() -> BugReport {
        BugReport::new(
            "Division crash in stats",
            "Computing the average of an empty list crashes the service",
        )
        .unwrap()
        .with_steps(["Call /stats with an empty dataset"])
        .with_behavior("Average is reported as 0", "Service returns 500")
        .with_error_message("ZeroDivisionError: division by zero")
    }

    pub(crate) fn sample_result(confidence: f64) -> AnalysisResult {
        let now = Utc::now();
        AnalysisResult {
            bug_report_title: "Division crash in stats".to_string(),
            root_cause: RootCause {
                file_path: "src/stats.py".to_string(),
                line_numbers: [4].into_iter().collect(),
                code_snippet: "return total / len(values)".to_string(),
                explanation: "len(values) is zero for an empty dataset".to_string(),
                confidence_score: confidence,
                execution_trace: Vec::new(),
                related_files: Vec::new(),
            },
            commit_info: None,
            confidence_score: confidence,
            iterations: 1,
            tool_calls: Vec::new(),
            critique_approved: false,
            review_status: ReviewStatus::Unreviewed,
            critique_feedback: None,
            confidence_adjustment_total: 0.0,
            previous_attempts: Vec::new(),
            suggested_fix: None,
            verification_steps: Vec::new(),
            notes: Vec::new(),
            outcome: SessionOutcome::Answered,
            started_at: now,
            completed_at: now,
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::default(), Severity::Medium);
    }

    #[test]
    fn test_bug_report_requires_title_and_description() {
        assert_eq!(
            BugReport::new("  ", "desc").unwrap_err(),
            BugReportError::MissingTitle
        );
        assert_eq!(
            BugReport::new("title", "").unwrap_err(),
            BugReportError::MissingDescription
        );
    }

    #[test]
    fn test_bug_report_from_json() {
        let json = r#"{
            "title": "Login fails",
            "description": "Users cannot log in after upgrade",
            "steps_to_reproduce": ["open /login", "submit"],
            "severity": "high",
            "environment": {"os": "linux"}
        }"#;
        let report = BugReport::from_json_str(json).unwrap();
        assert_eq!(report.severity, Severity::High);
        assert_eq!(report.steps_to_reproduce.len(), 2);
        assert_eq!(report.environment.get("os").map(String::as_str), Some("linux"));
        assert!(!report.has_diagnostics());

        let missing = r#"{"title": "", "description": "x"}"#;
        assert!(BugReport::from_json_str(missing).is_err());
    }

    #[test]
    fn test_confidence_stays_clamped() {
        let sequences: [&[f64]; 4] = [
            &[0.5, 0.5, 0.5],
            &[-2.0, 0.1],
            &[0.3, -0.9, 1.7, -0.2],
            &[f64::NAN, f64::INFINITY, -0.05],
        ];
        for deltas in sequences {
            let mut result = sample_result(0.6);
            for delta in deltas {
                let score = result.apply_confidence_adjustment(*delta);
                assert!((0.0..=1.0).contains(&score), "score {} escaped", score);
            }
        }
    }

    #[test]
    fn test_adjustment_total_accumulates() {
        let mut result = sample_result(0.5);
        result.apply_confidence_adjustment(-0.2);
        result.apply_confidence_adjustment(0.1);
        assert!((result.confidence_adjustment_total - (-0.1)).abs() < 1e-9);
        assert!((result.confidence_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_tools_used_is_distinct_and_ordered() {
        let mut result = sample_result(0.5);
        for (i, name) in ["search_code", "get_file_content", "search_code"]
            .iter()
            .enumerate()
        {
            result.tool_calls.push(ToolCallRecord {
                ordinal: i + 1,
                attempt: 1,
                tool_name: name.to_string(),
                arguments: Value::Null,
                output: String::new(),
                success: true,
                duration_ms: 1,
            });
        }
        assert_eq!(result.tools_used(), vec!["search_code", "get_file_content"]);
    }

    #[test]
    fn test_review_status_serializes_snake_case() {
        let json = serde_json::to_string(&ReviewStatus::Unreviewed).unwrap();
        assert_eq!(json, "\"unreviewed\"");
    }

    #[test]
    fn test_verdict_feedback_text() {
        let verdict = CritiqueVerdict {
            approved: false,
            confidence_adjustment: -0.1,
            concerns: vec!["No commit cited".to_string()],
            suggested_improvements: vec!["Run blame on line 4".to_string()],
        };
        let text = verdict.feedback_text();
        assert!(text.starts_with("Not approved (confidence adjustment -0.10)"));
        assert!(text.contains("- No commit cited"));
        assert!(text.contains("- Run blame on line 4"));
    }

    #[test]
    fn test_exit_code_prefers_failures() {
        let summary = |rejected, failed| ReviewSummary {
            total: 3,
            approved: 1,
            rejected,
            unreviewed: 0,
            failed,
        };
        assert_eq!(summary(0, 0).exit_code(), 0);
        assert_eq!(summary(1, 0).exit_code(), 2);
        assert_eq!(summary(1, 1).exit_code(), 1);
        assert_eq!(summary(0, 2).exit_code(), 1);
    }
}

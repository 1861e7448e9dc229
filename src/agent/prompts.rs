//! Prompt construction for the analysis and critique agents.

use crate::models::{AnalysisResult, BugReport, CritiqueVerdict};
use std::fmt::Write;

/// Initial user message for an analysis session.
pub fn analysis_request(bug: &BugReport) -> String {
    let mut prompt = String::from("Investigate this bug report and find its root cause.\n\n");
    prompt.push_str(&bug_report_block(bug));
    prompt.push_str(INVESTIGATION_WORKFLOW);
    if !bug.has_diagnostics() {
        prompt.push_str(
            "\nNo error message or stack trace was provided. Rely on the description \
             and the code itself, and keep your confidence modest.\n",
        );
    }
    prompt
}

/// Initial user message for an improvement session.
pub fn improvement_request(
    bug: &BugReport,
    previous: &AnalysisResult,
    verdict: &CritiqueVerdict,
) -> String {
    let mut prompt = String::from(
        "A reviewer rejected your previous root cause analysis. Investigate again and \
         produce an improved answer.\n\n",
    );
    prompt.push_str(&bug_report_block(bug));

    let root = &previous.root_cause;
    prompt.push_str("\n## Previous Analysis\n");
    let _ = writeln!(prompt, "- File: {}", root.file_path);
    if !root.line_numbers.is_empty() {
        let _ = writeln!(prompt, "- Lines: {}", root.line_list());
    }
    let _ = writeln!(prompt, "- Confidence: {:.2}", previous.confidence_score);
    let _ = writeln!(prompt, "- Explanation: {}", root.explanation);

    prompt.push_str("\n## Reviewer Feedback\n");
    let _ = writeln!(
        prompt,
        "- Approved: {}",
        if verdict.approved { "yes" } else { "no" }
    );
    if !verdict.concerns.is_empty() {
        prompt.push_str("- Concerns:\n");
        for (i, concern) in verdict.concerns.iter().enumerate() {
            let _ = writeln!(prompt, "  {}. {}", i + 1, concern);
        }
    }
    if !verdict.suggested_improvements.is_empty() {
        prompt.push_str("- Suggested improvements:\n");
        for (i, suggestion) in verdict.suggested_improvements.iter().enumerate() {
            let _ = writeln!(prompt, "  {}. {}", i + 1, suggestion);
        }
    }

    prompt.push_str(
        "\nAddress each concern explicitly. Use the tools to gather the missing evidence \
         before answering; do not simply restate the previous analysis.\n",
    );
    prompt.push_str(INVESTIGATION_WORKFLOW);
    prompt
}

/// Sent with no tools offered once the turn budget is spent.
pub fn finalization_request(budget: usize) -> String {
    format!(
        "You have used all {} investigation turns. No more tools are available. \
         Give your final answer now from the evidence gathered so far, in the required \
         JSON format. Lower your confidence if the evidence is incomplete.",
        budget
    )
}

/// Critique request for one analysis attempt.
pub fn critique_request(
    bug: &BugReport,
    result: &AnalysisResult,
    checks: &[String],
    evidence: &str,
) -> String {
    let root = &result.root_cause;
    let mut prompt = String::new();
    prompt.push_str(&bug_report_block(bug));
    prompt.push_str("\n## Proposed Root Cause\n");
    let _ = writeln!(prompt, "- File: {}", root.file_path);
    let _ = writeln!(prompt, "- Lines: {}", root.line_list());
    let _ = writeln!(prompt, "- Confidence: {:.2}", result.confidence_score);
    let _ = writeln!(prompt, "- Explanation: {}", root.explanation);
    if !root.code_snippet.is_empty() {
        let _ = writeln!(prompt, "- Code:\n```\n{}\n```", root.code_snippet);
    }
    if let Some(commit) = &result.commit_info {
        let _ = writeln!(
            prompt,
            "- Commit: {} by {} <{}> on {}: {}",
            commit.short_id,
            commit.author.name,
            commit.author.email,
            commit.date.format("%Y-%m-%d"),
            commit.message.lines().next().unwrap_or_default()
        );
    }
    let _ = writeln!(
        prompt,
        "- Tools used: {} ({} calls)",
        result.tools_used().join(", "),
        result.tool_calls.len()
    );

    if !checks.is_empty() {
        prompt.push_str("\n## Automated Checks\n");
        for check in checks {
            let _ = writeln!(prompt, "- {}", check);
        }
    }
    if !evidence.is_empty() {
        prompt.push_str("\n## Verification Evidence\n");
        prompt.push_str(evidence);
        prompt.push('\n');
    }
    prompt.push_str(CRITIQUE_FORMAT);
    prompt
}

/// Request for prioritized improvement suggestions.
pub fn suggestion_request(bug: &BugReport, result: &AnalysisResult) -> String {
    let mut prompt = bug_report_block(bug);
    let root = &result.root_cause;
    let _ = write!(
        prompt,
        "\n## Current Analysis\n- File: {}\n- Lines: {}\n- Confidence: {:.2}\n- Explanation: {}\n",
        root.file_path,
        root.line_list(),
        result.confidence_score,
        root.explanation
    );
    prompt.push_str(SUGGESTION_FORMAT);
    prompt
}

fn bug_report_block(bug: &BugReport) -> String {
    let mut block = String::from("## Bug Report\n");
    let _ = writeln!(block, "**Title:** {}", bug.title);
    let _ = writeln!(block, "**Severity:** {}", bug.severity);
    let _ = writeln!(block, "**Description:** {}", bug.description);
    if !bug.steps_to_reproduce.is_empty() {
        block.push_str("**Steps to Reproduce:**\n");
        for (i, step) in bug.steps_to_reproduce.iter().enumerate() {
            let _ = writeln!(block, "{}. {}", i + 1, step);
        }
    }
    if !bug.expected_behavior.is_empty() {
        let _ = writeln!(block, "**Expected:** {}", bug.expected_behavior);
    }
    if !bug.actual_behavior.is_empty() {
        let _ = writeln!(block, "**Actual:** {}", bug.actual_behavior);
    }
    if let Some(error) = bug.error_message.as_deref().filter(|s| !s.trim().is_empty()) {
        let _ = writeln!(block, "**Error Message:**\n```\n{}\n```", error.trim());
    }
    if let Some(trace) = bug.stack_trace.as_deref().filter(|s| !s.trim().is_empty()) {
        let _ = writeln!(block, "**Stack Trace:**\n```\n{}\n```", trace.trim());
    }
    if let Some(version) = &bug.affected_version {
        let _ = writeln!(block, "**Affected Version:** {}", version);
    }
    if !bug.environment.is_empty() {
        block.push_str("**Environment:**\n");
        for (key, value) in &bug.environment {
            let _ = writeln!(block, "- {}: {}", key, value);
        }
    }
    block
}

/// System prompt for the analysis agent.
pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are an expert software engineer performing root cause analysis on a bug report. You investigate a git repository with read-only tools and locate the exact code responsible for the bug.

## Rules

- Base every claim on tool output. Never invent file paths, line numbers or commits.
- Cite line numbers exactly as shown by get_file_content.
- When you know the responsible lines, use get_file_blame or find_when_line_was_added to trace the commit that introduced them.
- Stop calling tools once you have enough evidence, and answer.

## Final Answer

Reply with a single JSON object and nothing else:

```json
{
  "file_path": "path/to/file.py",
  "line_numbers": [42, 43],
  "code_snippet": "the offending code",
  "explanation": "why this code causes the reported behaviour",
  "commit_sha": "full or abbreviated commit id, or null",
  "confidence": 0.8,
  "suggested_fix": "how to fix it",
  "verification_steps": ["how to confirm the fix"],
  "related_files": ["other/relevant/file.py"]
}
```

Confidence is between 0.0 and 1.0. Use values above 0.8 only when you read the code and traced the commit.
"#;

const INVESTIGATION_WORKFLOW: &str = r#"
## Investigation Workflow

1. get_repository_structure to understand the layout
2. search_code for identifiers from the error message, stack trace or description
3. get_file_content on the most likely files
4. get_file_blame or find_when_line_was_added on the suspicious lines, then get_commit_details
5. Answer with the final JSON object
"#;

/// System prompt for the critique agent.
pub const CRITIQUE_SYSTEM_PROMPT: &str = r#"You are a senior engineer reviewing another engineer's root cause analysis. Be skeptical. Approve only when the cited code plausibly explains the reported behaviour and the evidence supports it."#;

const CRITIQUE_FORMAT: &str = r#"
Review the analysis above. Respond in exactly this format:

APPROVED: YES or NO
CONFIDENCE_ADJUSTMENT: a signed number between -0.5 and +0.3 (e.g. +0.1, -0.2)
MAIN_CONCERNS:
- concern
SUGGESTED_IMPROVEMENTS:
- improvement
ALTERNATIVE_EXPLANATIONS:
- alternative
"#;

const SUGGESTION_FORMAT: &str = r#"
Suggest concrete next investigation steps that would make this analysis more reliable. Respond with up to five entries in this format:

SUGGESTION 1:
Priority: high, medium or low
Action: what to do
Reason: why it helps
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::{sample_bug, sample_result};

    #[test]
    fn test_analysis_request_includes_report() {
        let prompt = analysis_request(&sample_bug());
        assert!(prompt.contains("**Title:** Division crash in stats"));
        assert!(prompt.contains("ZeroDivisionError"));
        assert!(prompt.contains("1. Call /stats with an empty dataset"));
        assert!(!prompt.contains("No error message or stack trace"));

        let bare = BugReport::new("Slow page", "The dashboard takes a minute to load").unwrap();
        assert!(analysis_request(&bare).contains("No error message or stack trace"));
    }

    #[test]
    fn test_improvement_request_lists_each_concern() {
        let verdict = CritiqueVerdict {
            approved: false,
            confidence_adjustment: -0.1,
            concerns: vec!["No commit cited".into(), "Line 4 not read".into()],
            suggested_improvements: vec!["Blame line 4".into()],
        };
        let prompt = improvement_request(&sample_bug(), &sample_result(0.6), &verdict);
        assert!(prompt.contains("- File: src/stats.py"));
        assert!(prompt.contains("1. No commit cited"));
        assert!(prompt.contains("2. Line 4 not read"));
        assert!(prompt.contains("1. Blame line 4"));
        assert!(prompt.contains("Address each concern"));
    }

    #[test]
    fn test_critique_request_format() {
        let prompt = critique_request(
            &sample_bug(),
            &sample_result(0.6),
            &["file path present".to_string()],
            "",
        );
        assert!(prompt.contains("APPROVED: YES or NO"));
        assert!(prompt.contains("- file path present"));
        assert!(!prompt.contains("Verification Evidence"));
    }
}

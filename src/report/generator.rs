//! Markdown and JSON report generation.

use crate::cli::OutputFormat;
use crate::models::{
    AnalysisResult, BugAnalysis, Report, ReportMetadata, ReviewStatus, ReviewSummary,
    SessionOutcome,
};
use crate::repo::code::Language;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

/// Longest tool output excerpt shown in the investigation table.
const OUTPUT_EXCERPT_CHARS: usize = 80;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# RootCause Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_summary_section(&report.summary, &report.analyses));

    for (i, analysis) in report.analyses.iter().enumerate() {
        output.push_str(&generate_analysis_section(i + 1, analysis));
    }

    output.push_str(&generate_footer());
    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    let _ = writeln!(section, "- **Repository:** {}", metadata.repository);
    let _ = writeln!(section, "- **Reference:** `{}`", metadata.reference);
    let _ = writeln!(
        section,
        "- **Analysis Date:** {}",
        metadata.analysis_date.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(section, "- **Model Used:** `{}`", metadata.model_used);
    let _ = writeln!(
        section,
        "- **Critique:** {}",
        if metadata.critique_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    let _ = writeln!(
        section,
        "- **Analysis Duration:** {:.1}s\n",
        metadata.duration_seconds
    );

    section
}

/// Generate the summary section.
fn generate_summary_section(summary: &ReviewSummary, analyses: &[BugAnalysis]) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str("| ✅ Approved | ❌ Rejected | ⚪ Unreviewed | ⚠️ Failed | **Total** |\n");
    section.push_str("|:---:|:---:|:---:|:---:|:---:|\n");
    let _ = writeln!(
        section,
        "| {} | {} | {} | {} | **{}** |\n",
        summary.approved, summary.rejected, summary.unreviewed, summary.failed, summary.total
    );

    if analyses.is_empty() {
        return section;
    }

    section.push_str("| # | Bug | Status | Confidence | Location |\n");
    section.push_str("|:---:|:---|:---|:---:|:---|\n");
    for (i, analysis) in analyses.iter().enumerate() {
        let title = escape_cell(&analysis.bug_report.title);
        match &analysis.result {
            Some(result) => {
                let _ = writeln!(
                    section,
                    "| {} | {} | {} | {:.2} | {} |",
                    i + 1,
                    title,
                    row_status(result),
                    result.confidence_score,
                    location(result)
                );
            }
            None => {
                let _ = writeln!(section, "| {} | {} | ⚠️ Failed | - | - |", i + 1, title);
            }
        }
    }
    section.push('\n');

    section
}

/// Generate the section for one bug report.
fn generate_analysis_section(number: usize, analysis: &BugAnalysis) -> String {
    let mut section = String::new();
    let bug = &analysis.bug_report;

    let _ = writeln!(section, "## {}. {}\n", number, bug.title);
    let _ = writeln!(
        section,
        "*Severity: {} {}*\n",
        bug.severity.emoji(),
        bug.severity
    );

    let result = match &analysis.result {
        Some(result) => result,
        None => {
            let _ = writeln!(
                section,
                "> ⚠️ **Analysis failed:** {}\n",
                analysis.error.as_deref().unwrap_or("unknown error")
            );
            section.push_str("---\n\n");
            return section;
        }
    };

    let _ = writeln!(
        section,
        "**Status:** {} | **Confidence:** {:.2} | **Attempts:** {} | **Session:** {}\n",
        status_badge(result.review_status),
        result.confidence_score,
        result.iterations,
        outcome_label(result.outcome)
    );

    section.push_str(&generate_root_cause_block(result));
    section.push_str(&generate_commit_block(result));

    if let Some(fix) = &result.suggested_fix {
        let _ = writeln!(section, "> 💡 **Suggested Fix:** {}\n", fix);
    }
    if !result.verification_steps.is_empty() {
        section.push_str("### Verification Steps\n\n");
        for (i, step) in result.verification_steps.iter().enumerate() {
            let _ = writeln!(section, "{}. {}", i + 1, step);
        }
        section.push('\n');
    }

    if let Some(feedback) = &result.critique_feedback {
        section.push_str("### Critique Feedback\n\n");
        for line in feedback.lines() {
            let _ = writeln!(section, "> {}", line);
        }
        section.push('\n');
    }

    if !result.previous_attempts.is_empty() {
        section.push_str("### Previous Attempts\n\n");
        for (i, attempt) in result.previous_attempts.iter().enumerate() {
            let lines = if attempt.line_numbers.is_empty() {
                String::new()
            } else {
                format!(" (lines {})", attempt.line_list())
            };
            let _ = writeln!(
                section,
                "{}. `{}`{} at {:.2}: {}",
                i + 1,
                attempt.file_path,
                lines,
                attempt.confidence_score,
                attempt.explanation
            );
        }
        section.push('\n');
    }

    section.push_str(&generate_tool_call_table(result));

    if !result.notes.is_empty() {
        section.push_str("### Notes\n\n");
        for note in &result.notes {
            let _ = writeln!(section, "- {}", note);
        }
        section.push('\n');
    }

    section.push_str("---\n\n");
    section
}

fn generate_root_cause_block(result: &AnalysisResult) -> String {
    let mut block = String::new();
    let root = &result.root_cause;

    block.push_str("### Root Cause\n\n");
    if root.has_location() {
        let _ = writeln!(block, "**File:** `{}`\n", root.file_path);
    } else {
        block.push_str("**File:** not determined\n\n");
    }
    if !root.line_numbers.is_empty() {
        let _ = writeln!(block, "**Lines:** {}\n", root.line_list());
    }
    if !root.explanation.is_empty() {
        let _ = writeln!(block, "**Explanation:** {}\n", root.explanation);
    }
    if !root.code_snippet.is_empty() {
        let tag = Language::from_path(&root.file_path).fence_tag();
        let _ = writeln!(block, "```{}\n{}\n```\n", tag, root.code_snippet.trim_end());
    }
    if !root.execution_trace.is_empty() {
        block.push_str("**Execution Trace:**\n\n");
        for step in &root.execution_trace {
            let _ = writeln!(block, "- {}", step);
        }
        block.push('\n');
    }
    if !root.related_files.is_empty() {
        let files: Vec<String> = root.related_files.iter().map(|f| format!("`{}`", f)).collect();
        let _ = writeln!(block, "**Related Files:** {}\n", files.join(", "));
    }

    block
}

fn generate_commit_block(result: &AnalysisResult) -> String {
    let Some(commit) = &result.commit_info else {
        return "### Introducing Commit\n\nNo commit was identified.\n\n".to_string();
    };

    let mut block = String::from("### Introducing Commit\n\n");
    match &commit.url {
        Some(url) => {
            let _ = writeln!(block, "- **Commit:** [`{}`]({})", commit.short_id, url);
        }
        None => {
            let _ = writeln!(block, "- **Commit:** `{}`", commit.short_id);
        }
    }
    let _ = writeln!(
        block,
        "- **Author:** {} <{}>",
        commit.author.name, commit.author.email
    );
    let _ = writeln!(
        block,
        "- **Date:** {}",
        commit.date.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(
        block,
        "- **Message:** {}",
        commit.message.lines().next().unwrap_or_default()
    );
    if !commit.files_changed.is_empty() {
        let _ = writeln!(
            block,
            "- **Changes:** {} files, +{} -{}",
            commit.files_changed.len(),
            commit.additions,
            commit.deletions
        );
    }
    block.push('\n');

    block
}

fn generate_tool_call_table(result: &AnalysisResult) -> String {
    if result.tool_calls.is_empty() {
        return String::new();
    }

    let mut table = String::new();
    let _ = writeln!(
        table,
        "### Investigation ({} tool calls)\n",
        result.tool_calls.len()
    );
    table.push_str("<details>\n<summary>View Tool Calls</summary>\n\n");
    table.push_str("| # | Attempt | Tool | Arguments | Result | Time |\n");
    table.push_str("|:---:|:---:|:---|:---|:---|---:|\n");
    for record in &result.tool_calls {
        let _ = writeln!(
            table,
            "| {} | {} | `{}` | `{}` | {} {} | {}ms |",
            record.ordinal,
            record.attempt,
            record.tool_name,
            escape_cell(&record.arguments.to_string()),
            if record.success { "✓" } else { "✗" },
            escape_cell(&excerpt(&record.output)),
            record.duration_ms
        );
    }
    table.push_str("\n</details>\n\n");

    table
}

/// Generate the report footer.
fn generate_footer() -> String {
    format!(
        "*Report generated by RootCause v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}

fn row_status(result: &AnalysisResult) -> &'static str {
    if result.outcome == SessionOutcome::Failed {
        "⚠️ Failed"
    } else {
        status_badge(result.review_status)
    }
}

fn status_badge(status: ReviewStatus) -> &'static str {
    match status {
        ReviewStatus::Approved => "✅ Approved",
        ReviewStatus::Rejected => "❌ Rejected",
        ReviewStatus::Unreviewed => "⚪ Unreviewed",
    }
}

fn outcome_label(outcome: SessionOutcome) -> &'static str {
    match outcome {
        SessionOutcome::Answered => "answered",
        SessionOutcome::BudgetExhausted => "turn budget exhausted",
        SessionOutcome::TimedOut => "timed out",
        SessionOutcome::Unparseable => "unreadable model reply",
        SessionOutcome::Failed => "model unavailable",
    }
}

fn location(result: &AnalysisResult) -> String {
    let root = &result.root_cause;
    if !root.has_location() {
        return "-".to_string();
    }
    match root.line_numbers.first() {
        Some(line) => format!("`{}:{}`", root.file_path, line),
        None => format!("`{}`", root.file_path),
    }
}

fn excerpt(output: &str) -> String {
    let first = output.lines().next().unwrap_or_default();
    if first.chars().count() > OUTPUT_EXCERPT_CHARS {
        let cut: String = first.chars().take(OUTPUT_EXCERPT_CHARS).collect();
        format!("{}…", cut)
    } else {
        first.to_string()
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Render the report in `format` and write it to `path`.
pub fn write_report(report: &Report, format: OutputFormat, path: &Path) -> Result<()> {
    let content = match format {
        OutputFormat::Json => generate_json_report(report)?,
        OutputFormat::Markdown => generate_markdown_report(report),
    };

    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::{sample_bug, sample_result};
    use crate::models::{CommitAuthor, CommitInfo, ToolCallRecord};
    use chrono::Utc;
    use serde_json::json;

    fn metadata() -> ReportMetadata {
        ReportMetadata {
            repository: "https://github.com/acme/stats".to_string(),
            reference: "HEAD (3f2a9c1)".to_string(),
            analysis_date: Utc::now(),
            model_used: "test-model".to_string(),
            critique_enabled: true,
            duration_seconds: 12.5,
        }
    }

    fn analysed(result: AnalysisResult) -> BugAnalysis {
        BugAnalysis {
            bug_report: sample_bug(),
            result: Some(result),
            error: None,
        }
    }

    #[test]
    fn test_generate_markdown_report() {
        let mut result = sample_result(0.82);
        result.review_status = ReviewStatus::Approved;
        result.critique_approved = true;
        result.suggested_fix = Some("Return 0 for an empty list".to_string());
        result.tool_calls.push(ToolCallRecord {
            ordinal: 1,
            attempt: 1,
            tool_name: "search_code".to_string(),
            arguments: json!({"query": "len(values)"}),
            output: "src/stats.py:4: return total / len(values)".to_string(),
            success: true,
            duration_ms: 12,
        });

        let report = Report::new(metadata(), vec![analysed(result)]);
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# RootCause Report"));
        assert!(markdown.contains("## 1. Division crash in stats"));
        assert!(markdown.contains("✅ Approved"));
        assert!(markdown.contains("`src/stats.py:4`"));
        assert!(markdown.contains("```python\nreturn total / len(values)\n```"));
        assert!(markdown.contains("Return 0 for an empty list"));
        assert!(markdown.contains("| 1 | 1 | `search_code` |"));
        assert!(markdown.contains("No commit was identified."));
    }

    #[test]
    fn test_unreviewed_never_reads_as_approved() {
        let mut result = sample_result(0.6);
        result.critique_approved = true;
        result.review_status = ReviewStatus::Unreviewed;

        let mut meta = metadata();
        meta.critique_enabled = false;
        let markdown = generate_markdown_report(&Report::new(meta, vec![analysed(result)]));

        assert!(markdown.contains("⚪ Unreviewed"));
        assert!(!markdown.contains("**Status:** ✅"));
        assert!(markdown.contains("- **Critique:** disabled"));
    }

    #[test]
    fn test_failed_analysis_section() {
        let report = Report::new(
            metadata(),
            vec![BugAnalysis {
                bug_report: sample_bug(),
                result: None,
                error: Some("rca_agent rejected analyze_bug".to_string()),
            }],
        );
        assert_eq!(report.summary.failed, 1);

        let markdown = generate_markdown_report(&report);
        assert!(markdown.contains("Analysis failed:** rca_agent rejected analyze_bug"));
    }

    #[test]
    fn test_commit_block_links_commit() {
        let mut result = sample_result(0.7);
        result.commit_info = Some(CommitInfo {
            commit_id: "3f2a9c1d00000000000000000000000000000000".to_string(),
            short_id: "3f2a9c1".to_string(),
            author: CommitAuthor {
                name: "Dana".to_string(),
                email: "dana@example.com".to_string(),
            },
            date: Utc::now(),
            message: "Add average endpoint\n\nLonger body".to_string(),
            url: Some("https://github.com/acme/stats/commit/3f2a9c1d".to_string()),
            files_changed: vec!["src/stats.py".to_string()],
            additions: 12,
            deletions: 1,
        });

        let block = generate_commit_block(&result);
        assert!(block.contains("[`3f2a9c1`](https://github.com/acme/stats/commit/3f2a9c1d)"));
        assert!(block.contains("Dana <dana@example.com>"));
        assert!(block.contains("- **Message:** Add average endpoint\n"));
        assert!(block.contains("1 files, +12 -1"));
    }

    #[test]
    fn test_summary_counts() {
        let mut approved = sample_result(0.9);
        approved.review_status = ReviewStatus::Approved;
        let mut rejected = sample_result(0.3);
        rejected.review_status = ReviewStatus::Rejected;

        let report = Report::new(metadata(), vec![analysed(approved), analysed(rejected)]);
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.approved, 1);
        assert_eq!(report.summary.rejected, 1);
        assert_eq!(report.summary.unreviewed, 0);
    }

    #[test]
    fn test_unreachable_model_counts_as_failed() {
        let mut down = sample_result(0.1);
        down.outcome = SessionOutcome::Failed;
        down.review_status = ReviewStatus::Unreviewed;
        let mut pending = sample_result(0.6);
        pending.review_status = ReviewStatus::Unreviewed;

        let report = Report::new(metadata(), vec![analysed(down), analysed(pending)]);
        assert_eq!(
            report.summary,
            ReviewSummary {
                total: 2,
                approved: 0,
                rejected: 0,
                unreviewed: 1,
                failed: 1,
            }
        );
        let markdown = generate_markdown_report(&report);
        assert!(markdown.contains("| 1 | Division crash in stats | ⚠️ Failed |"));
    }

    #[test]
    fn test_generate_json_report() {
        let report = Report::new(metadata(), vec![analysed(sample_result(0.5))]);
        let json = generate_json_report(&report).unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["unreviewed"], 1);
        assert_eq!(
            value["analyses"][0]["result"]["review_status"],
            "unreviewed"
        );
        assert_eq!(
            value["analyses"][0]["result"]["root_cause"]["file_path"],
            "src/stats.py"
        );
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = Report::new(metadata(), Vec::new());

        write_report(&report, OutputFormat::Json, &path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"analyses\": []"));
    }
}

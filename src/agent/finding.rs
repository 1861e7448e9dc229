//! Turning the model's final answer into a [`RootCause`].
//!
//! Three passes, most reliable first: a JSON object (fenced or bare), then
//! regex extraction over the markdown layout models tend to fall back to, and
//! finally an undetermined low-confidence finding that keeps the raw text.

use crate::models::{clamp_confidence, CommitAuthor, RootCause};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Confidence given to a heuristically parsed answer that states none.
const HEURISTIC_DEFAULT_CONFIDENCE: f64 = 0.4;
/// Confidence given when nothing usable could be extracted.
const UNPARSED_CONFIDENCE: f64 = 0.1;
const MAX_LINES_PER_RANGE: u32 = 200;

/// How the final answer was understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMethod {
    Structured,
    Heuristic,
    Unparsed,
}

/// Everything extracted from one final answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub root_cause: RootCause,
    pub commit_sha: Option<String>,
    pub author: Option<CommitAuthor>,
    pub suggested_fix: Option<String>,
    pub verification_steps: Vec<String>,
    pub method: ParseMethod,
}

impl Finding {
    /// A finding that locates nothing, carrying `note` as its explanation.
    pub fn undetermined(note: impl Into<String>, confidence: f64) -> Self {
        Self {
            root_cause: RootCause::undetermined(note, confidence),
            commit_sha: None,
            author: None,
            suggested_fix: None,
            verification_steps: Vec::new(),
            method: ParseMethod::Unparsed,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFinding {
    #[serde(alias = "file", alias = "path")]
    file_path: String,
    #[serde(alias = "lines", alias = "line_number")]
    line_numbers: Value,
    #[serde(alias = "code", alias = "snippet")]
    code_snippet: String,
    explanation: String,
    #[serde(alias = "confidence_score")]
    confidence: Value,
    #[serde(alias = "commit", alias = "commit_id", alias = "sha")]
    commit_sha: Option<String>,
    author: Option<String>,
    author_email: Option<String>,
    suggested_fix: Option<String>,
    verification_steps: Vec<String>,
    related_files: Vec<String>,
    execution_trace: Vec<String>,
}

/// Parse a final answer. Never fails; see the module docs for the passes.
pub fn parse_final_answer(text: &str) -> Finding {
    if let Some(finding) = parse_structured(text) {
        return finding;
    }
    if let Some(finding) = parse_heuristic(text) {
        return finding;
    }

    let excerpt: String = text.trim().chars().take(600).collect();
    let note = if excerpt.is_empty() {
        "The model returned an empty final answer.".to_string()
    } else {
        format!(
            "The final answer could not be parsed into a location. Raw answer: {}",
            excerpt
        )
    };
    Finding::undetermined(note, UNPARSED_CONFIDENCE)
}

fn parse_structured(text: &str) -> Option<Finding> {
    let candidate = json_candidate(text)?;
    let raw: RawFinding = serde_json::from_str(candidate).ok()?;
    if raw.file_path.trim().is_empty() && raw.explanation.trim().is_empty() {
        return None;
    }

    let author = raw.author.filter(|a| !a.trim().is_empty()).map(|name| CommitAuthor {
        name: name.trim().to_string(),
        email: raw.author_email.clone().unwrap_or_default(),
    });
    let file_path = if raw.file_path.trim().is_empty() {
        crate::models::UNKNOWN_FILE.to_string()
    } else {
        clean_path(&raw.file_path)
    };

    Some(Finding {
        root_cause: RootCause {
            file_path,
            line_numbers: lines_from_value(&raw.line_numbers),
            code_snippet: raw.code_snippet.trim().to_string(),
            explanation: raw.explanation.trim().to_string(),
            confidence_score: confidence_from_value(&raw.confidence)
                .unwrap_or(HEURISTIC_DEFAULT_CONFIDENCE),
            execution_trace: raw.execution_trace,
            related_files: raw.related_files,
        },
        commit_sha: raw.commit_sha.and_then(|s| valid_sha(&s)),
        author,
        suggested_fix: raw.suggested_fix.filter(|s| !s.trim().is_empty()),
        verification_steps: raw.verification_steps,
        method: ParseMethod::Structured,
    })
}

/// The JSON object in a ```json fence, or the outermost braces.
fn json_candidate(text: &str) -> Option<&str> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let fence = FENCE
        .get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok())
        .as_ref();

    if let Some(caps) = fence.and_then(|re| re.captures(text)) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

struct Patterns {
    file: Regex,
    any_path: Regex,
    lines: Regex,
    code_block: Regex,
    code_line: Regex,
    explanation: Regex,
    sha: Regex,
    author: Regex,
    confidence: Regex,
    fix: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                file: Regex::new(r"(?im)^[\s>*-]*(?:\*\*)?file(?:[ _]?path)?(?:\*\*)?\s*:\s*(?:\*\*)?`?([^\s`*]+)").ok()?,
                any_path: Regex::new(r"([A-Za-z0-9_./-]+\.(?:py|rs|js|jsx|ts|tsx|go|java|kt|c|h|cc|cpp|hpp|rb|php|cs|swift|scala))\b").ok()?,
                lines: Regex::new(r"(?im)^[\s>*-]*(?:\*\*)?lines?(?:\*\*)?\s*:\s*(?:\*\*)?(.+)$").ok()?,
                code_block: Regex::new(r"(?is)code(?:\*\*)?\s*:\s*```[\w+-]*\n(.*?)```").ok()?,
                code_line: Regex::new(r"(?im)^[\s>*-]*(?:\*\*)?code(?:\*\*)?\s*:\s*`?([^`\n]+)`?\s*$").ok()?,
                explanation: Regex::new(r"(?is)explanation(?:\*\*)?\s*:\s*(.+?)(?:\n\s*\n|\n\s*#|\z)").ok()?,
                sha: Regex::new(r"(?i)\b(?:sha|commit)(?:\*\*)?\s*:\s*`?([0-9a-f]{7,40})\b").ok()?,
                author: Regex::new(r"(?im)author(?:\*\*)?\s*:\s*([^(\n]+?)\s*\(([^)\s]+@[^)\s]+)\)").ok()?,
                confidence: Regex::new(r"(?i)confidence(?:[ _]?score)?[^0-9\n]{0,20}\n?\s*(\d*\.?\d+)\s*(%)?").ok()?,
                fix: Regex::new(r"(?is)suggested[ _]fix(?:\*\*)?\s*:?\s*\n?(.+?)(?:\n\s*\n|\n\s*#|\z)").ok()?,
            })
        })
        .as_ref()
}

fn parse_heuristic(text: &str) -> Option<Finding> {
    let p = patterns()?;

    let file_path = p
        .file
        .captures(text)
        .or_else(|| p.any_path.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| clean_path(m.as_str()))
        .filter(|path| path.contains('.') || path.contains('/'))?;

    let line_numbers = p
        .lines
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| parse_line_spec(m.as_str()))
        .unwrap_or_default();

    let code_snippet = p
        .code_block
        .captures(text)
        .or_else(|| p.code_line.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    let explanation = p
        .explanation
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| text.trim().chars().take(1000).collect());

    let confidence = p
        .confidence
        .captures(text)
        .and_then(|c| {
            let value: f64 = c.get(1)?.as_str().parse().ok()?;
            Some(if c.get(2).is_some() || value > 1.0 {
                value / 100.0
            } else {
                value
            })
        })
        .map(clamp_confidence)
        .unwrap_or(HEURISTIC_DEFAULT_CONFIDENCE);

    let author = p.author.captures(text).and_then(|c| {
        Some(CommitAuthor {
            name: c.get(1)?.as_str().trim().to_string(),
            email: c.get(2)?.as_str().trim().to_string(),
        })
    });

    Some(Finding {
        root_cause: RootCause {
            file_path,
            line_numbers,
            code_snippet,
            explanation,
            confidence_score: confidence,
            execution_trace: Vec::new(),
            related_files: Vec::new(),
        },
        commit_sha: p
            .sha
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase()),
        author,
        suggested_fix: p
            .fix
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty()),
        verification_steps: Vec::new(),
        method: ParseMethod::Heuristic,
    })
}

/// "12, 14-16" or "L12" to a set of line numbers.
pub fn parse_line_spec(spec: &str) -> BTreeSet<u32> {
    let mut lines = BTreeSet::new();
    for part in spec.split(|c: char| c == ',' || c == ';' || c.is_whitespace()) {
        let part = part.trim_matches(|c: char| !c.is_ascii_digit() && c != '-');
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((a, b)) => {
                if let (Ok(a), Ok(b)) = (a.parse::<u32>(), b.parse::<u32>()) {
                    if a <= b && b - a <= MAX_LINES_PER_RANGE {
                        lines.extend(a..=b);
                    }
                }
            }
            None => {
                if let Ok(n) = part.parse::<u32>() {
                    lines.insert(n);
                }
            }
        }
    }
    lines.remove(&0);
    lines
}

fn lines_from_value(value: &Value) -> BTreeSet<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .into_iter()
            .filter(|&n| n > 0)
            .collect(),
        Value::String(s) => parse_line_spec(s),
        Value::Array(items) => items.iter().flat_map(lines_from_value).collect(),
        _ => BTreeSet::new(),
    }
}

fn confidence_from_value(value: &Value) -> Option<f64> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim();
            match s.strip_suffix('%') {
                Some(pct) => pct.trim().parse::<f64>().ok()? / 100.0,
                None => s.parse().ok()?,
            }
        }
        _ => return None,
    };
    Some(clamp_confidence(if raw > 1.0 { raw / 100.0 } else { raw }))
}

fn valid_sha(s: &str) -> Option<String> {
    let s = s.trim().trim_matches('`');
    (s.len() >= 7 && s.len() <= 40 && s.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| s.to_lowercase())
}

fn clean_path(path: &str) -> String {
    let path = path.trim().trim_matches(|c| c == '`' || c == '"' || c == '\'');
    // "src/app.py:42" names a line, not a file.
    let path = match path.rsplit_once(':') {
        Some((file, line)) if line.chars().all(|c| c.is_ascii_digit()) => file,
        _ => path,
    };
    path.trim_start_matches("./").to_string()
}

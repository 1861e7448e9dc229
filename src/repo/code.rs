//! Lightweight source heuristics: function extraction, imports, complexity.
//!
//! These are regex and indentation based on purpose. They only need to be good
//! enough to point the model at the right lines.

use regex::Regex;
use serde::Serialize;
use std::path::Path;

/// Language guessed from a file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    C,
    Cpp,
    Other,
}

impl Language {
    pub fn from_path(path: &str) -> Self {
        match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some("rs") => Language::Rust,
            Some("py") => Language::Python,
            Some("js" | "jsx" | "mjs" | "cjs") => Language::JavaScript,
            Some("ts" | "tsx") => Language::TypeScript,
            Some("go") => Language::Go,
            Some("java" | "kt") => Language::Java,
            Some("c" | "h") => Language::C,
            Some("cpp" | "cc" | "hpp" | "cxx") => Language::Cpp,
            _ => Language::Other,
        }
    }

    /// Info string for a Markdown code fence.
    pub fn fence_tag(self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Other => "",
        }
    }

    fn uses_braces(self) -> bool {
        !matches!(self, Language::Python)
    }
}

/// A function located in a source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    pub language: Language,
    /// 1-indexed, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub signature: String,
    pub parameters: Vec<String>,
    /// Decision points plus one.
    pub complexity: usize,
    pub body: String,
}

/// Locate `name` in `content` and return its span.
pub fn extract_function(content: &str, name: &str, path: &str) -> Option<FunctionInfo> {
    let language = Language::from_path(path);
    let lines: Vec<&str> = content.lines().collect();
    let start = find_definition_line(&lines, name, language)?;

    let end = if language.uses_braces() {
        brace_block_end(&lines, start)
    } else {
        indent_block_end(&lines, start)
    };

    let body = lines[start..=end].join("\n");
    let signature = signature_text(&lines, start, language);

    Some(FunctionInfo {
        name: name.to_string(),
        language,
        start_line: start + 1,
        end_line: end + 1,
        parameters: parameter_list(&signature),
        complexity: complexity_estimate(&body),
        signature,
        body,
    })
}

fn definition_patterns(name: &str, language: Language) -> Vec<String> {
    let n = regex::escape(name);
    match language {
        Language::Python => vec![format!(r"^\s*(async\s+)?def\s+{}\s*\(", n)],
        Language::Rust => vec![format!(r"\bfn\s+{}\s*[<(]", n)],
        Language::Go => vec![format!(r"^\s*func\s+(\([^)]*\)\s*)?{}\s*\(", n)],
        Language::JavaScript | Language::TypeScript => vec![
            format!(r"\bfunction\s*\*?\s+{}\s*[<(]", n),
            format!(r"\b(const|let|var)\s+{}\s*(:[^=]+)?=\s*(async\s+)?(function\b|\([^)]*\)\s*(:[^=]+)?=>|\w+\s*=>)", n),
            format!(r"^\s*(public\s+|private\s+|protected\s+|static\s+|async\s+)*{}\s*\([^;]*$", n),
        ],
        _ => vec![format!(r"^[\w\s\*&<>:,\[\]]*\b{}\s*\([^;]*$", n)],
    }
}

fn find_definition_line(lines: &[&str], name: &str, language: Language) -> Option<usize> {
    let patterns: Vec<Regex> = definition_patterns(name, language)
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

    lines.iter().position(|line| {
        let trimmed = line.trim_start();
        let is_comment = trimmed.starts_with("//") || trimmed.starts_with('#');
        !is_comment && patterns.iter().any(|re| re.is_match(line))
    })
}

/// End of a `{ ... }` block opened on or shortly after `start`.
fn brace_block_end(lines: &[&str], start: usize) -> usize {
    let mut depth: i64 = 0;
    let mut opened = false;

    for (idx, line) in lines.iter().enumerate().skip(start) {
        for ch in line.chars() {
            match ch {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return idx;
        }
        // Declarations without a body (prototypes, trait methods).
        if !opened && (line.trim_end().ends_with(';') || idx >= start + 5) {
            return idx;
        }
    }
    lines.len().saturating_sub(1)
}

/// Last line indented deeper than the `def` on `start`.
fn indent_block_end(lines: &[&str], start: usize) -> usize {
    let indent = |l: &str| l.len() - l.trim_start().len();
    let base = indent(lines[start]);
    let mut end = start;

    for (idx, line) in lines.iter().enumerate().skip(start + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent(line) <= base {
            break;
        }
        end = idx;
    }
    end
}

fn signature_text(lines: &[&str], start: usize, language: Language) -> String {
    let terminator = if language.uses_braces() { '{' } else { ':' };
    let mut signature = String::new();
    for line in lines.iter().skip(start).take(6) {
        if !signature.is_empty() {
            signature.push(' ');
        }
        signature.push_str(line.trim());
        if language.uses_braces() && line.contains(terminator) {
            break;
        }
        if !language.uses_braces() && line.trim_end().ends_with(terminator) {
            break;
        }
    }
    signature
        .split('{')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn parameter_list(signature: &str) -> Vec<String> {
    let Some(open) = signature.find('(') else {
        return Vec::new();
    };
    let mut depth = 0usize;
    let mut close = None;
    for (i, ch) in signature[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + i);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        return Vec::new();
    };
    signature[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Rough cyclomatic complexity: one plus the number of decision points.
pub fn complexity_estimate(body: &str) -> usize {
    let Ok(re) = Regex::new(
        r"\b(if|elif|for|while|case|catch|except|match|loop)\b|&&|\|\||\?\s*[^:\s]",
    ) else {
        return 1;
    };
    1 + body
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            !(t.starts_with("//") || t.starts_with('#'))
        })
        .map(|l| re.find_iter(l).count())
        .sum::<usize>()
}

/// Modules imported by a file, in source order. Unsupported languages yield none.
pub fn extract_imports(content: &str, path: &str) -> Vec<String> {
    let patterns: &[&str] = match Language::from_path(path) {
        Language::Python => &[r"^\s*from\s+([\w.]+)\s+import", r"^\s*import\s+([\w.]+)"],
        Language::JavaScript | Language::TypeScript => &[
            r#"^\s*import\s+(?:[^'"]*?\s+from\s+)?['"]([^'"]+)['"]"#,
            r#"require\(\s*['"]([^'"]+)['"]\s*\)"#,
        ],
        Language::Rust => &[
            r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+([\w:]+)",
            r"^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+(\w+)\s*;",
        ],
        Language::Go => &[r#"^\s*(?:import\s+)?(?:\w+\s+)?"([\w./-]+)"\s*$"#],
        Language::Java => &[r"^\s*import\s+(?:static\s+)?([\w.]+)"],
        Language::C | Language::Cpp => &[r#"^\s*#\s*include\s+["<]([^">]+)[">]"#],
        Language::Other => &[],
    };
    let regexes: Vec<Regex> = patterns.iter().filter_map(|p| Regex::new(p).ok()).collect();

    let mut imports = Vec::new();
    for line in content.lines() {
        for re in &regexes {
            if let Some(module) = re.captures(line).and_then(|c| c.get(1)) {
                let module = module.as_str().to_string();
                if !imports.contains(&module) {
                    imports.push(module);
                }
                break;
            }
        }
    }
    imports
}

/// Whether an import string plausibly refers to the file at `target_path`.
pub fn import_refers_to(import: &str, target_path: &str) -> bool {
    let target = Path::new(target_path);
    let Some(stem) = target.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let stem = if matches!(stem, "mod" | "index" | "__init__") {
        target
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|s| s.to_str())
            .unwrap_or(stem)
    } else {
        stem
    };

    import
        .split(|c: char| matches!(c, '.' | '/' | ':' | '\\'))
        .filter(|segment| !segment.is_empty())
        .any(|segment| segment == stem)
}

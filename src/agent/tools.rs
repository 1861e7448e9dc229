//! Tool registry for the analysis agents.
//!
//! This module defines the closed set of repository tools the model can call,
//! their JSON schemas for Ollama's tool-calling API, and the executor that runs
//! a call against a [`RepositoryInspector`]. Execution never fails outright:
//! every problem comes back as an error [`ToolResult`] the model can read.

use crate::error::InspectError;
use crate::repo::inspector::{FileContent, LineRange, RepositoryInspector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Tool definition for Ollama's tool-calling API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A tool call made by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// Result of executing a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(output: String) -> Self {
        Self {
            success: true,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(message),
            duration_ms: 0,
        }
    }

    /// Text handed back to the model in a `tool` message.
    pub fn for_model(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("tool failed"))
        }
    }
}

/// The repository tools, by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    GetRepositoryStructure,
    SearchCode,
    GetFileContent,
    GetDirectoryFiles,
    GetFileHistory,
    GetFileBlame,
    GetCommitDetails,
    FindFileDependencies,
    SearchInFile,
    FindWhenLineWasAdded,
    GetRecentCommits,
    AnalyzeFunction,
}

impl ToolName {
    pub const ALL: [ToolName; 12] = [
        ToolName::GetRepositoryStructure,
        ToolName::SearchCode,
        ToolName::GetFileContent,
        ToolName::GetDirectoryFiles,
        ToolName::GetFileHistory,
        ToolName::GetFileBlame,
        ToolName::GetCommitDetails,
        ToolName::FindFileDependencies,
        ToolName::SearchInFile,
        ToolName::FindWhenLineWasAdded,
        ToolName::GetRecentCommits,
        ToolName::AnalyzeFunction,
    ];

    /// Tools the critique agent may use to spot-check a finding.
    pub const VERIFICATION: [ToolName; 4] = [
        ToolName::GetFileContent,
        ToolName::GetFileBlame,
        ToolName::GetCommitDetails,
        ToolName::SearchInFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::GetRepositoryStructure => "get_repository_structure",
            ToolName::SearchCode => "search_code",
            ToolName::GetFileContent => "get_file_content",
            ToolName::GetDirectoryFiles => "get_directory_files",
            ToolName::GetFileHistory => "get_file_history",
            ToolName::GetFileBlame => "get_file_blame",
            ToolName::GetCommitDetails => "get_commit_details",
            ToolName::FindFileDependencies => "find_file_dependencies",
            ToolName::SearchInFile => "search_in_file",
            ToolName::FindWhenLineWasAdded => "find_when_line_was_added",
            ToolName::GetRecentCommits => "get_recent_commits",
            ToolName::AnalyzeFunction => "analyze_function",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            ToolName::GetRepositoryStructure => "Get the directory structure to understand the project layout.",
            ToolName::SearchCode => "Search file names and contents for a keyword from the error message or stack trace. Returns files ranked by number of matches.",
            ToolName::GetFileContent => "Fetch the content of a file, optionally limited to a line range. Lines are numbered.",
            ToolName::GetDirectoryFiles => "List the files and subdirectories of one directory.",
            ToolName::GetFileHistory => "Get the commits that changed a file, newest first.",
            ToolName::GetFileBlame => "Get line-by-line authorship to find WHO wrote the problematic code and in which commit.",
            ToolName::GetCommitDetails => "Get a commit's author, date, message, changed files and diff.",
            ToolName::FindFileDependencies => "List the modules a file imports and the files that import it.",
            ToolName::SearchInFile => "Search for text or a regular expression within one file. Returns matching line numbers with context.",
            ToolName::FindWhenLineWasAdded => "Find the commit that introduced a specific line, and the commit that last modified it.",
            ToolName::GetRecentCommits => "Get the most recent commits in the repository.",
            ToolName::AnalyzeFunction => "Locate a function in a file and return its signature, line span and a rough complexity metric.",
        }
    }

    fn parameters(&self) -> Value {
        let file_path = json!({"type": "string", "description": "Path to the file relative to the repository root"});
        match self {
            ToolName::GetRepositoryStructure => json!({
                "type": "object",
                "properties": {
                    "max_depth": {"type": "integer", "description": "Maximum depth to traverse (default: 3)"},
                    "path": {"type": "string", "description": "Subdirectory to start from (default: repository root)"}
                },
                "required": []
            }),
            ToolName::SearchCode => json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Keyword to search for"},
                    "path_filter": {"type": "string", "description": "Only search paths containing this text"},
                    "max_results": {"type": "integer", "description": "Maximum number of files (default: 20)"}
                },
                "required": ["query"]
            }),
            ToolName::GetFileContent => json!({
                "type": "object",
                "properties": {
                    "file_path": file_path,
                    "line_start": {"type": "integer", "description": "First line to return (optional)"},
                    "line_end": {"type": "integer", "description": "Last line to return (optional)"}
                },
                "required": ["file_path"]
            }),
            ToolName::GetDirectoryFiles => json!({
                "type": "object",
                "properties": {
                    "directory_path": {"type": "string", "description": "Directory relative to the repository root. Use '' for the root."}
                },
                "required": []
            }),
            ToolName::GetFileHistory => json!({
                "type": "object",
                "properties": {
                    "file_path": file_path,
                    "limit": {"type": "integer", "description": "Number of commits (default: 10)"}
                },
                "required": ["file_path"]
            }),
            ToolName::GetFileBlame => json!({
                "type": "object",
                "properties": {
                    "file_path": file_path,
                    "line_start": {"type": "integer", "description": "Start line (optional)"},
                    "line_end": {"type": "integer", "description": "End line (optional)"}
                },
                "required": ["file_path"]
            }),
            ToolName::GetCommitDetails => json!({
                "type": "object",
                "properties": {
                    "commit_sha": {"type": "string", "description": "Full or abbreviated commit SHA"}
                },
                "required": ["commit_sha"]
            }),
            ToolName::FindFileDependencies => json!({
                "type": "object",
                "properties": {"file_path": file_path},
                "required": ["file_path"]
            }),
            ToolName::SearchInFile => json!({
                "type": "object",
                "properties": {
                    "file_path": file_path,
                    "search_term": {"type": "string", "description": "Text or regular expression to search for"}
                },
                "required": ["file_path", "search_term"]
            }),
            ToolName::FindWhenLineWasAdded => json!({
                "type": "object",
                "properties": {
                    "file_path": file_path,
                    "line_number": {"type": "integer", "description": "Line number in the current version of the file"}
                },
                "required": ["file_path", "line_number"]
            }),
            ToolName::GetRecentCommits => json!({
                "type": "object",
                "properties": {
                    "max_count": {"type": "integer", "description": "Number of commits (default: 10)"}
                },
                "required": []
            }),
            ToolName::AnalyzeFunction => json!({
                "type": "object",
                "properties": {
                    "file_path": file_path,
                    "function_name": {"type": "string", "description": "Name of the function to analyze"}
                },
                "required": ["file_path", "function_name"]
            }),
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: self.as_str().to_string(),
                description: self.description().to_string(),
                parameters: self.parameters(),
            },
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .iter()
            .copied()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| format!("Unknown tool: {}", s))
    }
}

/// Executes tool calls against a repository inspector.
#[derive(Clone)]
pub struct ToolRegistry {
    inspector: Arc<dyn RepositoryInspector>,
    enabled: Vec<ToolName>,
}

impl ToolRegistry {
    /// Registry exposing every tool.
    pub fn new(inspector: Arc<dyn RepositoryInspector>) -> Self {
        Self {
            inspector,
            enabled: ToolName::ALL.to_vec(),
        }
    }

    /// Registry exposing only `tools`.
    pub fn subset(inspector: Arc<dyn RepositoryInspector>, tools: &[ToolName]) -> Self {
        Self {
            inspector,
            enabled: tools.to_vec(),
        }
    }

    pub fn inspector(&self) -> &Arc<dyn RepositoryInspector> {
        &self.inspector
    }

    pub fn tools(&self) -> &[ToolName] {
        &self.enabled
    }

    /// Tool definitions for the Ollama API.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.enabled.iter().map(ToolName::definition).collect()
    }

    /// Execute a tool call and return the result.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let name = call.function.name.as_str();
        let args = normalize_arguments(&call.function.arguments);
        debug!("Executing tool: {} with args: {}", name, args);

        let tool = match name.parse::<ToolName>() {
            Ok(tool) if self.enabled.contains(&tool) => tool,
            _ => {
                let available: Vec<&str> = self.enabled.iter().map(ToolName::as_str).collect();
                return ToolResult::error(format!(
                    "Unknown tool: {}. Available tools: {}",
                    name,
                    available.join(", ")
                ));
            }
        };

        let started = Instant::now();
        let mut result = match self.dispatch(tool, &args).await {
            Ok(output) => ToolResult::success(output),
            Err(ToolFailure::Arguments(message)) => ToolResult::error(message),
            Err(ToolFailure::Inspect(err)) => {
                debug!("Tool {} failed: {}", name, err);
                ToolResult::error(err.public_message())
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "Tool {} executed in {}ms ({})",
            name,
            result.duration_ms,
            if result.success { "ok" } else { "error" }
        );
        result
    }

    async fn dispatch(&self, tool: ToolName, args: &Value) -> Result<String, ToolFailure> {
        let repo = &self.inspector;
        match tool {
            ToolName::GetRepositoryStructure => {
                let depth = opt_usize(args, "max_depth")?.unwrap_or(3);
                let path = opt_str(args, "path").unwrap_or_default();
                render(&repo.repository_structure(depth, path).await?)
            }
            ToolName::SearchCode => {
                let query = required_str(args, "query")?;
                let filter = opt_str(args, "path_filter");
                let max = opt_usize(args, "max_results")?.unwrap_or(20);
                render(&repo.search_code(query, filter, max).await?)
            }
            ToolName::GetFileContent => {
                let path = required_str(args, "file_path")?;
                let range = line_range(args)?;
                Ok(render_file(&repo.file_content(path, range).await?))
            }
            ToolName::GetDirectoryFiles => {
                let path = opt_str(args, "directory_path").unwrap_or_default();
                render(&repo.directory_files(path).await?)
            }
            ToolName::GetFileHistory => {
                let path = required_str(args, "file_path")?;
                let limit = opt_usize(args, "limit")?.unwrap_or(10);
                render(&repo.file_history(path, limit).await?)
            }
            ToolName::GetFileBlame => {
                let path = required_str(args, "file_path")?;
                let range = line_range(args)?;
                render(&repo.file_blame(path, range).await?)
            }
            ToolName::GetCommitDetails => {
                let id = required_str(args, "commit_sha")?;
                render(&repo.commit_details(id).await?)
            }
            ToolName::FindFileDependencies => {
                let path = required_str(args, "file_path")?;
                render(&repo.file_dependencies(path).await?)
            }
            ToolName::SearchInFile => {
                let path = required_str(args, "file_path")?;
                let term = required_str(args, "search_term")?;
                render(&repo.search_in_file(path, term).await?)
            }
            ToolName::FindWhenLineWasAdded => {
                let path = required_str(args, "file_path")?;
                let line = match opt_usize(args, "line_number")? {
                    Some(line) => line,
                    // Accept the array form some models send.
                    None => args
                        .get("line_numbers")
                        .and_then(Value::as_array)
                        .and_then(|lines| lines.first())
                        .and_then(Value::as_u64)
                        .map(|n| n as usize)
                        .ok_or_else(|| missing("line_number"))?,
                };
                render(&repo.line_origin(path, line).await?)
            }
            ToolName::GetRecentCommits => {
                let max = opt_usize(args, "max_count")?.unwrap_or(10);
                render(&repo.recent_commits(max).await?)
            }
            ToolName::AnalyzeFunction => {
                let path = required_str(args, "file_path")?;
                let name = required_str(args, "function_name")?;
                render(&repo.analyze_function(path, name).await?)
            }
        }
    }
}

enum ToolFailure {
    Arguments(String),
    Inspect(InspectError),
}

impl From<InspectError> for ToolFailure {
    fn from(err: InspectError) -> Self {
        ToolFailure::Inspect(err)
    }
}

/// Some models send arguments as a JSON-encoded string.
fn normalize_arguments(args: &Value) -> Value {
    match args {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
        other => other.clone(),
    }
}

fn missing(key: &str) -> ToolFailure {
    ToolFailure::Arguments(format!("Missing required parameter: {}", key))
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolFailure> {
    opt_str(args, key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| missing(key))
}

fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn opt_usize(args: &Value, key: &str) -> Result<Option<usize>, ToolFailure> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(|v| Some(v as usize)).ok_or_else(|| {
            ToolFailure::Arguments(format!("Parameter {} must be a non-negative integer", key))
        }),
        // Numbers as strings are common in model output.
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| {
            ToolFailure::Arguments(format!("Parameter {} must be a non-negative integer", key))
        }),
        Some(_) => Err(ToolFailure::Arguments(format!(
            "Parameter {} must be a non-negative integer",
            key
        ))),
    }
}

fn line_range(args: &Value) -> Result<Option<LineRange>, ToolFailure> {
    let start = opt_usize(args, "line_start")?;
    let end = opt_usize(args, "line_end")?;
    match (start, end) {
        (None, None) => Ok(None),
        (start, end) => {
            let start = start.unwrap_or(1);
            let end = end.unwrap_or(usize::MAX);
            LineRange::new(start, end)
                .map(Some)
                .map_err(|e| ToolFailure::Arguments(e.to_string()))
        }
    }
}

fn render<T: Serialize>(value: &T) -> Result<String, ToolFailure> {
    serde_json::to_string_pretty(value)
        .map_err(|_| ToolFailure::Arguments("tool output could not be encoded".to_string()))
}

/// File content with line numbers, so the model can cite exact lines.
fn render_file(file: &FileContent) -> String {
    let mut out = format!(
        "{} (lines {}-{} of {}{})\n",
        file.path,
        file.start_line,
        file.end_line,
        file.total_lines,
        if file.truncated { ", truncated" } else { "" }
    );
    for (offset, line) in file.content.lines().enumerate() {
        out.push_str(&format!("{:>5} | {}\n", file.start_line + offset, line));
    }
    out
}

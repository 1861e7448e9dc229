//! Error types shared across the analysis pipeline.
//!
//! Only [`ConfigError`], [`EnvelopeError`] and [`OrchestratorError`] ever reach
//! the caller. Model and repository failures are absorbed by the agents and
//! turned into data (error tool results, low-confidence findings).

use std::time::Duration;
use thiserror::Error;

/// Failure talking to the language model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("model request timed out after {0}s")]
    Timeout(u64),

    #[error("cannot connect to model endpoint at {0}")]
    Connect(String),

    #[error("model endpoint rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("model API error {status}: {body}")]
    Http { status: u16, body: String },

    /// The endpoint answered, but the payload was not a usable chat reply.
    #[error("malformed model response: {0}")]
    Malformed(String),

    #[error("model request failed: {0}")]
    Transport(String),
}

impl ModelError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Timeout(_)
            | ModelError::Connect(_)
            | ModelError::RateLimited { .. }
            | ModelError::Transport(_) => true,
            ModelError::Http { status, .. } => *status >= 500,
            ModelError::Malformed(_) => false,
        }
    }

    /// Server-provided delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Failure of a single repository-inspection operation.
#[derive(Error, Debug)]
pub enum InspectError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} is a binary file")]
    Binary(String),

    #[error("line {line} not found in {path}")]
    LineNotFound { path: String, line: usize },

    #[error("no matching function `{name}` in {path}")]
    FunctionNotFound { path: String, name: String },

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repository worker failed: {0}")]
    Worker(String),
}

impl InspectError {
    /// Message safe to hand to the model: no raw library error text.
    pub fn public_message(&self) -> String {
        match self {
            InspectError::Git(e) => match e.code() {
                git2::ErrorCode::NotFound => "requested object was not found".to_string(),
                git2::ErrorCode::Ambiguous => "object reference is ambiguous".to_string(),
                git2::ErrorCode::InvalidSpec => "object reference is invalid".to_string(),
                _ => format!("repository lookup failed ({:?})", e.class()),
            },
            InspectError::Io(_) => "repository storage could not be read".to_string(),
            InspectError::Worker(_) => "repository operation was interrupted".to_string(),
            other => other.to_string(),
        }
    }
}

/// A malformed or unsupported inter-agent message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("expected a {expected} message, got {actual}")]
    WrongMessageType { expected: String, actual: String },

    #[error("unsupported task: {task}. Supported: {}", .supported.join(", "))]
    UnsupportedTask {
        task: String,
        supported: Vec<String>,
    },

    #[error("invalid task data: {0}")]
    InvalidData(String),
}

/// Bug report rejected at construction time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BugReportError {
    #[error("bug report is missing a title")]
    MissingTitle,

    #[error("bug report is missing a description")]
    MissingDescription,
}

/// Startup configuration problem. Fatal before any session begins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no repository specified: pass --repo <URL> or --local <DIR>, or set [repository] in the config file")]
    MissingRepository,

    #[error("model URL must start with 'http://' or 'https://': {0}")]
    InvalidModelUrl(String),

    #[error("{field} must be {constraint}")]
    OutOfRange {
        field: &'static str,
        constraint: &'static str,
    },
}

/// Failure surfaced by the refinement orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("agent '{agent}' rejected task '{task}': {message}")]
    AgentRejected {
        agent: String,
        task: String,
        message: String,
    },

    #[error("agent '{agent}' returned an unreadable '{task}' result: {source}")]
    BadPayload {
        agent: String,
        task: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_error_retryable() {
        assert!(ModelError::Timeout(30).is_retryable());
        assert!(ModelError::RateLimited { retry_after: None }.is_retryable());
        assert!(ModelError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!ModelError::Http {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!ModelError::Malformed("x".into()).is_retryable());
    }

    #[test]
    fn test_git_errors_are_sanitized() {
        let raw = git2::Error::new(
            git2::ErrorCode::NotFound,
            git2::ErrorClass::Odb,
            "odb: cannot read object deadbeef; class=Odb (9); code=NotFound (-3)",
        );
        let message = InspectError::Git(raw).public_message();
        assert_eq!(message, "requested object was not found");
        assert!(!message.contains("class="));
    }

    #[test]
    fn test_unsupported_task_lists_supported() {
        let err = EnvelopeError::UnsupportedTask {
            task: "dance".into(),
            supported: vec!["analyze_bug".into(), "improve_analysis".into()],
        };
        assert_eq!(
            err.to_string(),
            "unsupported task: dance. Supported: analyze_bug, improve_analysis"
        );
    }
}

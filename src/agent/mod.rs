//! LLM agents for root cause analysis.
//!
//! Agents are addressed through message envelopes: the orchestrator sends a
//! [`RequestEnvelope`] naming a task and gets a [`ResponseEnvelope`] back. An
//! agent only has to implement [`Agent::handle_task`]; validation of the task
//! name and wrapping of the result are shared.

pub mod agent_loop;
pub mod critique;
pub mod finding;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod retry;
pub mod tools;

pub use agent_loop::{AnalysisAgent, AnalysisConfig};
pub use critique::{CritiqueAgent, CritiqueConfig};
pub use llm::{ChatModel, ModelSettings, OllamaClient};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use retry::RetryPolicy;
pub use tools::ToolRegistry;

use crate::error::EnvelopeError;
use crate::message::{RequestEnvelope, ResponseEnvelope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// What an agent reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub supported_tasks: Vec<String>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn agent_id(&self) -> &str;

    fn description(&self) -> &str;

    fn capabilities(&self) -> &[&'static str];

    fn supported_tasks(&self) -> &[&'static str];

    /// Run a task whose name is already known to be supported.
    async fn handle_task(&self, request: &RequestEnvelope) -> Result<Value, EnvelopeError>;

    fn info(&self) -> AgentInfo {
        AgentInfo {
            agent_id: self.agent_id().to_string(),
            description: self.description().to_string(),
            capabilities: self.capabilities().iter().map(|c| c.to_string()).collect(),
            supported_tasks: self.supported_tasks().iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Answer a request. Failures come back as `status = error` responses.
    async fn process(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let task = request.task();
        if request.recipient_id() != self.agent_id() {
            debug!(
                "{} received a request addressed to {}",
                self.agent_id(),
                request.recipient_id()
            );
        }

        if !self.supported_tasks().contains(&task) {
            let err = EnvelopeError::UnsupportedTask {
                task: task.to_string(),
                supported: self.supported_tasks().iter().map(|t| t.to_string()).collect(),
            };
            warn!("{}: {}", self.agent_id(), err);
            return ResponseEnvelope::failure(
                self.agent_id(),
                request.sender_id(),
                Some(request.message_id().to_string()),
                err,
            );
        }

        match self.handle_task(request).await {
            Ok(result) => ResponseEnvelope::success(self.agent_id(), request, result),
            Err(err) => {
                warn!("{} failed task {}: {}", self.agent_id(), task, err);
                ResponseEnvelope::failure(
                    self.agent_id(),
                    request.sender_id(),
                    Some(request.message_id().to_string()),
                    err,
                )
            }
        }
    }

    /// Answer a request that arrived as raw JSON.
    async fn process_value(&self, value: Value) -> ResponseEnvelope {
        let sender = value
            .get("sender_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let message_id = value
            .get("message_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        match RequestEnvelope::from_value(value) {
            Ok(request) => self.process(&request).await,
            Err(err) => {
                warn!("{} rejected a malformed request: {}", self.agent_id(), err);
                ResponseEnvelope::failure(self.agent_id(), sender, message_id, err)
            }
        }
    }
}

/// Encode a task result for a response envelope.
pub(crate) fn to_payload<T: Serialize>(value: &T) -> Result<Value, EnvelopeError> {
    serde_json::to_value(value).map_err(|e| EnvelopeError::InvalidData(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{task_data, ResponseContent};
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Agent for Echo {
        fn agent_id(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Returns its task data"
        }

        fn capabilities(&self) -> &[&'static str] {
            &["echo"]
        }

        fn supported_tasks(&self) -> &[&'static str] {
            &["echo", "fail"]
        }

        async fn handle_task(&self, request: &RequestEnvelope) -> Result<Value, EnvelopeError> {
            match request.task() {
                "echo" => Ok(Value::Object(request.data().clone())),
                _ => Err(EnvelopeError::InvalidData("asked to fail".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_supported_task_succeeds() {
        let request = RequestEnvelope::new("tester", "echo", "echo", task_data([("x", json!(1))]));
        let response = Echo.process(&request).await;
        assert!(response.is_success());
        assert_eq!(response.in_reply_to(), Some(request.message_id()));
        assert_eq!(response.into_result().unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn test_unsupported_task_lists_supported_tasks() {
        let request = RequestEnvelope::new("tester", "echo", "dance", Default::default());
        let response = Echo.process(&request).await;
        assert!(!response.is_success());
        match response.content() {
            ResponseContent::Error(message) => {
                assert!(message.contains("dance"));
                assert!(message.contains("echo, fail"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_task_error_becomes_error_response() {
        let request = RequestEnvelope::new("tester", "echo", "fail", Default::default());
        let response = Echo.process(&request).await;
        assert_eq!(response.recipient_id(), "tester");
        assert!(response.into_result().unwrap_err().contains("asked to fail"));
    }

    #[tokio::test]
    async fn test_malformed_request_value() {
        let response = Echo
            .process_value(json!({"sender_id": "tester", "content": {"task": "echo"}}))
            .await;
        assert!(!response.is_success());
        assert_eq!(response.recipient_id(), "tester");
        assert!(response.in_reply_to().is_none());
    }

    #[test]
    fn test_info() {
        let info = Echo.info();
        assert_eq!(info.agent_id, "echo");
        assert_eq!(info.supported_tasks, vec!["echo", "fail"]);
    }
}

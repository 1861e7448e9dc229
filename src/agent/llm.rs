//! Language-model client.
//!
//! The agents talk to the model through [`ChatModel`]. [`OllamaClient`] is the
//! production implementation over Ollama's `/api/chat` endpoint.

use crate::agent::retry::RetryPolicy;
use crate::agent::tools::{ToolCall, ToolDefinition};
use crate::error::ModelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Message in the chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Which tool produced a `tool` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCall>>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role("assistant", content)
        }
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(name.into()),
            ..Self::with_role("tool", content)
        }
    }
}

/// What the model answered.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// The model wants tools run before it continues.
    ToolCalls {
        content: String,
        calls: Vec<ToolCall>,
    },
    /// The model's final text answer.
    Final(String),
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    /// One chat turn. `tools` may be empty to force a text answer.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelReply, ModelError>;
}

/// Connection settings for the Ollama client.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.1,
            timeout_seconds: 300,
        }
    }
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    stream: bool,
    options: OllamaOptions,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

impl From<ResponseMessage> for ModelReply {
    fn from(message: ResponseMessage) -> Self {
        match message.tool_calls {
            Some(calls) if !calls.is_empty() => ModelReply::ToolCalls {
                content: message.content,
                calls,
            },
            _ => ModelReply::Final(message.content),
        }
    }
}

/// Client for a local or remote Ollama server.
pub struct OllamaClient {
    settings: ModelSettings,
    http_client: reqwest::Client,
    retry: RetryPolicy,
}

impl OllamaClient {
    pub fn new(settings: ModelSettings, retry: RetryPolicy) -> Result<Self, ModelError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        Ok(Self {
            settings,
            http_client,
            retry,
        })
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelReply, ModelError> {
        let url = format!("{}/api/chat", self.settings.ollama_url.trim_end_matches('/'));
        let request = OllamaChatRequest {
            model: &self.settings.model_name,
            messages,
            tools,
            stream: false,
            options: OllamaOptions {
                temperature: self.settings.temperature,
            },
        };

        debug!(
            "Sending chat request with {} messages and {} tools",
            messages.len(),
            tools.len()
        );

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(self.settings.timeout_seconds)
                } else if e.is_connect() {
                    ModelError::Connect(self.settings.ollama_url.clone())
                } else {
                    ModelError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(ModelError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        parse_chat_response(&body)
    }
}

#[async_trait]
impl ChatModel for OllamaClient {
    fn name(&self) -> &str {
        &self.settings.model_name
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelReply, ModelError> {
        self.retry
            .run("model request", move || self.chat_once(messages, tools))
            .await
    }
}

fn parse_chat_response(body: &str) -> Result<ModelReply, ModelError> {
    let response: OllamaChatResponse =
        serde_json::from_str(body).map_err(|e| ModelError::Malformed(e.to_string()))?;
    Ok(response.message.into())
}

/// `Retry-After` in delta-seconds form.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tool_call_response() {
        let body = json!({
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    {"function": {"name": "get_file_content", "arguments": {"file_path": "src/lib.rs"}}}
                ]
            },
            "done": true
        })
        .to_string();

        match parse_chat_response(&body).unwrap() {
            ModelReply::ToolCalls { calls, .. } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].function.name, "get_file_content");
                assert_eq!(calls[0].function.arguments["file_path"], "src/lib.rs");
            }
            other => panic!("expected tool calls, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_final_response() {
        let body = r#"{"message": {"role": "assistant", "content": "File: a.rs", "tool_calls": []}, "done": true}"#;
        assert_eq!(
            parse_chat_response(body).unwrap(),
            ModelReply::Final("File: a.rs".to_string())
        );
    }

    #[test]
    fn test_parse_malformed_response() {
        let err = parse_chat_response("<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, ModelError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_request_omits_empty_tools() {
        let messages = vec![ChatMessage::user("hi")];
        let request = OllamaChatRequest {
            model: "m",
            messages: &messages,
            tools: &[],
            stream: false,
            options: OllamaOptions { temperature: 0.1 },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("tools").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
        assert!(value["messages"][0].get("tool_calls").is_none());
    }

    #[test]
    fn test_tool_message_carries_name() {
        let msg = ChatMessage::tool("search_code", "[]");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_name"], "search_code");
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test]
    async fn test_connection_failure_is_reported() {
        let settings = ModelSettings {
            // Port 9 (discard) is closed on test machines.
            ollama_url: "http://127.0.0.1:9".to_string(),
            timeout_seconds: 2,
            ..ModelSettings::default()
        };
        let client = OllamaClient::new(settings, RetryPolicy::none()).unwrap();
        let err = client
            .chat(&[ChatMessage::user("hi")], &[])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}

//! Inter-agent message envelopes.
//!
//! Every agent invocation travels as a [`RequestEnvelope`] and comes back as a
//! [`ResponseEnvelope`]. Envelopes are plain values: they are built once per
//! hop and never modified afterwards, so all fields are read through accessors.
//!
//! Wire shape:
//!
//! ```json
//! { "message_id": "...", "sender_id": "orchestrator", "recipient_id": "rca_agent",
//!   "message_type": "task_request",
//!   "content": { "task": "analyze_bug", "data": { ... } },
//!   "timestamp": "2026-01-01T00:00:00Z" }
//! ```
//!
//! Responses use `"message_type": "task_response"`, add `"status"` and carry
//! either `content.result` or `content.error`.

use crate::error::EnvelopeError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::TaskRequest => write!(f, "task_request"),
            MessageType::TaskResponse => write!(f, "task_response"),
        }
    }
}

/// Task name plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContent {
    pub task: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// A request for an agent to perform a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    message_id: String,
    sender_id: String,
    recipient_id: String,
    message_type: MessageType,
    content: TaskContent,
    timestamp: DateTime<Utc>,
}

impl RequestEnvelope {
    /// Build a new request with a fresh message id.
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        task: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            message_type: MessageType::TaskRequest,
            content: TaskContent {
                task: task.into(),
                data,
            },
            timestamp: Utc::now(),
        }
    }

    /// Decode and validate a request received as JSON.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let envelope: RequestEnvelope = serde_json::from_value(value)
            .map_err(|e| EnvelopeError::InvalidFormat(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| EnvelopeError::InvalidFormat(e.to_string()))?;
        Self::from_value(value)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.message_type != MessageType::TaskRequest {
            return Err(EnvelopeError::WrongMessageType {
                expected: MessageType::TaskRequest.to_string(),
                actual: self.message_type.to_string(),
            });
        }
        for (field, value) in [
            ("message_id", &self.message_id),
            ("sender_id", &self.sender_id),
            ("recipient_id", &self.recipient_id),
            ("content.task", &self.content.task),
        ] {
            if value.trim().is_empty() {
                return Err(EnvelopeError::InvalidFormat(format!(
                    "field '{}' is empty",
                    field
                )));
            }
        }
        Ok(())
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn recipient_id(&self) -> &str {
        &self.recipient_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn task(&self) -> &str {
        &self.content.task
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.content.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Decode a required entry of the task data.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<T, EnvelopeError> {
        self.optional_field(key)?
            .ok_or_else(|| EnvelopeError::InvalidData(format!("missing '{}' in task data", key)))
    }

    /// Decode an optional entry of the task data. `null` counts as absent.
    pub fn optional_field<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, EnvelopeError> {
        match self.content.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| EnvelopeError::InvalidData(format!("'{}': {}", key, e))),
        }
    }
}

/// Outcome flag of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Body of a response: a result payload or an error string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseContent {
    Result(Value),
    Error(String),
}

/// An agent's answer to a [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    message_id: String,
    sender_id: String,
    recipient_id: String,
    message_type: MessageType,
    status: ResponseStatus,
    content: ResponseContent,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    in_reply_to: Option<String>,
}

impl ResponseEnvelope {
    /// Successful reply to `request`.
    pub fn success(sender_id: impl Into<String>, request: &RequestEnvelope, result: Value) -> Self {
        Self {
            message_id: new_message_id(),
            sender_id: sender_id.into(),
            recipient_id: request.sender_id.clone(),
            message_type: MessageType::TaskResponse,
            status: ResponseStatus::Success,
            content: ResponseContent::Result(result),
            timestamp: Utc::now(),
            in_reply_to: Some(request.message_id.clone()),
        }
    }

    /// Error reply. `in_reply_to` is absent when the request itself was unreadable.
    pub fn failure(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        in_reply_to: Option<String>,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            message_type: MessageType::TaskResponse,
            status: ResponseStatus::Error,
            content: ResponseContent::Error(error.to_string()),
            timestamp: Utc::now(),
            in_reply_to,
        }
    }

    /// Decode and validate a response received as JSON.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let envelope: ResponseEnvelope = serde_json::from_value(value)
            .map_err(|e| EnvelopeError::InvalidFormat(e.to_string()))?;
        if envelope.message_type != MessageType::TaskResponse {
            return Err(EnvelopeError::WrongMessageType {
                expected: MessageType::TaskResponse.to_string(),
                actual: envelope.message_type.to_string(),
            });
        }
        let consistent = matches!(
            (envelope.status, &envelope.content),
            (ResponseStatus::Success, ResponseContent::Result(_))
                | (ResponseStatus::Error, ResponseContent::Error(_))
        );
        if !consistent {
            return Err(EnvelopeError::InvalidFormat(
                "status does not match content".to_string(),
            ));
        }
        Ok(envelope)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn recipient_id(&self) -> &str {
        &self.recipient_id
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn content(&self) -> &ResponseContent {
        &self.content
    }

    pub fn in_reply_to(&self) -> Option<&str> {
        self.in_reply_to.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Consume the envelope, yielding the payload or the error text.
    pub fn into_result(self) -> Result<Value, String> {
        match self.content {
            ResponseContent::Result(value) => Ok(value),
            ResponseContent::Error(message) => Err(message),
        }
    }
}

fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Build task data from `(key, value)` pairs.
pub fn task_data<I, K>(entries: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> RequestEnvelope {
        RequestEnvelope::new(
            "orchestrator",
            "rca_agent",
            "analyze_bug",
            task_data([("bug_report", json!({"title": "t", "description": "d"}))]),
        )
    }

    #[test]
    fn test_request_round_trip() {
        let request = sample_request();
        let json = serde_json::to_string(&request).unwrap();
        let decoded = RequestEnvelope::from_json(&json).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_request_wire_shape() {
        let value = serde_json::to_value(sample_request()).unwrap();
        assert_eq!(value["message_type"], "task_request");
        assert_eq!(value["content"]["task"], "analyze_bug");
        assert_eq!(value["content"]["data"]["bug_report"]["title"], "t");
        assert!(value["message_id"].as_str().unwrap().starts_with("msg_"));
    }

    #[test]
    fn test_message_ids_are_unique() {
        assert_ne!(sample_request().message_id(), sample_request().message_id());
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let raw = json!({
            "sender_id": "orchestrator",
            "recipient_id": "rca_agent",
            "message_type": "task_request",
            "content": {"task": "analyze_bug"},
            "timestamp": "2026-01-01T00:00:00Z"
        });
        let err = RequestEnvelope::from_value(raw).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidFormat(_)));
    }

    #[test]
    fn test_response_as_request_is_rejected() {
        let mut value = serde_json::to_value(sample_request()).unwrap();
        value["message_type"] = json!("task_response");
        let err = RequestEnvelope::from_value(value).unwrap_err();
        assert!(matches!(err, EnvelopeError::WrongMessageType { .. }));
    }

    #[test]
    fn test_response_wire_shape() {
        let request = sample_request();
        let ok = ResponseEnvelope::success("rca_agent", &request, json!({"x": 1}));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["content"]["result"]["x"], 1);
        assert_eq!(value["recipient_id"], "orchestrator");
        assert_eq!(ok.in_reply_to(), Some(request.message_id()));

        let err = ResponseEnvelope::failure("rca_agent", "orchestrator", None, "boom");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["content"]["error"], "boom");

        let decoded = ResponseEnvelope::from_value(value).unwrap();
        assert_eq!(decoded, err);
    }

    #[test]
    fn test_inconsistent_response_is_rejected() {
        let request = sample_request();
        let mut value =
            serde_json::to_value(ResponseEnvelope::success("a", &request, json!(1))).unwrap();
        value["status"] = json!("error");
        assert!(ResponseEnvelope::from_value(value).is_err());
    }

    #[test]
    fn test_field_access() {
        let request = sample_request();
        let bug: Value = request.field("bug_report").unwrap();
        assert_eq!(bug["description"], "d");
        assert!(request.optional_field::<u32>("max_iterations").unwrap().is_none());
        assert!(matches!(
            request.field::<Value>("verdict"),
            Err(EnvelopeError::InvalidData(_))
        ));
    }
}

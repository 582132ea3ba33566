//! Wire types shared by the relay server and its clients.
//!
//! Every JSON body uses camelCase field names. Stream messages are tagged
//! by `type`, and a log entry is the message with its `index` inlined, so
//! the on-disk record, the live NDJSON line and a resumed message all have
//! the same shape.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Content type of the live `POST /v1/chat` response.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Lifecycle of a registered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// Status as reported to clients. `NotFound` is a valid answer, not an
/// error: the request expired or never existed and must not be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    InProgress,
    Completed,
    Failed,
    Aborted,
    NotFound,
}

impl ReportedStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl From<RequestStatus> for ReportedStatus {
    fn from(value: RequestStatus) -> Self {
        match value {
            RequestStatus::InProgress => Self::InProgress,
            RequestStatus::Completed => Self::Completed,
            RequestStatus::Failed => Self::Failed,
            RequestStatus::Aborted => Self::Aborted,
        }
    }
}

/// One message produced for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Data { payload: Value },
    Done,
    Error { reason: String },
    Aborted,
}

impl StreamMessage {
    pub fn data(payload: impl Into<Value>) -> Self {
        Self::Data {
            payload: payload.into(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
        }
    }

    /// The status this message settles its request into, if it is terminal.
    pub fn terminal_status(&self) -> Option<RequestStatus> {
        match self {
            Self::Data { .. } => None,
            Self::Done => Some(RequestStatus::Completed),
            Self::Error { .. } => Some(RequestStatus::Failed),
            Self::Aborted => Some(RequestStatus::Aborted),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LogEntry {
    pub index: u64,
    #[serde(flatten)]
    pub message: StreamMessage,
}

impl LogEntry {
    pub fn new(index: u64, message: StreamMessage) -> Self {
        Self { index, message }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl ChatRequest {
    pub fn new(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request_id: request_id.into(),
            session_id: None,
            allowed_tools: None,
            working_directory: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub request_id: String,
    pub status: ReportedStatus,
    pub total_messages: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl StatusResponse {
    pub fn not_found(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: ReportedStatus::NotFound,
            total_messages: 0,
            last_updated: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResumeQuery {
    pub from_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<LogEntry>,
    pub total_messages: u64,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AbortResponse {
    pub request_id: String,
    /// Whether a live request was found and signalled.
    pub aborted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_entry_inlines_index_and_tag() {
        let entry = LogEntry::new(0, StreamMessage::data("a"));
        insta::assert_json_snapshot!(entry, @r###"
        {
          "index": 0,
          "type": "data",
          "payload": "a"
        }
        "###);

        let parsed: LogEntry =
            serde_json::from_value(json!({"type": "error", "reason": "boom", "index": 3}))
                .expect("parse error entry");
        assert_eq!(parsed, LogEntry::new(3, StreamMessage::error("boom")));
    }

    #[test]
    fn terminal_messages_map_to_statuses() {
        assert_eq!(StreamMessage::data(1).terminal_status(), None);
        assert_eq!(
            StreamMessage::Done.terminal_status(),
            Some(RequestStatus::Completed)
        );
        assert_eq!(
            StreamMessage::error("x").terminal_status(),
            Some(RequestStatus::Failed)
        );
        assert_eq!(
            StreamMessage::Aborted.terminal_status(),
            Some(RequestStatus::Aborted)
        );
    }

    #[test]
    fn not_found_status_serializes_snake_case() {
        let value = serde_json::to_value(StatusResponse::not_found("unknown-id"))
            .expect("serialize status");
        assert_eq!(
            value,
            json!({
                "requestId": "unknown-id",
                "status": "not_found",
                "totalMessages": 0,
                "lastUpdated": null
            })
        );
    }

    #[test]
    fn chat_request_accepts_minimal_body() {
        let request: ChatRequest =
            serde_json::from_value(json!({"message": "hi", "requestId": "r1"}))
                .expect("parse chat request");
        assert_eq!(request.request_id, "r1");
        assert!(request.session_id.is_none());
        assert!(request.allowed_tools.is_none());
    }
}

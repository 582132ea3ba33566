use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    DuplicateRequest,
    UnsupportedMediaType,
    StorageFailure,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:chat-relay:error:invalid_request",
            Self::DuplicateRequest => "urn:chat-relay:error:duplicate_request",
            Self::UnsupportedMediaType => "urn:chat-relay:error:unsupported_media_type",
            Self::StorageFailure => "urn:chat-relay:error:storage_failure",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::DuplicateRequest => "Duplicate Request",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::StorageFailure => "Storage Failure",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::DuplicateRequest => 409,
            Self::UnsupportedMediaType => 415,
            Self::StorageFailure => 500,
        }
    }
}

/// RFC 7807 body returned by every failing HTTP handler.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }

    /// Recovers the error type from the URN, if it is one of ours.
    pub fn error_type(&self) -> Option<ErrorType> {
        [
            ErrorType::InvalidRequest,
            ErrorType::DuplicateRequest,
            ErrorType::UnsupportedMediaType,
            ErrorType::StorageFailure,
        ]
        .into_iter()
        .find(|error_type| error_type.as_urn() == self.type_)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("request already registered: {request_id}")]
    DuplicateRequest { request_id: String },
    #[error("unsupported media type: {message}")]
    UnsupportedMediaType { message: String },
    #[error("storage failure: {message}")]
    StorageFailure {
        request_id: Option<String>,
        message: String,
    },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::DuplicateRequest { .. } => ErrorType::DuplicateRequest,
            Self::UnsupportedMediaType { .. } => ErrorType::UnsupportedMediaType,
            Self::StorageFailure { .. } => ErrorType::StorageFailure,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::DuplicateRequest { request_id } => Some(request_id),
            Self::StorageFailure { request_id, .. } => request_id.as_deref(),
            Self::InvalidRequest { .. } | Self::UnsupportedMediaType { .. } => None,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        if let Some(request_id) = self.request_id() {
            problem
                .extensions
                .insert("requestId".to_string(), Value::String(request_id.to_string()));
        }
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}

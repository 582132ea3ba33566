use std::io;
use std::time::Duration;

use chat_relay_error::ProblemDetails;
use chat_relay_protocol::{
    AbortRequest, AbortResponse, ChatRequest, LogEntry, ResumeResponse, StatusResponse,
    NDJSON_CONTENT_TYPE,
};
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Response, StatusCode};
use thiserror::Error;

use crate::ndjson::{decode_entries, MAX_LINE_BYTES};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2470";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Live entries of one turn, in arrival order.
pub type LiveEntries = BoxStream<'static, Result<LogEntry, ClientError>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("reading stream from {url} failed: {source}")]
    Stream {
        url: String,
        #[source]
        source: io::Error,
    },
    #[error("connection lost: {reason}")]
    Disconnected { reason: String },
    #[error("server answered {status}: {}", describe_problem(.problem, .body))]
    Http {
        status: u16,
        problem: Option<ProblemDetails>,
        body: String,
    },
    #[error("invalid response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ClientError {
    /// Transport-level failures that a resume can repair. Anything the
    /// server answered deliberately is not one of them.
    pub fn is_network(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                !(source.is_builder() || source.is_redirect() || source.is_status())
            }
            Self::Stream { .. } | Self::Disconnected { .. } => true,
            Self::Http { .. } | Self::Decode { .. } => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn describe_problem(problem: &Option<ProblemDetails>, body: &str) -> String {
    match problem {
        Some(problem) => problem
            .detail
            .clone()
            .unwrap_or_else(|| problem.title.clone()),
        None if body.is_empty() => "empty body".to_string(),
        None => body.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ChatClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|source| ClientError::Transport {
                url: endpoint.clone(),
                source,
            })?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.endpoint, path)
    }

    /// Starts a turn and returns its live entries. The stream ends with an
    /// error if the connection drops; a clean end without a terminal entry
    /// is left for the caller to judge.
    pub async fn chat(&self, request: &ChatRequest) -> Result<LiveEntries, ClientError> {
        let url = self.url("/chat");
        let response = self
            .http
            .post(&url)
            .header(ACCEPT, NDJSON_CONTENT_TYPE)
            .json(request)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.clone(),
                source,
            })?;
        let response = check_status(response).await?;

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(io::Error::other));
        let entries = decode_entries(chunks, MAX_LINE_BYTES).map(move |item| {
            item.map_err(|source| ClientError::Stream {
                url: url.clone(),
                source,
            })
        });
        Ok(entries.boxed())
    }

    pub async fn status(&self, request_id: &str) -> Result<StatusResponse, ClientError> {
        let url = self.url(&format!("/status/{request_id}"));
        let response = self
            .http
            .get(&url)
            .timeout(POLL_TIMEOUT)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.clone(),
                source,
            })?;
        read_json(check_status(response).await?, url).await
    }

    pub async fn resume(
        &self,
        request_id: &str,
        from_index: u64,
    ) -> Result<ResumeResponse, ClientError> {
        let url = self.url(&format!("/resume/{request_id}"));
        let response = self
            .http
            .get(&url)
            .query(&[("fromIndex", from_index)])
            .timeout(POLL_TIMEOUT)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.clone(),
                source,
            })?;
        read_json(check_status(response).await?, url).await
    }

    pub async fn abort(&self, request_id: &str) -> Result<AbortResponse, ClientError> {
        let url = self.url("/abort");
        let response = self
            .http
            .post(&url)
            .json(&AbortRequest {
                request_id: request_id.to_string(),
            })
            .timeout(POLL_TIMEOUT)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.clone(),
                source,
            })?;
        read_json(check_status(response).await?, url).await
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(http_error(status, body))
}

fn http_error(status: StatusCode, body: String) -> ClientError {
    let problem = serde_json::from_str::<ProblemDetails>(&body).ok();
    ClientError::Http {
        status: status.as_u16(),
        problem,
        body,
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: Response,
    url: String,
) -> Result<T, ClientError> {
    response.json::<T>().await.map_err(|source| {
        if source.is_decode() {
            ClientError::Decode { url, source }
        } else {
            ClientError::Transport { url, source }
        }
    })
}

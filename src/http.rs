use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

/// Shared HTTP client for adapters. Request timeouts live here rather than in
/// the orchestrator.
pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(15);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Non-success response, reduced to what callers classify on.
#[derive(Debug, Clone)]
pub struct HttpFailure {
    pub status: StatusCode,
    pub body: String,
}

impl HttpFailure {
    pub fn message(&self) -> String {
        let snippet: String = self.body.chars().take(200).collect();
        if snippet.trim().is_empty() {
            format!("HTTP {}", self.status)
        } else {
            format!("HTTP {}: {}", self.status, snippet.trim())
        }
    }
}

pub async fn ensure_success(response: Response) -> Result<Response, HttpFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HttpFailure { status, body })
}

/// Describes a transport-level failure so the text classifier can tell
/// timeouts from connection problems.
pub fn describe_transport(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection refused: {err}")
    } else {
        format!("http transport error: {err}")
    }
}

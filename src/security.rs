use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, sync::Arc};
use tracing::{info, warn};

pub const KEY_HEADER: &str = "X-Forge-Key";

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, AuthContext>>,
}

/// Who made the request; inserted into request extensions after auth.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthContext {
    pub org_id: String,
    pub api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = std::env::var("FORGE_API_KEYS").unwrap_or_default();
        Self::from_list(&raw)
    }

    /// Parses `org:key,org:key`. Malformed entries are skipped with a warning.
    pub fn from_list(raw: &str) -> Self {
        let mut records = HashMap::new();
        for (idx, token) in raw.split(',').enumerate() {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.split_once(':') {
                Some((org, key)) if !org.trim().is_empty() && !key.trim().is_empty() => {
                    records.insert(
                        key.trim().to_string(),
                        AuthContext {
                            org_id: org.trim().to_string(),
                            api_key_id: format!("key-{:02}", idx + 1),
                        },
                    );
                }
                _ => warn!(target = "trendforge.api", entry = %trimmed, "malformed_api_key_entry"),
            }
        }
        if records.is_empty() {
            warn!(target = "trendforge.api", "no_api_keys_configured");
        } else {
            info!(target = "trendforge.api", key_count = records.len(), "api_keys_loaded");
        }
        Self {
            records: Arc::new(records),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).cloned()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized("missing_api_key", "Provide X-Forge-Key or a Bearer token"));
    };
    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized("invalid_api_key", "Key not recognized"));
    };
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        details: vec![message.to_string()],
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

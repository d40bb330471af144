//! AI content providers behind one contract.
//!
//! Providers only implement raw completion; the structured operations are
//! provided methods that prompt for JSON and parse it, so stages never see
//! provider-specific output.

pub mod gemini;
pub mod openai;
pub mod prompts;
pub mod tensorzero;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use tensorzero::TensorZeroProvider;

use crate::config::AiSettings;
use crate::http::HttpFailure;
use crate::models::{Product, TrendData};
use crate::recovery::{Classify, ErrorKind, classify_message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum AiError {
    #[error("{0} is not configured")]
    MissingConfig(String),
    #[error("unknown AI provider '{0}'")]
    UnknownProvider(String),
    #[error("{0}")]
    Transport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("ai provider error (HTTP {status}): {message}")]
    Http { status: u16, message: String },
    #[error("malformed provider output: {0}")]
    Malformed(String),
    #[error("{0} is not supported by this provider")]
    Unsupported(String),
}

impl AiError {
    pub fn from_http(failure: HttpFailure) -> Self {
        match failure.status.as_u16() {
            429 => AiError::RateLimited(failure.message()),
            status => AiError::Http {
                status,
                message: failure.message(),
            },
        }
    }

    pub fn from_transport(err: &reqwest::Error) -> Self {
        AiError::Transport(crate::http::describe_transport(err))
    }
}

impl Classify for AiError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            AiError::MissingConfig(_) | AiError::UnknownProvider(_) | AiError::Unsupported(_) => {
                ErrorKind::ConfigError
            }
            AiError::RateLimited(_) => ErrorKind::RateLimitError,
            AiError::Http {
                status: 401 | 403, ..
            } => ErrorKind::AuthError,
            AiError::Http {
                status: 408 | 504, ..
            } => ErrorKind::TimeoutError,
            AiError::Http { .. } => ErrorKind::ApiError,
            AiError::Transport(message) => match classify_message(message) {
                ErrorKind::UnknownError => ErrorKind::ApiError,
                kind => kind,
            },
            AiError::Malformed(_) => ErrorKind::UnknownError,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            AiError::Transport(_) | AiError::RateLimited(_) | AiError::Http { .. }
        )
    }
}

/// One prompt sent to a provider.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    /// Ask the provider for a JSON document instead of prose.
    pub expect_json: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize)]
pub struct AiContent {
    pub format: ContentFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneratedProduct {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub price: Option<f64>,
    pub category: String,
    #[serde(alias = "seo_keywords")]
    pub seo_keywords: Vec<String>,
    #[serde(alias = "image_prompt")]
    pub image_prompt: String,
    pub content: String,
    pub specifications: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RankedTrend {
    pub keyword: String,
    pub score: f64,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub insight: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingContent {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Raw completion text for `request`.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError>;

    async fn generate_product(
        &self,
        trend: &TrendData,
        custom_prompt: Option<&str>,
    ) -> Result<GeneratedProduct, AiError> {
        let request = prompts::product(trend, custom_prompt);
        let content = generate_ai_content(self, &request).await?;
        parse_json(content, "product")
    }

    /// Returns trends ordered best first with ranks filled in.
    async fn analyze_trends(&self, trends: &[TrendData]) -> Result<Vec<RankedTrend>, AiError> {
        let request = prompts::analysis(trends);
        let content = generate_ai_content(self, &request).await?;
        let json = content.json.unwrap_or(Value::Null);
        let list = match json {
            Value::Object(mut fields) => fields.remove("trends").unwrap_or(Value::Null),
            other => other,
        };
        let ranked: Vec<RankedTrend> = serde_json::from_value(list)
            .map_err(|err| AiError::Malformed(format!("trend ranking: {err}")))?;
        Ok(assign_ranks(ranked))
    }

    async fn generate_listing_content(
        &self,
        product: &Product,
        marketplace: &str,
    ) -> Result<ListingContent, AiError> {
        let request = prompts::listing(product, marketplace);
        let content = generate_ai_content(self, &request).await?;
        parse_json(content, "listing content")
    }

    /// URL of an image rendered from `prompt`.
    async fn generate_image(&self, _prompt: &str) -> Result<String, AiError> {
        Err(AiError::Unsupported(format!("{} image generation", self.name())))
    }
}

/// Runs `request` and normalizes whatever came back.
pub async fn generate_ai_content<P: AiProvider + ?Sized>(
    provider: &P,
    request: &CompletionRequest,
) -> Result<AiContent, AiError> {
    let raw = provider.complete(request).await?;
    normalize_content(&raw, request.expect_json)
}

pub fn normalize_content(raw: &str, expect_json: bool) -> Result<AiContent, AiError> {
    let text = strip_markdown_fence(raw);
    match serde_json::from_str::<Value>(&text) {
        Ok(json) if json.is_object() || json.is_array() => Ok(AiContent {
            format: ContentFormat::Json,
            json: Some(json),
            text,
        }),
        _ if expect_json => {
            let snippet: String = text.chars().take(120).collect();
            Err(AiError::Malformed(format!("expected JSON, got: {snippet}")))
        }
        _ => Ok(AiContent {
            format: ContentFormat::Text,
            json: None,
            text,
        }),
    }
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n").trim().to_string()
}

fn parse_json<T: serde::de::DeserializeOwned>(content: AiContent, what: &str) -> Result<T, AiError> {
    let json = content
        .json
        .ok_or_else(|| AiError::Malformed(format!("{what} response was not JSON")))?;
    serde_json::from_value(json).map_err(|err| AiError::Malformed(format!("{what}: {err}")))
}

fn assign_ranks(mut ranked: Vec<RankedTrend>) -> Vec<RankedTrend> {
    ranked.retain(|trend| !trend.keyword.trim().is_empty() && trend.score.is_finite());
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    for (idx, trend) in ranked.iter_mut().enumerate() {
        trend.rank = Some(idx as u32 + 1);
    }
    ranked
}

/// Builds the provider named by `AI_PROVIDER`. Unknown names and missing keys
/// fail here, at start-up, instead of on first use.
pub fn build_provider(name: &str, settings: &AiSettings) -> Result<Arc<dyn AiProvider>, AiError> {
    match name.trim().to_lowercase().as_str() {
        "gemini" => {
            let key = settings
                .gemini_api_key
                .clone()
                .ok_or_else(|| AiError::MissingConfig("GEMINI_API_KEY".into()))?;
            Ok(Arc::new(GeminiProvider::new(
                key,
                settings.gemini_model.clone(),
                settings.gemini_base_url.clone(),
            )))
        }
        "openai" => {
            let key = settings
                .openai_api_key
                .clone()
                .ok_or_else(|| AiError::MissingConfig("OPENAI_API_KEY".into()))?;
            Ok(Arc::new(OpenAiProvider::new(
                key,
                settings.openai_model.clone(),
                settings.openai_base_url.clone(),
            )))
        }
        "tensorzero" => {
            if settings.tensorzero_gateway_url.trim().is_empty() {
                return Err(AiError::MissingConfig("TENSORZERO_GATEWAY_URL".into()));
            }
            Ok(Arc::new(TensorZeroProvider::new(
                settings.tensorzero_gateway_url.clone(),
                settings.tensorzero_api_key.clone(),
                settings.tensorzero_function.clone(),
            )))
        }
        other => Err(AiError::UnknownProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Competition;
    use chrono::Utc;

    struct Canned(&'static str);

    #[async_trait]
    impl AiProvider for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, AiError> {
            Ok(self.0.to_string())
        }
    }

    fn trend(keyword: &str) -> TrendData {
        TrendData {
            keyword: keyword.into(),
            search_volume: 120,
            competition: Competition::Low,
            avg_price: 21.0,
            score: None,
            rank: None,
            insight: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let content = normalize_content("```json\n{\"title\":\"Candle\"}\n```", true).unwrap();
        assert_eq!(content.format, ContentFormat::Json);
        assert_eq!(content.json.unwrap()["title"], "Candle");
    }

    #[test]
    fn prose_is_text_unless_json_was_requested() {
        let content = normalize_content("Here is your product.", false).unwrap();
        assert_eq!(content.format, ContentFormat::Text);
        assert!(content.json.is_none());
        let err = normalize_content("Here is your product.", true).unwrap_err();
        assert!(matches!(err, AiError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn product_parses_camel_and_snake_fields() {
        let provider = Canned(
            r#"{"title":"Handmade Aura Candle","price":24.5,"tags":["candle","handmade"],"image_prompt":"warm glow"}"#,
        );
        let product = provider
            .generate_product(&trend("Aura Candle"), None)
            .await
            .unwrap();
        assert_eq!(product.title, "Handmade Aura Candle");
        assert_eq!(product.price, Some(24.5));
        assert_eq!(product.image_prompt, "warm glow");
        assert!(product.seo_keywords.is_empty());
    }

    #[tokio::test]
    async fn rankings_are_sorted_and_numbered() {
        let provider = Canned(
            r#"{"trends":[{"keyword":"b","score":2.0},{"keyword":"a","score":9.5,"insight":"rising"}]}"#,
        );
        let ranked = provider
            .analyze_trends(&[trend("a"), trend("b")])
            .await
            .unwrap();
        assert_eq!(ranked[0].keyword, "a");
        assert_eq!(ranked[0].rank, Some(1));
        assert_eq!(ranked[1].rank, Some(2));
    }

    #[tokio::test]
    async fn images_are_unsupported_by_default() {
        let err = Canned("{}").generate_image("a candle").await.unwrap_err();
        assert!(matches!(err, AiError::Unsupported(_)));
    }

    #[test]
    fn unknown_provider_fails_fast() {
        let err = build_provider("claude-ish", &AiSettings::default()).err();
        assert!(matches!(err, Some(AiError::UnknownProvider(_))));
        let err = build_provider("gemini", &AiSettings::default()).err();
        assert!(matches!(err, Some(AiError::MissingConfig(_))));
    }
}

use super::{AiError, AiProvider, CompletionRequest};
use crate::http::{build_client, ensure_success};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const IMAGE_MODEL: &str = "dall-e-3";

/// Chat Completions and Images client. Works against any server speaking the
/// same wire format via `OPENAI_BASE_URL`.
pub struct OpenAiProvider {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            http: build_client(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response, AiError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| AiError::from_transport(&err))?;
        ensure_success(response).await.map_err(AiError::from_http)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
        });
        if request.expect_json {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let response = self.post("/chat/completions", &body).await?;
        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| AiError::Malformed(err.to_string()))?;
        payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| AiError::Malformed("completion had no content".into()))
    }

    async fn generate_image(&self, prompt: &str) -> Result<String, AiError> {
        let body = json!({
            "model": IMAGE_MODEL,
            "prompt": prompt,
            "n": 1,
            "size": "1024x1024",
        });
        let response = self.post("/images/generations", &body).await?;
        let payload: ImageResponse = response
            .json()
            .await
            .map_err(|err| AiError::Malformed(err.to_string()))?;
        let url = payload
            .data
            .into_iter()
            .find_map(|image| image.url)
            .ok_or_else(|| AiError::Malformed("image response had no url".into()))?;
        debug!(target = "trendforge.ai", provider = "openai", "image_generated");
        Ok(url)
    }
}

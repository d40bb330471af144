use super::{AiError, AiProvider, CompletionRequest};
use crate::http::{build_client, ensure_success};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_FUNCTION: &str = "trendforge_generation";

/// Talks to a TensorZero gateway's `/inference` endpoint.
pub struct TensorZeroProvider {
    http: Client,
    gateway_url: String,
    api_key: Option<String>,
    function_name: String,
}

impl TensorZeroProvider {
    pub fn new(gateway_url: String, api_key: Option<String>, function_name: Option<String>) -> Self {
        Self {
            http: build_client(),
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            api_key,
            function_name: function_name.unwrap_or_else(|| DEFAULT_FUNCTION.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    function_name: &'a str,
    input: InferenceInput<'a>,
}

#[derive(Debug, Serialize)]
struct InferenceInput<'a> {
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    content: Vec<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: String,
}

#[async_trait]
impl AiProvider for TensorZeroProvider {
    fn name(&self) -> &str {
        "tensorzero"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let body = InferenceRequest {
            function_name: &self.function_name,
            input: InferenceInput {
                system: &request.system,
                messages: vec![Message {
                    role: "user",
                    content: &request.prompt,
                }],
            },
        };

        let mut call = self
            .http
            .post(format!("{}/inference", self.gateway_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            call = call.header("X-API-Key", key);
        }

        let response = call
            .send()
            .await
            .map_err(|err| AiError::from_transport(&err))?;
        let response = ensure_success(response).await.map_err(AiError::from_http)?;
        let payload: InferenceResponse = response
            .json()
            .await
            .map_err(|err| AiError::Malformed(err.to_string()))?;

        payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .map(|item| item.text)
            .ok_or_else(|| AiError::Malformed("gateway returned no text block".into()))
    }
}

//! Anthropic messages-API adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use steward_core::{Completion, CompletionModel, CompletionRequest, ProbeReport, ProviderError};

use crate::http::{classify_status, classify_transport, retry_after_seconds};

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicModel {
    model_id: String,
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    timeout_ms: u64,
}

impl AnthropicModel {
    pub fn new(
        model_id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ProviderError::InvalidRequest(error.to_string()))?;
        Ok(Self {
            model_id: model_id.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<UserMessage<'a>>,
}

/// System prompt with any quality-retry feedback appended; the messages API
/// has a single system slot.
fn system_text(request: &CompletionRequest) -> Option<String> {
    match (&request.system_prompt, &request.quality_feedback) {
        (Some(system), Some(feedback)) => Some(format!("{system}\n\n{feedback}")),
        (Some(system), None) => Some(system.clone()),
        (None, Some(feedback)) => Some(feedback.clone()),
        (None, None) => None,
    }
}

#[derive(Serialize)]
struct UserMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl CompletionModel for AnthropicModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = MessagesRequest {
            model: &self.model_id,
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            system: system_text(request),
            messages: vec![UserMessage { role: "user", content: &request.prompt }],
        };

        let response = self
            .request("/v1/messages")
            .json(&body)
            .send()
            .await
            .map_err(|error| classify_transport(&error, self.timeout_ms))?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_seconds(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Transient(format!("malformed response: {error}")))?;
        let text = parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| {
                ProviderError::Transient("response contained no text block".to_string())
            })?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(Completion {
            text,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            quality_score: None,
        })
    }

    async fn probe(&self) -> ProbeReport {
        let started = Instant::now();
        let result = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.status().is_success() => {
                ProbeReport { reachable: true, latency_ms, error_rate: 0.0, error: None }
            }
            Ok(response) => ProbeReport {
                reachable: false,
                latency_ms,
                error_rate: 1.0,
                error: Some(response.status().to_string()),
            },
            Err(error) => ProbeReport::unreachable(error.to_string()),
        }
    }
}

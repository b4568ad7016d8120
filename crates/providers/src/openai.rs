//! OpenAI-compatible chat-completions adapter.
//!
//! Also serves Ollama deployments, which expose the same wire format under
//! `/v1` on the local daemon.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use steward_core::{Completion, CompletionModel, CompletionRequest, ProbeReport, ProviderError};
use tracing::debug;

use crate::http::{classify_status, classify_transport, retry_after_seconds};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

pub struct OpenAiModel {
    model_id: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    timeout_ms: u64,
}

impl OpenAiModel {
    pub fn new(
        model_id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
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

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Quality-retry feedback rides along as an extra system message.
fn chat_messages(request: &CompletionRequest) -> Vec<ChatMessage<'_>> {
    let mut messages = Vec::with_capacity(3);
    if let Some(system) = &request.system_prompt {
        messages.push(ChatMessage { role: "system", content: system });
    }
    if let Some(feedback) = &request.quality_feedback {
        messages.push(ChatMessage { role: "system", content: feedback });
    }
    messages.push(ChatMessage { role: "user", content: &request.prompt });
    messages
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl CompletionModel for OpenAiModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = ChatRequest {
            model: &self.model_id,
            messages: chat_messages(request),
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
        };

        let response = self
            .authorize(self.client.post(format!("{}/chat/completions", self.base_url)))
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

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Transient(format!("malformed response: {error}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                ProviderError::Transient("response contained no completion text".to_string())
            })?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(Completion {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            quality_score: None,
        })
    }

    async fn probe(&self) -> ProbeReport {
        let started = Instant::now();
        let result =
            self.authorize(self.client.get(format!("{}/models", self.base_url))).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(model = %self.model_id, latency_ms, "probe ok");
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

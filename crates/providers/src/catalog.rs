//! Build a [`ModelRegistry`] from engine configuration.

use std::sync::Arc;
use std::time::Duration;

use steward_core::config::{EngineConfig, ModelConfig, ProviderKind};
use steward_core::{CompletionModel, EngineError, ModelDescriptor, ModelRegistry};
use tracing::info;

use crate::anthropic::{AnthropicModel, DEFAULT_ANTHROPIC_BASE_URL};
use crate::openai::{OpenAiModel, DEFAULT_OLLAMA_BASE_URL, DEFAULT_OPENAI_BASE_URL};

/// Instantiate the wire adapter for one configured model.
pub fn build_model(config: &ModelConfig) -> Result<Arc<dyn CompletionModel>, EngineError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let adapter: Arc<dyn CompletionModel> = match config.provider {
        ProviderKind::OpenAi => {
            let base_url =
                config.base_url.clone().unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
            Arc::new(
                OpenAiModel::new(&config.id, base_url, config.api_key.clone(), timeout)
                    .map_err(|error| EngineError::Configuration(error.to_string()))?,
            )
        }
        ProviderKind::Ollama => {
            let base_url =
                config.base_url.clone().unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string());
            Arc::new(
                OpenAiModel::new(&config.id, base_url, None, timeout)
                    .map_err(|error| EngineError::Configuration(error.to_string()))?,
            )
        }
        ProviderKind::Anthropic => {
            let base_url =
                config.base_url.clone().unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string());
            let api_key = config.api_key.clone().ok_or_else(|| {
                EngineError::Configuration(format!(
                    "model `{}` uses the anthropic provider but has no api_key",
                    config.id
                ))
            })?;
            Arc::new(
                AnthropicModel::new(&config.id, base_url, api_key, timeout)
                    .map_err(|error| EngineError::Configuration(error.to_string()))?,
            )
        }
    };
    Ok(adapter)
}

fn provider_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "openai",
        ProviderKind::Anthropic => "anthropic",
        ProviderKind::Ollama => "ollama",
    }
}

/// Build the full registry: one adapter per configured model, tenant
/// allow-lists applied. Registration order follows the config file, which
/// makes the first model listed per tier that tier's primary.
pub fn registry_from_config(config: &EngineConfig) -> Result<ModelRegistry, EngineError> {
    let mut registry = ModelRegistry::new();
    for model in &config.models {
        let adapter = build_model(model)?;
        registry.register(
            ModelDescriptor {
                model_id: model.id.clone(),
                tier: model.tier,
                provider: provider_name(model.provider).to_string(),
            },
            adapter,
        );
        info!(model = %model.id, tier = model.tier.as_key(), "registered model");
    }
    for tenant in &config.tenants {
        registry.allow_for_tenant(tenant.tenant_id.clone(), tenant.allowed_models.iter().cloned());
    }
    Ok(registry)
}

//! Engine configuration: model catalog, tenant allow-lists, routing and
//! health settings. Loaded once at startup from a TOML file, with environment
//! overrides for deployment-specific values.

use std::env;
use std::fs;
use std::path::Path;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::{
    DEFAULT_HEALTH_TTL_SECS, DEFAULT_MAX_HEALTHY_ERROR_RATE, DEFAULT_MAX_HEALTHY_LATENCY_MS,
};
use crate::registry::ModelTier;
use crate::router::DEFAULT_BACKOFF_BASE_MS;
use crate::task::DEFAULT_MAX_RETRIES;

pub const ENV_CONFIG_PATH: &str = "STEWARD_CONFIG";
pub const ENV_LOG_LEVEL: &str = "STEWARD_LOG_LEVEL";
pub const ENV_TRACE_PATH: &str = "STEWARD_TRACE_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file `{path}`: {source}")]
    Parse { path: String, source: toml::de::Error },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub tier: ModelTier,
    pub provider: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub allowed_models: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RoutingSettings {
    #[serde(default = "default_tier")]
    pub default_tier: ModelTier,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_true")]
    pub accept_degraded_quality: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            default_tier: default_tier(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            accept_degraded_quality: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_health_ttl_secs(),
            max_latency_ms: default_max_latency_ms(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
    #[serde(default)]
    pub routing: RoutingSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub trace_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            tenants: Vec::new(),
            routing: RoutingSettings::default(),
            health: HealthSettings::default(),
            logging: LoggingSettings::default(),
            trace_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: EngineConfig =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file named by `STEWARD_CONFIG`, or built-in defaults when the
    /// variable is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var(ENV_CONFIG_PATH) {
            Ok(path) => Self::from_path(path),
            Err(_) => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        if let Ok(path) = env::var(ENV_TRACE_PATH) {
            self.trace_path = Some(path);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.id.trim().is_empty() {
                return Err(ConfigError::Invalid("model id must not be empty".to_string()));
            }
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate model id `{}`", model.id)));
            }
        }
        for tenant in &self.tenants {
            for allowed in &tenant.allowed_models {
                if !seen.contains(allowed.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "tenant `{}` allows unknown model `{}`",
                        tenant.tenant_id, allowed
                    )));
                }
            }
        }
        if self.health.max_error_rate < 0.0 || self.health.max_error_rate > 1.0 {
            return Err(ConfigError::Invalid(
                "health.max_error_rate must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_tier() -> ModelTier {
    ModelTier::Generation
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_true() -> bool {
    true
}

fn default_health_ttl_secs() -> i64 {
    DEFAULT_HEALTH_TTL_SECS
}

fn default_max_latency_ms() -> u64 {
    DEFAULT_MAX_HEALTHY_LATENCY_MS
}

fn default_max_error_rate() -> f64 {
    DEFAULT_MAX_HEALTHY_ERROR_RATE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_catalog_tenants_and_settings() {
        let file = write_config(
            r#"
            trace_path = "/tmp/traces.jsonl"

            [[models]]
            id = "gpt-large"
            tier = "reasoning"
            provider = "open_ai"
            api_key = "sk-test"

            [[models]]
            id = "local-llama"
            tier = "local"
            provider = "ollama"
            base_url = "http://localhost:11434"

            [[tenants]]
            tenant_id = "acme"
            allowed_models = ["local-llama"]

            [routing]
            default_tier = "conversation"
            max_retries = 5

            [health]
            ttl_secs = 30
            "#,
        );

        let config = EngineConfig::from_path(file.path()).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[0].tier, ModelTier::Reasoning);
        assert_eq!(config.models[0].provider, ProviderKind::OpenAi);
        assert_eq!(config.tenants[0].allowed_models, vec!["local-llama".to_string()]);
        assert_eq!(config.routing.default_tier, ModelTier::Conversation);
        assert_eq!(config.routing.max_retries, 5);
        assert_eq!(config.routing.backoff_base_ms, 500);
        assert_eq!(config.health.ttl_secs, 30);
        assert_eq!(config.trace_path.as_deref(), Some("/tmp/traces.jsonl"));
    }

    #[test]
    fn duplicate_model_ids_are_rejected() {
        let file = write_config(
            r#"
            [[models]]
            id = "m"
            tier = "generation"
            provider = "ollama"

            [[models]]
            id = "m"
            tier = "local"
            provider = "ollama"
            "#,
        );

        let error = EngineConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(message) if message.contains("duplicate")));
    }

    #[test]
    fn tenant_allow_list_must_reference_known_models() {
        let file = write_config(
            r#"
            [[models]]
            id = "m"
            tier = "generation"
            provider = "ollama"

            [[tenants]]
            tenant_id = "acme"
            allowed_models = ["ghost-model"]
            "#,
        );

        let error = EngineConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(message) if message.contains("ghost-model")));
    }

    #[test]
    fn defaults_apply_when_sections_are_omitted() {
        let file = write_config("");
        let config = EngineConfig::from_path(file.path()).unwrap();
        assert_eq!(config.routing.default_tier, ModelTier::Generation);
        assert_eq!(config.routing.max_retries, 3);
        assert!(config.routing.accept_degraded_quality);
        assert_eq!(config.health.ttl_secs, 60);
        assert_eq!(config.logging.level, "info");
    }
}

use secrecy::{ExposeSecret, SecretString};
use steward_core::config::{EngineConfig, LogFormat, ProviderKind};

pub fn run(config: &EngineConfig) -> String {
    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];

    if config.models.is_empty() {
        lines.push("  models: (none configured)".to_string());
    }
    for model in &config.models {
        lines.push(format!(
            "  models.{} = tier={} provider={} base_url={} api_key={} timeout_secs={}",
            model.id,
            model.tier.as_key(),
            provider_name(model.provider),
            model.base_url.as_deref().unwrap_or("(provider default)"),
            model.api_key.as_ref().map(redact_key).unwrap_or_else(|| "(unset)".to_string()),
            model.timeout_secs,
        ));
    }

    for tenant in &config.tenants {
        lines.push(format!(
            "  tenants.{} = allowed_models=[{}]",
            tenant.tenant_id,
            tenant.allowed_models.join(", ")
        ));
    }

    lines.push(format!("  routing.default_tier = {}", config.routing.default_tier.as_key()));
    lines.push(format!("  routing.max_retries = {}", config.routing.max_retries));
    lines.push(format!("  routing.backoff_base_ms = {}", config.routing.backoff_base_ms));
    lines.push(format!(
        "  routing.accept_degraded_quality = {}",
        config.routing.accept_degraded_quality
    ));
    lines.push(format!("  health.ttl_secs = {}", config.health.ttl_secs));
    lines.push(format!("  health.max_latency_ms = {}", config.health.max_latency_ms));
    lines.push(format!("  health.max_error_rate = {}", config.health.max_error_rate));
    lines.push(format!("  logging.level = {}", config.logging.level));
    lines.push(format!("  logging.format = {}", format_name(config.logging.format)));
    lines.push(format!(
        "  trace_path = {}",
        config.trace_path.as_deref().unwrap_or("(in-memory)")
    ));

    lines.join("\n")
}

fn provider_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "open_ai",
        ProviderKind::Anthropic => "anthropic",
        ProviderKind::Ollama => "ollama",
    }
}

fn format_name(format: LogFormat) -> &'static str {
    match format {
        LogFormat::Compact => "compact",
        LogFormat::Pretty => "pretty",
        LogFormat::Json => "json",
    }
}

fn redact_key(key: &SecretString) -> String {
    let exposed = key.expose_secret();
    if exposed.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", &exposed[..4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::config::ModelConfig;
    use steward_core::ModelTier;

    #[test]
    fn api_keys_are_redacted_in_output() {
        let config = EngineConfig {
            models: vec![ModelConfig {
                id: "gpt-large".to_string(),
                tier: ModelTier::Generation,
                provider: ProviderKind::OpenAi,
                base_url: None,
                api_key: Some(SecretString::from("sk-supersecretvalue")),
                timeout_secs: 30,
            }],
            ..EngineConfig::default()
        };

        let output = run(&config);
        assert!(output.contains("sk-s****"));
        assert!(!output.contains("supersecret"));
    }

    #[test]
    fn defaults_render_without_models() {
        let output = run(&EngineConfig::default());
        assert!(output.contains("models: (none configured)"));
        assert!(output.contains("routing.default_tier = generation"));
        assert!(output.contains("trace_path = (in-memory)"));
    }
}

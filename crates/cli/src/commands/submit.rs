use std::sync::Arc;

use clap::Args;
use steward_core::config::EngineConfig;
use steward_core::{
    EscalationGateway, ExecutionRouter, HealthMonitor, HealthThresholds, InMemoryEscalationGateway,
    InMemoryTraceStore, JsonlTraceStore, ModelTier, RouterConfig, Task, TraceStore,
};
use steward_providers::registry_from_config;
use tracing::info;

use super::CommandResult;

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[arg(long, help = "User query to execute")]
    pub prompt: String,
    #[arg(long, help = "Tenant the request is governed and billed under")]
    pub tenant: String,
    #[arg(long, default_value = "cli", help = "Requesting user id")]
    pub user: String,
    #[arg(long, help = "Department for quota accounting")]
    pub department: Option<String>,
    #[arg(
        long,
        help = "Tier hint: reasoning, generation, conversation, classification, or local"
    )]
    pub tier: Option<String>,
    #[arg(long, help = "Never fall back to an alternative model")]
    pub no_fallback: bool,
    #[arg(long, help = "Fail hard instead of escalating to human review")]
    pub no_escalate: bool,
}

pub fn run(config: &EngineConfig, args: SubmitArgs) -> CommandResult {
    let tier_hint = match args.tier.as_deref().map(parse_tier).transpose() {
        Ok(tier) => tier,
        Err(unknown) => {
            return CommandResult::failure(
                "submit",
                "invalid_argument",
                format!("unknown tier `{unknown}`"),
                2,
            );
        }
    };

    let registry = match registry_from_config(config) {
        Ok(registry) => Arc::new(registry),
        Err(error) => {
            return CommandResult::failure("submit", "configuration", error.to_string(), 2);
        }
    };

    let health = Arc::new(HealthMonitor::with_ttl_secs(config.health.ttl_secs).with_thresholds(
        HealthThresholds {
            max_latency_ms: config.health.max_latency_ms,
            max_error_rate: config.health.max_error_rate,
        },
    ));
    let escalation: Arc<dyn EscalationGateway> = Arc::new(InMemoryEscalationGateway::new());
    let store: Arc<dyn TraceStore> = match &config.trace_path {
        Some(path) => Arc::new(JsonlTraceStore::new(path)),
        None => Arc::new(InMemoryTraceStore::new()),
    };

    let router = ExecutionRouter::new(registry, health, escalation)
        .with_store(store)
        .with_config(RouterConfig {
            default_tier: config.routing.default_tier,
            backoff_base_ms: config.routing.backoff_base_ms,
            accept_degraded_quality: config.routing.accept_degraded_quality,
            ..RouterConfig::default()
        });

    let mut task = Task::new(args.prompt, args.tenant)
        .with_user(args.user)
        .with_max_retries(config.routing.max_retries)
        .with_allow_fallback(!args.no_fallback)
        .with_escalate_on_failure(!args.no_escalate);
    if let Some(department) = args.department {
        task = task.with_department(department);
    }
    if let Some(tier) = tier_hint {
        task = task.with_tier_hint(tier);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "submit",
                "runtime",
                format!("failed to initialize async runtime: {error}"),
                1,
            );
        }
    };

    let result = runtime.block_on(router.submit(task));
    info!(
        task = %result.task_id.0,
        outcome = ?result.outcome,
        retries = result.retries,
        fallback_used = result.fallback_used,
        "task finished"
    );

    let exit_code = if result.success() { 0 } else { 1 };
    let output = serde_json::to_string_pretty(&result)
        .unwrap_or_else(|error| format!("{{\"error\":\"serialization failed: {error}\"}}"));
    CommandResult { exit_code, output }
}

fn parse_tier(value: &str) -> Result<ModelTier, String> {
    match value {
        "reasoning" => Ok(ModelTier::Reasoning),
        "generation" => Ok(ModelTier::Generation),
        "conversation" => Ok(ModelTier::Conversation),
        "classification" => Ok(ModelTier::Classification),
        "local" => Ok(ModelTier::Local),
        other => Err(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_names_parse_to_every_tier() {
        assert_eq!(parse_tier("reasoning").unwrap(), ModelTier::Reasoning);
        assert_eq!(parse_tier("local").unwrap(), ModelTier::Local);
        assert_eq!(parse_tier("turbo").unwrap_err(), "turbo");
    }

    #[test]
    fn submit_fails_cleanly_on_unknown_tier() {
        let args = SubmitArgs {
            prompt: "hello".to_string(),
            tenant: "acme".to_string(),
            user: "cli".to_string(),
            department: None,
            tier: Some("turbo".to_string()),
            no_fallback: false,
            no_escalate: false,
        };
        let result = run(&EngineConfig::default(), args);
        assert_eq!(result.exit_code, 2);
        assert!(result.output.contains("invalid_argument"));
    }

    #[test]
    fn submit_without_models_reports_routing_failure() {
        let args = SubmitArgs {
            prompt: "hello".to_string(),
            tenant: "acme".to_string(),
            user: "cli".to_string(),
            department: None,
            tier: None,
            no_fallback: false,
            no_escalate: true,
        };
        let result = run(&EngineConfig::default(), args);
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("no_models_for_tier"));
    }
}

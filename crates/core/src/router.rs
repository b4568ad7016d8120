//! The execution router: governed state machine around one completion call.
//!
//! SELECTING -> EXECUTING -> (SUCCEEDED | RETRYING | FALLING_BACK |
//! ESCALATING) -> terminal. Every attempt, retry, fallback, and hand-off is
//! appended to the task's decision trace; the trace is finalized and
//! persisted on every terminal path, so the audit record reflects what
//! actually happened rather than just the final outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
use crate::errors::{EngineError, EscalateAction, FallbackAction, ProviderError, RecoveryPolicy};
use crate::escalation::{EscalationGateway, EscalationRequest};
use crate::health::HealthMonitor;
use crate::pipeline::{GovernancePolicy, IntentClassifier, RiskAssessor};
use crate::provider::{Completion, CompletionRequest};
use crate::quota::{AllowAllQuota, QuotaGate, UsageRecord};
use crate::registry::{ModelDescriptor, ModelRegistry, ModelTier};
use crate::store::{InMemoryTraceStore, TraceStore};
use crate::task::{ExecutionOutcome, ExecutionResult, Task};
use crate::trace::{RoutingDecision, StepType, TraceBuilder, TraceStep};

pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;

/// Scheduler-agnostic delay primitive. Suspends only the calling task;
/// concurrent tasks keep running.
#[async_trait]
pub trait RetryDelay: Send + Sync {
    async fn wait(&self, delay: Duration);
}

pub struct TokioDelay;

#[async_trait]
impl RetryDelay for TokioDelay {
    async fn wait(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Caller-held cancellation handle. Checked before every attempt and after
/// every backoff; a cancelled task stops retrying, never reaches the
/// escalation gateway, and still finalizes its trace.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub default_tier: ModelTier,
    pub backoff_base_ms: u64,
    /// Whether a fallback model's output below the task's quality threshold
    /// is accepted (flagged in audit) or treated as a quality failure.
    pub accept_degraded_quality: bool,
    pub cost_per_1k_tokens_usd: Decimal,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_tier: ModelTier::Generation,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            accept_degraded_quality: true,
            cost_per_1k_tokens_usd: Decimal::new(2, 3), // 0.002
        }
    }
}

pub struct ExecutionRouter {
    registry: Arc<ModelRegistry>,
    health: Arc<HealthMonitor>,
    escalation: Arc<dyn EscalationGateway>,
    quota: Arc<dyn QuotaGate>,
    store: Arc<dyn TraceStore>,
    audit: Arc<dyn AuditSink>,
    delay: Arc<dyn RetryDelay>,
    intent: IntentClassifier,
    risk: RiskAssessor,
    governance: GovernancePolicy,
    config: RouterConfig,
}

impl ExecutionRouter {
    pub fn new(
        registry: Arc<ModelRegistry>,
        health: Arc<HealthMonitor>,
        escalation: Arc<dyn EscalationGateway>,
    ) -> Self {
        Self {
            registry,
            health,
            escalation,
            quota: Arc::new(AllowAllQuota::new()),
            store: Arc::new(InMemoryTraceStore::new()),
            audit: Arc::new(InMemoryAuditSink::new()),
            delay: Arc::new(TokioDelay),
            intent: IntentClassifier::new(),
            risk: RiskAssessor::new(),
            governance: GovernancePolicy::default(),
            config: RouterConfig::default(),
        }
    }

    pub fn with_quota(mut self, quota: Arc<dyn QuotaGate>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_delay(mut self, delay: Arc<dyn RetryDelay>) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_governance(mut self, governance: GovernancePolicy) -> Self {
        self.governance = governance;
        self
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve one task to a definite terminal state: success with text,
    /// escalated with an approval reference, or failed with an error code.
    pub async fn submit(&self, task: Task) -> ExecutionResult {
        self.submit_with_cancel(task, CancelToken::new()).await
    }

    pub async fn submit_with_cancel(&self, task: Task, cancel: CancelToken) -> ExecutionResult {
        let started = Instant::now();
        let mut trace = TraceBuilder::new(&task);

        // Quota gate: a synchronous denial never enters EXECUTING.
        let quota_decision = self
            .quota
            .check_and_reserve(&task.user_id, task.department_id.as_deref(), task.estimated_tokens())
            .await;
        if !quota_decision.allowed {
            self.audit.emit(AuditEvent::new(
                task.id.clone(),
                task.tenant_id.clone(),
                trace.trace_id(),
                "quota.denied",
                AuditCategory::Quota,
                AuditOutcome::Denied,
            ));
            let mut result = self.finish_failed(
                &task,
                trace,
                started,
                "rate_limited",
                "per-tenant quota exhausted",
                0,
                Vec::new(),
                None,
                None,
            );
            result.retry_after_seconds = quota_decision.retry_after_seconds;
            return result;
        }

        // Pre-routing pipeline: intent, risk, governance.
        let intent = self.intent.classify(&task.prompt);
        trace.append_step(TraceStep::new(
            StepType::IntentClassification,
            json!({ "text": task.prompt }),
            serde_json::to_value(&intent).unwrap_or_default(),
        ));
        trace.set_intent(intent.clone());

        let risk = self.risk.assess(&task.prompt, &intent);
        trace.append_step(TraceStep::new(
            StepType::RiskAssessment,
            json!({ "intent": intent.intent }),
            serde_json::to_value(&risk).unwrap_or_default(),
        ));
        trace.set_risk(risk.clone());

        let governance = self.governance.evaluate(&intent, &risk);
        trace.append_step(TraceStep::new(
            StepType::GovernanceCheck,
            json!({ "intent": intent.intent, "risk": risk.level.as_key() }),
            serde_json::to_value(&governance).unwrap_or_default(),
        ));
        trace.set_governance(governance.clone());

        trace.append_step(TraceStep::new(
            StepType::AgentRouting,
            json!({ "intent": intent.intent }),
            json!({ "agent": intent.agent }),
        ));

        // A governance mandate overrides everything, including the task's
        // own escalation preference.
        if governance.requires_hitl {
            let reason =
                governance.reason.unwrap_or_else(|| "governance mandated human review".to_string());
            return self
                .escalate(
                    &task,
                    trace,
                    started,
                    "human_review_required",
                    reason,
                    None,
                    0,
                    Vec::new(),
                    None,
                    None,
                )
                .await;
        }

        // SELECTING: tier from the task hint or the default, walking down
        // tiers until one has models for this tenant.
        let requested_tier = task.tier_hint.unwrap_or(self.config.default_tier);
        let Some((tier, candidates)) = self.candidates_for(requested_tier, &task) else {
            return self.finish_failed(
                &task,
                trace,
                started,
                EngineError::NoModelsForTier(requested_tier).code(),
                &EngineError::NoModelsForTier(requested_tier).to_string(),
                0,
                Vec::new(),
                None,
                None,
            );
        };

        let primary = candidates[0].clone();
        let mut selected = primary.clone();
        let mut rationale =
            format!("selected `{}` as {} tier primary", primary.model_id, tier.as_key());

        // Pre-emptive fallback: stale-but-present health is enough to steer
        // away from a sick primary before spending any attempt on it.
        if let Some(adapter) = self.registry.adapter(&primary.model_id) {
            let health = self.health.check(&adapter).await;
            if !health.healthy && task.allow_fallback {
                if let Some(alternate) = candidates.get(1) {
                    rationale = format!(
                        "primary `{}` unhealthy (latency {}ms, error rate {:.3}); pre-emptively selected same-tier alternate `{}`",
                        primary.model_id, health.latency_ms, health.error_rate, alternate.model_id
                    );
                    self.audit.emit(
                        AuditEvent::new(
                            task.id.clone(),
                            task.tenant_id.clone(),
                            trace.trace_id(),
                            "routing.preemptive_fallback",
                            AuditCategory::Routing,
                            AuditOutcome::Success,
                        )
                        .with_metadata("from_model", &primary.model_id)
                        .with_metadata("to_model", &alternate.model_id),
                    );
                    selected = alternate.clone();
                }
            }
        }

        let routing = RoutingDecision {
            tier,
            model_id: selected.model_id.clone(),
            fallback_used: selected.model_id != primary.model_id,
            alternatives: candidates
                .iter()
                .filter(|candidate| candidate.model_id != selected.model_id)
                .map(|candidate| candidate.model_id.clone())
                .collect(),
            rationale: rationale.clone(),
        };
        trace.append_step(TraceStep::new(
            StepType::ModelSelection,
            json!({ "tier": tier.as_key() }),
            serde_json::to_value(&routing).unwrap_or_default(),
        ));
        trace.set_routing(routing);

        // EXECUTING: bounded retry with linear backoff and taxonomy-driven
        // reactive fallback.
        let mut request = CompletionRequest::from_task(&task);
        let mut retries: u32 = 0;
        let mut retry_reasons: Vec<String> = Vec::new();
        let mut current = selected;

        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(
                    &task,
                    trace,
                    started,
                    retries,
                    retry_reasons,
                    &primary,
                    &current,
                );
            }

            let Some(adapter) = self.registry.adapter(&current.model_id) else {
                return self.finish_failed(
                    &task,
                    trace,
                    started,
                    EngineError::UnknownModel(current.model_id.clone()).code(),
                    &EngineError::UnknownModel(current.model_id.clone()).to_string(),
                    retries,
                    retry_reasons,
                    Some(&primary),
                    Some(&current),
                );
            };

            let attempt_error = match adapter.complete(&request).await {
                Ok(completion) => {
                    match self.quality_violation(&task, &completion, &primary, &current, &trace) {
                        None => {
                            return self
                                .finish_success(
                                    &task,
                                    trace,
                                    started,
                                    completion,
                                    retries,
                                    retry_reasons,
                                    &primary,
                                    &current,
                                )
                                .await;
                        }
                        Some(error) => error,
                    }
                }
                Err(error) => error,
            };

            let policy = RecoveryPolicy::for_error(&attempt_error);
            warn!(
                task = %task.id.0,
                model = %current.model_id,
                error_code = attempt_error.code(),
                retries,
                "completion attempt failed"
            );
            // Every failed attempt lands in the trace, recovered or not.
            trace.append_step(TraceStep::new(
                StepType::ExecutionRetry,
                json!({ "attempt": retries + 1, "model": current.model_id }),
                json!({
                    "error_code": attempt_error.code(),
                    "reason": attempt_error.to_string(),
                }),
            ));

            // Permanent classes bypass retry entirely.
            if policy.escalate == EscalateAction::Immediate {
                if task.escalate_on_failure {
                    return self
                        .escalate(
                            &task,
                            trace,
                            started,
                            attempt_error.code(),
                            attempt_error.to_string(),
                            None,
                            retries,
                            retry_reasons,
                            Some(&primary),
                            Some(&current),
                        )
                        .await;
                }
                return self.finish_failed(
                    &task,
                    trace,
                    started,
                    attempt_error.code(),
                    &attempt_error.to_string(),
                    retries,
                    retry_reasons,
                    Some(&primary),
                    Some(&current),
                );
            }

            if policy.retry && retries < task.max_retries {
                retries += 1;
                retry_reasons.push(attempt_error.to_string());
                if let ProviderError::QualityBelowThreshold { .. } = attempt_error {
                    request.quality_feedback = Some(format!(
                        "The previous answer was rejected: {attempt_error}. \
                         Respond more thoroughly."
                    ));
                }

                if task.allow_fallback && self.should_swap(policy.fallback, retries, &task) {
                    if let Some(next) = self.registry.fallback_for(
                        current.tier,
                        Some(&task.tenant_id),
                        &current.model_id,
                    ) {
                        self.audit.emit(
                            AuditEvent::new(
                                task.id.clone(),
                                task.tenant_id.clone(),
                                trace.trace_id(),
                                "execution.reactive_fallback",
                                AuditCategory::Execution,
                                AuditOutcome::Success,
                            )
                            .with_metadata("from_model", &current.model_id)
                            .with_metadata("to_model", &next.model_id)
                            .with_metadata("error_code", attempt_error.code()),
                        );
                        current = next;
                    }
                }

                self.delay.wait(self.backoff_for(&attempt_error, retries)).await;
                continue;
            }

            // Retries exhausted (or a non-retryable kind without an
            // immediate mandate): escalate per the taxonomy or fail hard.
            let escalate =
                task.escalate_on_failure && policy.escalate == EscalateAction::IfExhausted;
            if escalate {
                return self
                    .escalate(
                        &task,
                        trace,
                        started,
                        attempt_error.code(),
                        format!("retries exhausted: {attempt_error}"),
                        None,
                        retries,
                        retry_reasons,
                        Some(&primary),
                        Some(&current),
                    )
                    .await;
            }
            return self.finish_failed(
                &task,
                trace,
                started,
                attempt_error.code(),
                &attempt_error.to_string(),
                retries,
                retry_reasons,
                Some(&primary),
                Some(&current),
            );
        }
    }

    /// Models for the requested tier, walking monotonically down the tier
    /// order when a tier has no models for this tenant.
    fn candidates_for(
        &self,
        requested: ModelTier,
        task: &Task,
    ) -> Option<(ModelTier, Vec<ModelDescriptor>)> {
        let mut tier = Some(requested);
        while let Some(current) = tier {
            let candidates = self.registry.models_for_tier(current, Some(&task.tenant_id));
            if !candidates.is_empty() {
                return Some((current, candidates));
            }
            tier = current.next_cheaper();
        }
        None
    }

    fn should_swap(&self, fallback: FallbackAction, retries: u32, task: &Task) -> bool {
        match fallback {
            FallbackAction::No => false,
            FallbackAction::Immediate | FallbackAction::DifferentModel => true,
            // Give the current model its retry budget, then one last chance
            // on a different model.
            FallbackAction::AfterRetries => retries >= task.max_retries,
        }
    }

    fn backoff_for(&self, error: &ProviderError, attempt: u32) -> Duration {
        let linear = Duration::from_millis(self.config.backoff_base_ms * u64::from(attempt));
        match error {
            ProviderError::RateLimited { retry_after_seconds: Some(seconds) } => {
                linear.max(Duration::from_secs(*seconds))
            }
            _ => linear,
        }
    }

    fn quality_violation(
        &self,
        task: &Task,
        completion: &Completion,
        primary: &ModelDescriptor,
        current: &ModelDescriptor,
        trace: &TraceBuilder,
    ) -> Option<ProviderError> {
        let threshold = task.quality_threshold?;
        let score = completion.quality_score.unwrap_or(1.0);
        if score >= threshold {
            return None;
        }
        let degraded = current.model_id != primary.model_id;
        if degraded && self.config.accept_degraded_quality {
            self.audit.emit(
                AuditEvent::new(
                    task.id.clone(),
                    task.tenant_id.clone(),
                    trace.trace_id(),
                    "execution.degraded_quality_accepted",
                    AuditCategory::Execution,
                    AuditOutcome::Success,
                )
                .with_metadata("model", &current.model_id)
                .with_metadata("score", format!("{score:.3}"))
                .with_metadata("threshold", format!("{threshold:.3}")),
            );
            return None;
        }
        Some(ProviderError::QualityBelowThreshold { score, threshold })
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_success(
        &self,
        task: &Task,
        mut trace: TraceBuilder,
        started: Instant,
        completion: Completion,
        retries: u32,
        retry_reasons: Vec<String>,
        primary: &ModelDescriptor,
        current: &ModelDescriptor,
    ) -> ExecutionResult {
        trace.append_step(TraceStep::new(
            StepType::ResponseGeneration,
            json!({ "model": current.model_id }),
            json!({
                "response_type": "answer",
                "output_tokens": completion.output_tokens,
            }),
        ));
        trace.set_final_model(&current.model_id);
        trace.set_response(completion.text.clone(), "answer");
        let trace_id = trace.trace_id().to_string();
        self.persist(task, trace.finalize(true));

        let tokens_used = completion.input_tokens + completion.output_tokens;
        let cost_usd = Decimal::from(tokens_used) * self.config.cost_per_1k_tokens_usd
            / Decimal::from(1_000);
        self.quota
            .record_usage(UsageRecord {
                user_id: task.user_id.clone(),
                department_id: task.department_id.clone(),
                tokens_used,
                cost_usd,
            })
            .await;

        let fallback_used = current.model_id != primary.model_id;
        info!(
            task = %task.id.0,
            model = %current.model_id,
            retries,
            fallback_used,
            "task resolved"
        );
        self.audit.emit(
            AuditEvent::new(
                task.id.clone(),
                task.tenant_id.clone(),
                trace_id.clone(),
                "execution.succeeded",
                AuditCategory::Execution,
                AuditOutcome::Success,
            )
            .with_metadata("model", &current.model_id)
            .with_metadata("retries", retries.to_string()),
        );

        ExecutionResult {
            task_id: task.id.clone(),
            trace_id,
            outcome: ExecutionOutcome::Succeeded,
            response: Some(completion.text),
            error_code: None,
            error_message: None,
            retries,
            retry_reasons,
            fallback_used,
            original_model_id: Some(primary.model_id.clone()),
            final_model_id: Some(current.model_id.clone()),
            total_latency_ms: started.elapsed().as_millis() as u64,
            retry_after_seconds: None,
            escalation: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn escalate(
        &self,
        task: &Task,
        mut trace: TraceBuilder,
        started: Instant,
        error_code: &str,
        reason: String,
        proposed_response: Option<String>,
        retries: u32,
        retry_reasons: Vec<String>,
        primary: Option<&ModelDescriptor>,
        current: Option<&ModelDescriptor>,
    ) -> ExecutionResult {
        let trace_id = trace.trace_id().to_string();

        let request = EscalationRequest {
            task_id: task.id.clone(),
            tenant_id: task.tenant_id.clone(),
            user_id: task.user_id.clone(),
            original_query: task.prompt.clone(),
            proposed_response,
            reason: reason.clone(),
            trace_id: trace_id.clone(),
        };

        let escalation = match self.escalation.request_escalation(request).await {
            Ok(reference) => reference,
            Err(error) => {
                warn!(task = %task.id.0, %error, "escalation gateway failed");
                return self.finish_failed(
                    task,
                    trace,
                    started,
                    error.code(),
                    &error.to_string(),
                    retries,
                    retry_reasons,
                    primary,
                    current,
                );
            }
        };

        // Only a hand-off the gateway accepted is recorded as an escalation.
        trace.mark_escalated();
        self.persist(task, trace.finalize(false));
        self.audit.emit(
            AuditEvent::new(
                task.id.clone(),
                task.tenant_id.clone(),
                trace_id.clone(),
                "escalation.requested",
                AuditCategory::Escalation,
                AuditOutcome::Success,
            )
            .with_metadata("reason", &reason)
            .with_metadata("approval_id", &escalation.approval_id),
        );
        info!(task = %task.id.0, approval_id = %escalation.approval_id, "task escalated to human review");

        ExecutionResult {
            task_id: task.id.clone(),
            trace_id,
            outcome: ExecutionOutcome::Escalated,
            response: None,
            error_code: Some(error_code.to_string()),
            error_message: Some(reason),
            retries,
            retry_reasons,
            fallback_used: final_differs(primary, current),
            original_model_id: primary.map(|descriptor| descriptor.model_id.clone()),
            final_model_id: current.map(|descriptor| descriptor.model_id.clone()),
            total_latency_ms: started.elapsed().as_millis() as u64,
            retry_after_seconds: None,
            escalation: Some(escalation),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_failed(
        &self,
        task: &Task,
        trace: TraceBuilder,
        started: Instant,
        error_code: &str,
        error_message: &str,
        retries: u32,
        retry_reasons: Vec<String>,
        primary: Option<&ModelDescriptor>,
        current: Option<&ModelDescriptor>,
    ) -> ExecutionResult {
        let trace_id = trace.trace_id().to_string();
        self.persist(task, trace.finalize(false));
        self.audit.emit(
            AuditEvent::new(
                task.id.clone(),
                task.tenant_id.clone(),
                trace_id.clone(),
                "execution.failed",
                AuditCategory::Execution,
                AuditOutcome::Failed,
            )
            .with_metadata("error_code", error_code),
        );

        ExecutionResult {
            task_id: task.id.clone(),
            trace_id,
            outcome: ExecutionOutcome::Failed,
            response: None,
            error_code: Some(error_code.to_string()),
            error_message: Some(error_message.to_string()),
            retries,
            retry_reasons,
            fallback_used: final_differs(primary, current),
            original_model_id: primary.map(|descriptor| descriptor.model_id.clone()),
            final_model_id: current.map(|descriptor| descriptor.model_id.clone()),
            total_latency_ms: started.elapsed().as_millis() as u64,
            retry_after_seconds: None,
            escalation: None,
        }
    }

    fn finish_cancelled(
        &self,
        task: &Task,
        mut trace: TraceBuilder,
        started: Instant,
        retries: u32,
        retry_reasons: Vec<String>,
        primary: &ModelDescriptor,
        current: &ModelDescriptor,
    ) -> ExecutionResult {
        trace.mark_cancelled();
        let trace_id = trace.trace_id().to_string();
        self.persist(task, trace.finalize(false));

        ExecutionResult {
            task_id: task.id.clone(),
            trace_id,
            outcome: ExecutionOutcome::Cancelled,
            response: None,
            error_code: Some("cancelled".to_string()),
            error_message: Some("cancelled by caller".to_string()),
            retries,
            retry_reasons,
            fallback_used: current.model_id != primary.model_id,
            original_model_id: Some(primary.model_id.clone()),
            final_model_id: Some(current.model_id.clone()),
            total_latency_ms: started.elapsed().as_millis() as u64,
            retry_after_seconds: None,
            escalation: None,
        }
    }

    fn persist(&self, task: &Task, trace: crate::trace::DecisionTrace) {
        if let Err(error) = self.store.persist(&trace) {
            warn!(task = %task.id.0, %error, "failed to persist decision trace");
            self.audit.emit(
                AuditEvent::new(
                    task.id.clone(),
                    task.tenant_id.clone(),
                    trace.trace_id.clone(),
                    "trace.persist_failed",
                    AuditCategory::Persistence,
                    AuditOutcome::Failed,
                )
                .with_metadata("error", error.to_string()),
            );
        }
    }
}

fn final_differs(primary: Option<&ModelDescriptor>, current: Option<&ModelDescriptor>) -> bool {
    match (primary, current) {
        (Some(primary), Some(current)) => primary.model_id != current.model_id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::escalation::{EscalationReference, InMemoryEscalationGateway};
    use crate::provider::{CompletionModel, ProbeReport, ScriptedModel};
    use crate::quota::DenyAllQuota;

    /// Gateway whose queue is down; every hand-off fails.
    struct FailingGateway;

    #[async_trait]
    impl EscalationGateway for FailingGateway {
        async fn request_escalation(
            &self,
            _request: EscalationRequest,
        ) -> Result<EscalationReference, EngineError> {
            Err(EngineError::Escalation("review queue unavailable".to_string()))
        }
    }

    /// Records requested delays without sleeping.
    #[derive(Default)]
    struct RecordingDelay {
        delays: Mutex<Vec<Duration>>,
        cancel_on_wait: Option<CancelToken>,
    }

    impl RecordingDelay {
        fn new() -> Self {
            Self::default()
        }

        fn cancelling(token: CancelToken) -> Self {
            Self { delays: Mutex::new(Vec::new()), cancel_on_wait: Some(token) }
        }

        fn delays(&self) -> Vec<Duration> {
            self.delays.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RetryDelay for RecordingDelay {
        async fn wait(&self, delay: Duration) {
            self.delays.lock().unwrap().push(delay);
            if let Some(token) = &self.cancel_on_wait {
                token.cancel();
            }
        }
    }

    struct Harness {
        router: ExecutionRouter,
        store: InMemoryTraceStore,
        gateway: InMemoryEscalationGateway,
        delay: Arc<RecordingDelay>,
        models: Vec<Arc<ScriptedModel>>,
    }

    fn descriptor(model_id: &str, tier: ModelTier) -> ModelDescriptor {
        ModelDescriptor { model_id: model_id.to_string(), tier, provider: "scripted".to_string() }
    }

    fn harness(models: Vec<(ModelTier, ScriptedModel)>) -> Harness {
        harness_with_delay(models, RecordingDelay::new())
    }

    fn harness_with_delay(models: Vec<(ModelTier, ScriptedModel)>, delay: RecordingDelay) -> Harness {
        let mut registry = ModelRegistry::new();
        let mut scripted = Vec::new();
        for (tier, model) in models {
            let model = Arc::new(model);
            registry.register(descriptor(model.model_id(), tier), model.clone());
            scripted.push(model);
        }

        let store = InMemoryTraceStore::new();
        let gateway = InMemoryEscalationGateway::new();
        let delay = Arc::new(delay);
        let router = ExecutionRouter::new(
            Arc::new(registry),
            Arc::new(HealthMonitor::new()),
            Arc::new(gateway.clone()),
        )
        .with_store(Arc::new(store.clone()))
        .with_delay(delay.clone());

        Harness { router, store, gateway, delay, models: scripted }
    }

    fn leave_task() -> Task {
        Task::new("I need to request FMLA leave", "test-tenant").with_user("u-1")
    }

    #[tokio::test]
    async fn healthy_primary_resolves_without_retries() {
        let harness = harness(vec![(
            ModelTier::Generation,
            ScriptedModel::healthy("gen-a").with_steady_response("File FMLA via the HR portal."),
        )]);

        let result = harness.router.submit(leave_task()).await;

        assert!(result.success());
        assert_eq!(result.retries, 0);
        assert!(!result.fallback_used);
        assert_eq!(result.response.as_deref(), Some("File FMLA via the HR portal."));
        assert_eq!(result.original_model_id, result.final_model_id);

        let traces = harness.store.traces();
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert!(trace.success);
        assert!(trace.trace_hash.is_some());
        assert_eq!(trace.intent.as_ref().unwrap().intent, "hr_leave");
        assert_eq!(trace.intent.as_ref().unwrap().agent, "hr_specialist");
        assert_eq!(trace.risk.as_ref().unwrap().level, crate::pipeline::RiskLevel::Low);
        assert!(!trace.governance.as_ref().unwrap().requires_hitl);
    }

    #[tokio::test]
    async fn unhealthy_primary_triggers_preemptive_same_tier_fallback() {
        let harness = harness(vec![
            (
                ModelTier::Generation,
                ScriptedModel::healthy("gen-a")
                    .with_probe_report(ProbeReport::unreachable("connection refused")),
            ),
            (ModelTier::Generation, ScriptedModel::healthy("gen-b")),
        ]);

        let result = harness.router.submit(leave_task()).await;

        assert!(result.success());
        assert_eq!(result.retries, 0);
        assert!(result.fallback_used);
        assert_eq!(result.original_model_id.as_deref(), Some("gen-a"));
        assert_eq!(result.final_model_id.as_deref(), Some("gen-b"));
        // No attempt was ever spent on the sick primary.
        assert_eq!(harness.models[0].completions_requested(), 0);

        let trace = &harness.store.traces()[0];
        let routing = trace.routing.as_ref().unwrap();
        assert!(routing.fallback_used);
        assert_eq!(routing.model_id, "gen-b");
    }

    #[tokio::test]
    async fn transient_failures_retry_with_linear_backoff() {
        let harness = harness(vec![(
            ModelTier::Generation,
            ScriptedModel::healthy("gen-a")
                .push_error(ProviderError::Transient("connection reset".to_string()))
                .push_error(ProviderError::Transient("connection reset".to_string())),
        )]);

        let result = harness.router.submit(leave_task()).await;

        assert!(result.success());
        assert_eq!(result.retries, 2);
        assert_eq!(result.retry_reasons.len(), 2);
        assert_eq!(
            harness.delay.delays(),
            vec![Duration::from_millis(500), Duration::from_millis(1_000)]
        );

        let trace = &harness.store.traces()[0];
        let retry_steps = trace
            .steps
            .iter()
            .filter(|step| step.step_type == StepType::ExecutionRetry)
            .count();
        assert_eq!(retry_steps, 2);
    }

    #[tokio::test]
    async fn auth_error_escalates_immediately_without_retry() {
        let harness = harness(vec![(
            ModelTier::Generation,
            ScriptedModel::healthy("gen-a").push_error(ProviderError::Auth("bad key".to_string())),
        )]);

        let result = harness.router.submit(leave_task()).await;

        assert_eq!(result.outcome, ExecutionOutcome::Escalated);
        assert_eq!(result.retries, 0);
        assert_eq!(result.error_code.as_deref(), Some("auth_error"));
        assert!(result.escalation.is_some());
        assert_eq!(harness.gateway.requests().len(), 1);

        let trace = &harness.store.traces()[0];
        assert!(!trace.success);
        assert_eq!(trace.response_type.as_deref(), Some("escalation"));
    }

    #[tokio::test]
    async fn unrecovered_failure_still_produces_a_trace_step() {
        let harness = harness(vec![(
            ModelTier::Generation,
            ScriptedModel::healthy("gen-a").push_error(ProviderError::Auth("bad key".to_string())),
        )]);

        let result = harness.router.submit(leave_task()).await;
        assert_eq!(result.outcome, ExecutionOutcome::Escalated);

        let trace = &harness.store.traces()[0];
        let failure_step = trace
            .steps
            .iter()
            .find(|step| step.step_type == StepType::ExecutionRetry)
            .expect("the failed attempt must be recorded");
        assert_eq!(failure_step.output["error_code"], "auth_error");
        assert_eq!(failure_step.input["model"], "gen-a");
    }

    #[tokio::test]
    async fn gateway_failure_finishes_failed_without_escalation_marker() {
        let mut registry = ModelRegistry::new();
        registry.register(
            descriptor("gen-a", ModelTier::Generation),
            Arc::new(
                ScriptedModel::healthy("gen-a")
                    .push_error(ProviderError::Auth("bad key".to_string())),
            ),
        );
        let store = InMemoryTraceStore::new();
        let router = ExecutionRouter::new(
            Arc::new(registry),
            Arc::new(HealthMonitor::new()),
            Arc::new(FailingGateway),
        )
        .with_store(Arc::new(store.clone()))
        .with_delay(Arc::new(RecordingDelay::new()));

        let result = router.submit(leave_task()).await;

        assert_eq!(result.outcome, ExecutionOutcome::Failed);
        assert_eq!(result.error_code.as_deref(), Some("escalation_failed"));
        // The persisted trace must not claim an escalation that never
        // happened.
        let trace = &store.traces()[0];
        assert!(!trace.success);
        assert_ne!(trace.response_type.as_deref(), Some("escalation"));
    }

    #[tokio::test]
    async fn quota_denial_short_circuits_before_execution() {
        let mut harness =
            harness(vec![(ModelTier::Generation, ScriptedModel::healthy("gen-a"))]);
        harness.router =
            harness.router.with_quota(Arc::new(DenyAllQuota { retry_after_seconds: 30 }));

        let result = harness.router.submit(leave_task()).await;

        assert_eq!(result.outcome, ExecutionOutcome::Failed);
        assert_eq!(result.error_code.as_deref(), Some("rate_limited"));
        assert_eq!(result.retry_after_seconds, Some(30));
        assert_eq!(harness.models[0].completions_requested(), 0);
        assert!(!harness.store.traces()[0].success);
    }

    #[tokio::test]
    async fn retries_never_exceed_max_retries() {
        let model = ScriptedModel::healthy("gen-a");
        let model = [0; 8].iter().fold(model, |model, _| {
            model.push_error(ProviderError::Transient("flaky".to_string()))
        });
        let harness = harness(vec![(ModelTier::Generation, model)]);

        let result = harness.router.submit(leave_task().with_max_retries(2)).await;

        // Transient errors never escalate; exhausted means a hard failure.
        assert_eq!(result.outcome, ExecutionOutcome::Failed);
        assert_eq!(result.retries, 2);
        assert_eq!(result.error_code.as_deref(), Some("transient_error"));
        assert_eq!(harness.gateway.requests().len(), 0);

        // Two retried attempts plus the final exhausted one, all traced.
        let trace = &harness.store.traces()[0];
        let failure_steps = trace
            .steps
            .iter()
            .filter(|step| step.step_type == StepType::ExecutionRetry)
            .count();
        assert_eq!(failure_steps, 3);
    }

    #[tokio::test]
    async fn transient_exhaustion_swaps_to_the_alternate_for_the_last_attempt() {
        let harness = harness(vec![
            (
                ModelTier::Generation,
                ScriptedModel::healthy("gen-a")
                    .push_error(ProviderError::Transient("reset".to_string()))
                    .push_error(ProviderError::Transient("reset".to_string())),
            ),
            (ModelTier::Generation, ScriptedModel::healthy("gen-b")),
        ]);

        let result = harness.router.submit(leave_task().with_max_retries(2)).await;

        // The primary keeps its retry budget; the swap happens only for the
        // final attempt.
        assert!(result.success());
        assert_eq!(result.retries, 2);
        assert!(result.fallback_used);
        assert_eq!(result.final_model_id.as_deref(), Some("gen-b"));
        assert_eq!(harness.models[0].completions_requested(), 2);
        assert_eq!(harness.models[1].completions_requested(), 1);
    }

    #[tokio::test]
    async fn quality_retry_carries_feedback_to_the_next_attempt() {
        let low_quality = Completion {
            text: "meh".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            quality_score: Some(0.5),
        };
        let harness = harness(vec![
            (
                ModelTier::Generation,
                ScriptedModel::healthy("gen-a").push_outcome(Ok(low_quality)),
            ),
            (ModelTier::Generation, ScriptedModel::healthy("gen-b")),
        ]);

        let result = harness.router.submit(leave_task().with_quality_threshold(0.9)).await;
        assert!(result.success());

        let first = harness.models[0].last_request().unwrap();
        assert!(first.quality_feedback.is_none());
        let retried = harness.models[1].last_request().unwrap();
        let feedback = retried.quality_feedback.unwrap();
        assert!(feedback.contains("below threshold"));
    }

    #[tokio::test]
    async fn unavailable_provider_swaps_model_immediately() {
        let harness = harness(vec![
            (
                ModelTier::Generation,
                ScriptedModel::healthy("gen-a")
                    .push_error(ProviderError::Unavailable("503".to_string())),
            ),
            (ModelTier::Generation, ScriptedModel::healthy("gen-b")),
        ]);

        let result = harness.router.submit(leave_task()).await;

        assert!(result.success());
        assert_eq!(result.retries, 1);
        assert!(result.fallback_used);
        assert_eq!(result.final_model_id.as_deref(), Some("gen-b"));
        assert_eq!(harness.models[1].completions_requested(), 1);
    }

    #[tokio::test]
    async fn rate_limit_backs_off_on_the_same_model_honoring_retry_after() {
        let harness = harness(vec![
            (
                ModelTier::Generation,
                ScriptedModel::healthy("gen-a")
                    .push_error(ProviderError::RateLimited { retry_after_seconds: Some(2) }),
            ),
            (ModelTier::Generation, ScriptedModel::healthy("gen-b")),
        ]);

        let result = harness.router.submit(leave_task()).await;

        assert!(result.success());
        assert_eq!(result.retries, 1);
        assert!(!result.fallback_used);
        assert_eq!(result.final_model_id.as_deref(), Some("gen-a"));
        assert_eq!(harness.delay.delays(), vec![Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn governance_mandate_escalates_before_any_model_call() {
        let harness = harness(vec![(ModelTier::Generation, ScriptedModel::healthy("gen-a"))]);

        let task = Task::new("draft a termination letter for this employee", "test-tenant");
        let result = harness.router.submit(task).await;

        assert_eq!(result.outcome, ExecutionOutcome::Escalated);
        assert_eq!(result.error_code.as_deref(), Some("human_review_required"));
        assert_eq!(harness.models[0].completions_requested(), 0);
        assert_eq!(harness.gateway.requests().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retries_and_never_escalates() {
        let cancel = CancelToken::new();
        let model = ScriptedModel::healthy("gen-a")
            .push_error(ProviderError::Unavailable("503".to_string()))
            .push_error(ProviderError::Unavailable("503".to_string()));
        let harness = harness_with_delay(
            vec![(ModelTier::Generation, model)],
            RecordingDelay::cancelling(cancel.clone()),
        );

        let result = harness.router.submit_with_cancel(leave_task(), cancel).await;

        assert_eq!(result.outcome, ExecutionOutcome::Cancelled);
        assert_eq!(result.error_code.as_deref(), Some("cancelled"));
        assert_eq!(harness.gateway.requests().len(), 0);
        // The trace is still finalized and persisted.
        let trace = &harness.store.traces()[0];
        assert!(!trace.success);
        assert_eq!(trace.response_type.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn identical_tasks_produce_identical_trace_hashes() {
        let run = || async {
            let harness = harness(vec![(
                ModelTier::Generation,
                ScriptedModel::healthy("gen-a").with_steady_response("same answer"),
            )]);
            let result = harness.router.submit(leave_task()).await;
            assert!(result.success());
            harness.store.traces()[0].trace_hash.clone().unwrap()
        };

        let first = run().await;
        let second = run().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn low_quality_output_retries_on_a_different_model() {
        let low_quality = Completion {
            text: "meh".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            quality_score: Some(0.5),
        };
        let harness = harness(vec![
            (
                ModelTier::Generation,
                ScriptedModel::healthy("gen-a").push_outcome(Ok(low_quality)),
            ),
            (ModelTier::Generation, ScriptedModel::healthy("gen-b")),
        ]);

        let result = harness.router.submit(leave_task().with_quality_threshold(0.9)).await;

        assert!(result.success());
        assert_eq!(result.retries, 1);
        assert!(result.fallback_used);
        assert_eq!(result.final_model_id.as_deref(), Some("gen-b"));
    }

    #[tokio::test]
    async fn degraded_quality_is_accepted_after_fallback_by_default() {
        let low_quality = Completion {
            text: "short answer".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            quality_score: Some(0.5),
        };
        let harness = harness(vec![
            (
                ModelTier::Generation,
                ScriptedModel::healthy("gen-a")
                    .push_error(ProviderError::Unavailable("503".to_string())),
            ),
            (
                ModelTier::Generation,
                ScriptedModel::healthy("gen-b").push_outcome(Ok(low_quality)),
            ),
        ]);

        let result = harness.router.submit(leave_task().with_quality_threshold(0.9)).await;

        assert!(result.success());
        assert!(result.fallback_used);
        assert_eq!(result.response.as_deref(), Some("short answer"));
    }

    #[tokio::test]
    async fn escalation_disabled_returns_hard_failure() {
        let harness = harness(vec![(
            ModelTier::Generation,
            ScriptedModel::healthy("gen-a").push_error(ProviderError::Auth("bad key".to_string())),
        )]);

        let result =
            harness.router.submit(leave_task().with_escalate_on_failure(false)).await;

        assert_eq!(result.outcome, ExecutionOutcome::Failed);
        assert_eq!(result.error_code.as_deref(), Some("auth_error"));
        assert_eq!(harness.gateway.requests().len(), 0);
    }

    #[tokio::test]
    async fn fallback_disabled_keeps_the_selected_model() {
        let harness = harness(vec![
            (
                ModelTier::Generation,
                ScriptedModel::healthy("gen-a")
                    .with_probe_report(ProbeReport::unreachable("down")),
            ),
            (ModelTier::Generation, ScriptedModel::healthy("gen-b")),
        ]);

        let result = harness.router.submit(leave_task().with_allow_fallback(false)).await;

        assert!(result.success());
        assert!(!result.fallback_used);
        assert_eq!(result.final_model_id.as_deref(), Some("gen-a"));
    }

    #[tokio::test]
    async fn empty_tier_walks_down_to_the_next_populated_tier() {
        let harness = harness(vec![(ModelTier::Local, ScriptedModel::healthy("local-a"))]);

        let result = harness
            .router
            .submit(leave_task().with_tier_hint(ModelTier::Reasoning))
            .await;

        assert!(result.success());
        assert_eq!(result.final_model_id.as_deref(), Some("local-a"));
    }

    #[tokio::test]
    async fn no_models_at_all_fails_with_a_definite_error() {
        let harness = harness(vec![]);

        let result = harness.router.submit(leave_task()).await;

        assert_eq!(result.outcome, ExecutionOutcome::Failed);
        assert_eq!(result.error_code.as_deref(), Some("no_models_for_tier"));
        assert!(!harness.store.traces()[0].success);
    }

    #[tokio::test]
    async fn successful_execution_records_usage() {
        let quota = AllowAllQuota::new();
        let mut harness = harness(vec![(ModelTier::Generation, ScriptedModel::healthy("gen-a"))]);
        harness.router = harness.router.with_quota(Arc::new(quota.clone()));

        let result = harness.router.submit(leave_task().with_department("hr")).await;

        assert!(result.success());
        let usage = quota.recorded_usage();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].department_id.as_deref(), Some("hr"));
        assert!(usage[0].tokens_used > 0);
    }
}

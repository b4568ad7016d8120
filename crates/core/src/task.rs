use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::escalation::EscalationReference;
use crate::registry::ModelTier;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

/// One unit of work submitted for automated completion.
///
/// Immutable after submission: the router owns the task for the duration of
/// one execution attempt and never mutates it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub tenant_id: TenantId,
    pub user_id: String,
    pub department_id: Option<String>,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub tier_hint: Option<ModelTier>,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub max_retries: u32,
    pub allow_fallback: bool,
    pub escalate_on_failure: bool,
    pub quality_threshold: Option<f32>,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    pub fn new(prompt: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: TaskId(Uuid::new_v4().to_string()),
            tenant_id: TenantId(tenant_id.into()),
            user_id: "anonymous".to_string(),
            department_id: None,
            prompt: prompt.into(),
            system_prompt: None,
            tier_hint: None,
            max_output_tokens: 1024,
            temperature: 0.2,
            max_retries: DEFAULT_MAX_RETRIES,
            allow_fallback: true,
            escalate_on_failure: true,
            quality_threshold: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_department(mut self, department_id: impl Into<String>) -> Self {
        self.department_id = Some(department_id.into());
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_tier_hint(mut self, tier: ModelTier) -> Self {
        self.tier_hint = Some(tier);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_allow_fallback(mut self, allow_fallback: bool) -> Self {
        self.allow_fallback = allow_fallback;
        self
    }

    pub fn with_escalate_on_failure(mut self, escalate_on_failure: bool) -> Self {
        self.escalate_on_failure = escalate_on_failure;
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f32) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    /// Rough token estimate used for the quota reservation.
    pub fn estimated_tokens(&self) -> u64 {
        let prompt_chars = self.prompt.len() + self.system_prompt.as_deref().map_or(0, str::len);
        (prompt_chars as u64 / 4) + u64::from(self.max_output_tokens)
    }
}

/// Terminal state of one task as seen by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Escalated,
    Failed,
    Cancelled,
}

/// Returned to the caller; transient, not persisted beyond the trace it
/// summarizes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub trace_id: String,
    pub outcome: ExecutionOutcome,
    pub response: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retries: u32,
    pub retry_reasons: Vec<String>,
    pub fallback_used: bool,
    pub original_model_id: Option<String>,
    pub final_model_id: Option<String>,
    pub total_latency_ms: u64,
    pub retry_after_seconds: Option<u64>,
    pub escalation: Option<EscalationReference>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.outcome == ExecutionOutcome::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_defaults_match_submission_contract() {
        let task = Task::new("summarize the onboarding doc", "acme");

        assert_eq!(task.max_retries, 3);
        assert!(task.allow_fallback);
        assert!(task.escalate_on_failure);
        assert!(task.tier_hint.is_none());
        assert!(task.quality_threshold.is_none());
        assert_eq!(task.tenant_id, TenantId("acme".to_string()));
    }

    #[test]
    fn estimated_tokens_accounts_for_prompt_and_output_budget() {
        let task = Task::new("a".repeat(400), "acme");
        assert_eq!(task.estimated_tokens(), 100 + 1024);
    }
}

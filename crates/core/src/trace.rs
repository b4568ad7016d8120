//! Decision traces: the complete, hashable record of one task's resolution.
//!
//! Steps are append-only and never mutated after the fact. The trace hash is
//! computed over a canonical subset of the trace that excludes every
//! timestamp and generated identifier, so re-executing the same task against
//! the same provider behavior produces the same hash byte for byte.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::pipeline::{GovernanceOutcome, IntentResult, RiskResult};
use crate::registry::ModelTier;
use crate::task::Task;

/// Bumped whenever the persisted trace format changes shape.
pub const TRACE_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    IntentClassification,
    RiskAssessment,
    GovernanceCheck,
    AgentRouting,
    ModelSelection,
    ResponseGeneration,
    ToolCallBlocked,
    ExecutionRetry,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub step_type: StepType,
    pub input: Value,
    pub output: Value,
    pub blocked_tool: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl TraceStep {
    pub fn new(step_type: StepType, input: Value, output: Value) -> Self {
        Self { step_type, input, output, blocked_tool: None, occurred_at: Utc::now() }
    }

    pub fn blocked_tool_call(tool: impl Into<String>, input: Value, output: Value) -> Self {
        Self {
            step_type: StepType::ToolCallBlocked,
            input,
            output,
            blocked_tool: Some(tool.into()),
            occurred_at: Utc::now(),
        }
    }
}

/// Which model the router settled on and why. Produced once per task and
/// embedded into the trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub tier: ModelTier,
    pub model_id: String,
    pub fallback_used: bool,
    pub alternatives: Vec<String>,
    pub rationale: String,
}

/// The aggregate audit record for one task. Owned exclusively by the router
/// during execution; immutable once finalized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub trace_version: u32,
    pub trace_id: String,
    pub request_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub request_text: String,
    pub intent: Option<IntentResult>,
    pub risk: Option<RiskResult>,
    pub governance: Option<GovernanceOutcome>,
    pub routing: Option<RoutingDecision>,
    pub model_selection: Option<String>,
    pub steps: Vec<TraceStep>,
    pub blocked_tool_calls: Vec<String>,
    pub response_text: Option<String>,
    pub response_type: Option<String>,
    pub success: bool,
    pub trace_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Canonical subset fed to the hash. Field order is fixed; nothing here may
/// carry a timestamp or generated id.
#[derive(Serialize)]
struct CanonicalTrace<'a> {
    trace_version: u32,
    request_text: &'a str,
    tenant_id: &'a str,
    user_id: &'a str,
    intent: &'a Option<IntentResult>,
    risk: &'a Option<RiskResult>,
    governance: &'a Option<GovernanceOutcome>,
    routing: &'a Option<RoutingDecision>,
    model_selection: &'a Option<String>,
    response_type: &'a Option<String>,
    success: bool,
}

fn compute_hash(trace: &DecisionTrace) -> String {
    let canonical = CanonicalTrace {
        trace_version: trace.trace_version,
        request_text: &trace.request_text,
        tenant_id: &trace.tenant_id,
        user_id: &trace.user_id,
        intent: &trace.intent,
        risk: &trace.risk,
        governance: &trace.governance,
        routing: &trace.routing,
        model_selection: &trace.model_selection,
        response_type: &trace.response_type,
        success: trace.success,
    };
    // Struct field order is the canonical key order; serde_json emits it
    // verbatim, so the bytes are stable across runs.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

/// Accumulates the trace for one task. `append_step` is the only way steps
/// enter the trace and there is no way to remove one.
#[derive(Clone, Debug)]
pub struct TraceBuilder {
    trace: DecisionTrace,
}

impl TraceBuilder {
    pub fn new(task: &Task) -> Self {
        Self {
            trace: DecisionTrace {
                trace_version: TRACE_VERSION,
                trace_id: Uuid::new_v4().to_string(),
                request_id: task.id.0.clone(),
                tenant_id: task.tenant_id.0.clone(),
                user_id: task.user_id.clone(),
                request_text: task.prompt.clone(),
                intent: None,
                risk: None,
                governance: None,
                routing: None,
                model_selection: None,
                steps: Vec::new(),
                blocked_tool_calls: Vec::new(),
                response_text: None,
                response_type: None,
                success: false,
                trace_hash: None,
                created_at: Utc::now(),
                completed_at: None,
            },
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    pub fn append_step(&mut self, step: TraceStep) {
        if let Some(tool) = &step.blocked_tool {
            self.trace.blocked_tool_calls.push(tool.clone());
        }
        self.trace.steps.push(step);
    }

    pub fn set_intent(&mut self, intent: IntentResult) {
        self.trace.intent = Some(intent);
    }

    pub fn set_risk(&mut self, risk: RiskResult) {
        self.trace.risk = Some(risk);
    }

    pub fn set_governance(&mut self, governance: GovernanceOutcome) {
        self.trace.governance = Some(governance);
    }

    pub fn set_routing(&mut self, routing: RoutingDecision) {
        self.trace.model_selection = Some(routing.model_id.clone());
        self.trace.routing = Some(routing);
    }

    /// Record the model the execution actually finished on, which may differ
    /// from the routed model after reactive fallback.
    pub fn set_final_model(&mut self, model_id: impl Into<String>) {
        self.trace.model_selection = Some(model_id.into());
    }

    pub fn set_response(&mut self, text: impl Into<String>, response_type: impl Into<String>) {
        self.trace.response_text = Some(text.into());
        self.trace.response_type = Some(response_type.into());
    }

    /// Explicit marker that automated resolution stopped at the human-review
    /// boundary. Participates in the content hash via `response_type`.
    pub fn mark_escalated(&mut self) {
        self.trace.response_type = Some("escalation".to_string());
    }

    pub fn mark_cancelled(&mut self) {
        self.trace.response_type = Some("cancelled".to_string());
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.trace.steps
    }

    /// Seal the trace: set the success flag, compute the content hash, stamp
    /// the completion time. Idempotent with respect to the hash.
    pub fn finalize(mut self, success: bool) -> DecisionTrace {
        self.trace.success = success;
        self.trace.trace_hash = Some(compute_hash(&self.trace));
        self.trace.completed_at = Some(Utc::now());
        self.trace
    }
}

impl DecisionTrace {
    /// Recompute the canonical hash of a finalized trace. Equal to the stored
    /// hash for an untampered trace, however many times it is called.
    pub fn recompute_hash(&self) -> String {
        compute_hash(self)
    }
}

//! Steward core - governed request-execution engine
//!
//! This crate is the engine that takes an incoming task (a user query that
//! needs a completion from an AI model), selects a model, executes it with
//! bounded retry and tiered fallback, records a deterministic, replayable
//! decision trace, and hands off to human review when automated resolution
//! is not safe or not possible.
//!
//! # Architecture
//!
//! One task flows through a fixed pipeline:
//! 1. **Quota gate** (`quota`) - per-tenant admission, consulted before
//!    anything else
//! 2. **Classification** (`pipeline`) - deterministic intent, risk, and
//!    governance checks; governance can mandate human review outright
//! 3. **Selection** (`registry`, `health`) - tier-appropriate model choice,
//!    steered away from unhealthy providers before any attempt is spent
//! 4. **Execution** (`router`) - bounded retry with linear backoff and
//!    taxonomy-driven fallback
//! 5. **Hand-off** (`escalation`) - at most one escalation per task, after
//!    which the engine never retries
//!
//! Every decision lands in an append-only `trace::DecisionTrace` whose
//! content hash excludes all timestamps and generated ids, so identical
//! inputs against identical provider behavior hash identically.
//!
//! # Safety Principle
//!
//! The language model is strictly a text generator. Whether a task runs at
//! all, which model serves it, and whether a human must review it are
//! deterministic decisions made by this engine.

pub mod audit;
pub mod config;
pub mod errors;
pub mod escalation;
pub mod health;
pub mod pipeline;
pub mod provider;
pub mod quota;
pub mod registry;
pub mod router;
pub mod store;
pub mod task;
pub mod trace;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use config::{ConfigError, EngineConfig, LogFormat, ModelConfig, ProviderKind, TenantConfig};
pub use errors::{
    EngineError, EscalateAction, FallbackAction, ProviderError, RecoveryPolicy,
};
pub use escalation::{
    EscalationGateway, EscalationReference, EscalationRequest, InMemoryEscalationGateway,
};
pub use health::{HealthMonitor, HealthThresholds, ModelHealth};
pub use pipeline::{
    GovernanceOutcome, GovernancePolicy, IntentClassifier, IntentResult, RiskAssessor, RiskLevel,
    RiskResult,
};
pub use provider::{Completion, CompletionModel, CompletionRequest, ProbeReport, ScriptedModel};
pub use quota::{AllowAllQuota, DenyAllQuota, QuotaDecision, QuotaGate, UsageRecord};
pub use registry::{ModelDescriptor, ModelRegistry, ModelTier};
pub use router::{CancelToken, ExecutionRouter, RetryDelay, RouterConfig, TokioDelay};
pub use store::{InMemoryTraceStore, JsonlTraceStore, TraceStore};
pub use task::{ExecutionOutcome, ExecutionResult, Task, TaskId, TenantId};
pub use trace::{
    DecisionTrace, RoutingDecision, StepType, TraceBuilder, TraceStep, TRACE_VERSION,
};

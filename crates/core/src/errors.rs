//! Error taxonomy and recovery policy.
//!
//! Every provider failure is classified into one of a small set of kinds; the
//! recovery policy for each kind (retry / fallback / escalate) is a pure
//! lookup so the router's behavior stays deterministic and auditable.

use thiserror::Error;

use crate::registry::ModelTier;

/// A failure surfaced by a completion provider, classified for recovery.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider rate limited")]
    RateLimited { retry_after_seconds: Option<u64> },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("authentication or configuration error: {0}")]
    Auth(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider call timed out after {0}ms")]
    Timeout(u64),
    #[error("output quality {score} below threshold {threshold}")]
    QualityBelowThreshold { score: f32, threshold: f32 },
}

impl ProviderError {
    /// Stable machine-readable code surfaced in results and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable(_) => "provider_unavailable",
            Self::Auth(_) => "auth_error",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Timeout(_) => "timeout",
            Self::QualityBelowThreshold { .. } => "quality_below_threshold",
        }
    }
}

/// Whether and when a failed attempt may move to a different model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackAction {
    /// Never swap models for this error kind.
    No,
    /// Keep the current model until only one retry remains, then swap.
    AfterRetries,
    /// Swap before the next attempt.
    Immediate,
    /// The current model produced unusable output; swap before the next
    /// attempt.
    DifferentModel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscalateAction {
    No,
    IfExhausted,
    Immediate,
}

/// One row of the recovery table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub retry: bool,
    pub fallback: FallbackAction,
    pub escalate: EscalateAction,
}

impl RecoveryPolicy {
    pub fn for_error(error: &ProviderError) -> Self {
        match error {
            ProviderError::Transient(_) => Self {
                retry: true,
                fallback: FallbackAction::AfterRetries,
                escalate: EscalateAction::No,
            },
            ProviderError::RateLimited { .. } => {
                Self { retry: true, fallback: FallbackAction::No, escalate: EscalateAction::No }
            }
            ProviderError::Unavailable(_) => Self {
                retry: true,
                fallback: FallbackAction::Immediate,
                escalate: EscalateAction::IfExhausted,
            },
            ProviderError::Auth(_) | ProviderError::InvalidRequest(_) => Self {
                retry: false,
                fallback: FallbackAction::No,
                escalate: EscalateAction::Immediate,
            },
            ProviderError::Timeout(_) => Self {
                retry: true,
                fallback: FallbackAction::AfterRetries,
                escalate: EscalateAction::IfExhausted,
            },
            ProviderError::QualityBelowThreshold { .. } => Self {
                retry: true,
                fallback: FallbackAction::DifferentModel,
                escalate: EscalateAction::IfExhausted,
            },
        }
    }
}

/// Engine-level failures outside the provider taxonomy.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("no models configured for tier {0:?} or any cheaper tier")]
    NoModelsForTier(ModelTier),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("escalation gateway failure: {0}")]
    Escalation(String),
    #[error("trace persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoModelsForTier(_) => "no_models_for_tier",
            Self::UnknownModel(_) => "unknown_model",
            Self::Escalation(_) => "escalation_failed",
            Self::Persistence(_) => "trace_persistence_failed",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_retry_and_never_escalate() {
        let policy = RecoveryPolicy::for_error(&ProviderError::Transient("reset".to_string()));
        assert!(policy.retry);
        assert_eq!(policy.fallback, FallbackAction::AfterRetries);
        assert_eq!(policy.escalate, EscalateAction::No);
    }

    #[test]
    fn rate_limits_back_off_on_the_same_model() {
        let policy =
            RecoveryPolicy::for_error(&ProviderError::RateLimited { retry_after_seconds: Some(5) });
        assert!(policy.retry);
        assert_eq!(policy.fallback, FallbackAction::No);
        assert_eq!(policy.escalate, EscalateAction::No);
    }

    #[test]
    fn unavailable_swaps_immediately_and_escalates_when_exhausted() {
        let policy = RecoveryPolicy::for_error(&ProviderError::Unavailable("down".to_string()));
        assert!(policy.retry);
        assert_eq!(policy.fallback, FallbackAction::Immediate);
        assert_eq!(policy.escalate, EscalateAction::IfExhausted);
    }

    #[test]
    fn permanent_errors_bypass_retry_and_escalate_immediately() {
        for error in [
            ProviderError::Auth("bad key".to_string()),
            ProviderError::InvalidRequest("empty prompt".to_string()),
        ] {
            let policy = RecoveryPolicy::for_error(&error);
            assert!(!policy.retry);
            assert_eq!(policy.fallback, FallbackAction::No);
            assert_eq!(policy.escalate, EscalateAction::Immediate);
        }
    }

    #[test]
    fn quality_failures_retry_on_a_different_model() {
        let policy = RecoveryPolicy::for_error(&ProviderError::QualityBelowThreshold {
            score: 0.3,
            threshold: 0.8,
        });
        assert!(policy.retry);
        assert_eq!(policy.fallback, FallbackAction::DifferentModel);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ProviderError::Timeout(30_000).code(), "timeout");
        assert_eq!(ProviderError::RateLimited { retry_after_seconds: None }.code(), "rate_limited");
        assert_eq!(EngineError::UnknownModel("x".to_string()).code(), "unknown_model");
    }
}

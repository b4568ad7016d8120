//! Human-review boundary.
//!
//! The engine calls the gateway at most once per task and never retries a
//! task after handing it over. Queueing, reviewer assignment, and
//! notifications live behind this trait, outside the engine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::task::{TaskId, TenantId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub task_id: TaskId,
    pub tenant_id: TenantId,
    pub user_id: String,
    pub original_query: String,
    /// The best automated response available at hand-off, if any.
    pub proposed_response: Option<String>,
    pub reason: String,
    pub trace_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationReference {
    pub approval_id: String,
    pub requested_at: DateTime<Utc>,
}

#[async_trait]
pub trait EscalationGateway: Send + Sync {
    async fn request_escalation(
        &self,
        request: EscalationRequest,
    ) -> Result<EscalationReference, EngineError>;
}

/// Records every hand-off; the default gateway for tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryEscalationGateway {
    requests: Arc<Mutex<Vec<EscalationRequest>>>,
}

impl InMemoryEscalationGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<EscalationRequest> {
        match self.requests.lock() {
            Ok(requests) => requests.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl EscalationGateway for InMemoryEscalationGateway {
    async fn request_escalation(
        &self,
        request: EscalationRequest,
    ) -> Result<EscalationReference, EngineError> {
        match self.requests.lock() {
            Ok(mut requests) => requests.push(request),
            Err(poisoned) => poisoned.into_inner().push(request),
        }
        Ok(EscalationReference {
            approval_id: Uuid::new_v4().to_string(),
            requested_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_gateway_records_the_hand_off() {
        let gateway = InMemoryEscalationGateway::new();
        let reference = gateway
            .request_escalation(EscalationRequest {
                task_id: TaskId("t-1".to_string()),
                tenant_id: TenantId("acme".to_string()),
                user_id: "u-1".to_string(),
                original_query: "original question".to_string(),
                proposed_response: None,
                reason: "auth_error".to_string(),
                trace_id: "trace-1".to_string(),
            })
            .await
            .unwrap();

        assert!(!reference.approval_id.is_empty());
        let requests = gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].reason, "auth_error");
    }
}

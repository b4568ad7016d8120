//! Per-tenant quota boundary.
//!
//! Consulted once per task before model selection; a denial short-circuits
//! the state machine without ever executing. The quota subsystem itself is
//! external; the engine only honors this interface.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub retry_after_seconds: Option<u64>,
}

impl QuotaDecision {
    pub fn allow() -> Self {
        Self { allowed: true, retry_after_seconds: None }
    }

    pub fn deny(retry_after_seconds: u64) -> Self {
        Self { allowed: false, retry_after_seconds: Some(retry_after_seconds) }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub department_id: Option<String>,
    pub tokens_used: u64,
    pub cost_usd: Decimal,
}

#[async_trait]
pub trait QuotaGate: Send + Sync {
    async fn check_and_reserve(
        &self,
        user_id: &str,
        department_id: Option<&str>,
        estimated_tokens: u64,
    ) -> QuotaDecision;

    async fn record_usage(&self, record: UsageRecord);
}

/// Permits everything and remembers recorded usage. The default gate when no
/// quota subsystem is wired in.
#[derive(Clone, Default)]
pub struct AllowAllQuota {
    usage: Arc<Mutex<Vec<UsageRecord>>>,
}

impl AllowAllQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded_usage(&self) -> Vec<UsageRecord> {
        match self.usage.lock() {
            Ok(usage) => usage.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl QuotaGate for AllowAllQuota {
    async fn check_and_reserve(
        &self,
        _user_id: &str,
        _department_id: Option<&str>,
        _estimated_tokens: u64,
    ) -> QuotaDecision {
        QuotaDecision::allow()
    }

    async fn record_usage(&self, record: UsageRecord) {
        match self.usage.lock() {
            Ok(mut usage) => usage.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

/// Denies everything with a fixed retry-after. Test double for the denial
/// path.
#[derive(Clone, Debug)]
pub struct DenyAllQuota {
    pub retry_after_seconds: u64,
}

#[async_trait]
impl QuotaGate for DenyAllQuota {
    async fn check_and_reserve(
        &self,
        _user_id: &str,
        _department_id: Option<&str>,
        _estimated_tokens: u64,
    ) -> QuotaDecision {
        QuotaDecision::deny(self.retry_after_seconds)
    }

    async fn record_usage(&self, _record: UsageRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_gate_permits_and_records_usage() {
        let gate = AllowAllQuota::new();
        assert!(gate.check_and_reserve("u-1", Some("hr"), 500).await.allowed);

        gate.record_usage(UsageRecord {
            user_id: "u-1".to_string(),
            department_id: Some("hr".to_string()),
            tokens_used: 1_200,
            cost_usd: Decimal::new(42, 3), // 0.042
        })
        .await;

        let usage = gate.recorded_usage();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].tokens_used, 1_200);
    }

    #[tokio::test]
    async fn deny_all_gate_reports_retry_after() {
        let gate = DenyAllQuota { retry_after_seconds: 30 };
        let decision = gate.check_and_reserve("u-1", None, 500).await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_seconds, Some(30));
    }
}

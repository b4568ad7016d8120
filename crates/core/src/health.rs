//! Time-bounded cache of per-model health.
//!
//! Shared across concurrent tasks. Reads never wait on an in-flight probe: a
//! cache hit inside the TTL is returned unchanged, a miss probes the adapter
//! without holding the lock and writes the result last-writer-wins. A small
//! number of redundant probes during a concurrent miss is acceptable.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::{CompletionModel, ProbeReport};

pub const DEFAULT_HEALTH_TTL_SECS: i64 = 60;
pub const DEFAULT_MAX_HEALTHY_LATENCY_MS: u64 = 5_000;
pub const DEFAULT_MAX_HEALTHY_ERROR_RATE: f64 = 0.05;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub error_rate: f64,
    pub observed_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct HealthThresholds {
    pub max_latency_ms: u64,
    pub max_error_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_latency_ms: DEFAULT_MAX_HEALTHY_LATENCY_MS,
            max_error_rate: DEFAULT_MAX_HEALTHY_ERROR_RATE,
        }
    }
}

impl HealthThresholds {
    fn classify(&self, report: &ProbeReport) -> bool {
        report.reachable
            && report.latency_ms < self.max_latency_ms
            && report.error_rate < self.max_error_rate
    }
}

pub struct HealthMonitor {
    ttl: Duration,
    thresholds: HealthThresholds,
    cache: RwLock<HashMap<String, ModelHealth>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::with_ttl_secs(DEFAULT_HEALTH_TTL_SECS)
    }

    pub fn with_ttl_secs(ttl_secs: i64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_secs),
            thresholds: HealthThresholds::default(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Current health for one model: fresh cache entry if present, otherwise
    /// probe and cache. Probe failures yield `healthy=false`, never an error.
    pub async fn check(&self, model: &Arc<dyn CompletionModel>) -> ModelHealth {
        let model_id = model.model_id().to_string();
        let now = Utc::now();

        if let Some(cached) = self.cached(&model_id) {
            if now - cached.observed_at < self.ttl {
                return cached;
            }
        }

        // Probe without holding the lock so concurrent readers keep moving.
        let report = model.probe().await;
        let health = ModelHealth {
            healthy: self.thresholds.classify(&report),
            latency_ms: report.latency_ms,
            error_rate: report.error_rate,
            observed_at: Utc::now(),
            error: report.error,
        };
        debug!(
            model = %model_id,
            healthy = health.healthy,
            latency_ms = health.latency_ms,
            "model health refreshed"
        );

        match self.cache.write() {
            Ok(mut cache) => {
                cache.insert(model_id, health.clone());
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(model_id, health.clone());
            }
        }
        health
    }

    /// Cached entry regardless of freshness, if any.
    pub fn cached(&self, model_id: &str) -> Option<ModelHealth> {
        match self.cache.read() {
            Ok(cache) => cache.get(model_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(model_id).cloned(),
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedModel;

    fn as_model(model: ScriptedModel) -> Arc<dyn CompletionModel> {
        let arc: Arc<ScriptedModel> = Arc::new(model);
        arc
    }

    #[tokio::test]
    async fn fresh_cache_entry_skips_the_probe() {
        let monitor = HealthMonitor::with_ttl_secs(60);
        let scripted = Arc::new(ScriptedModel::healthy("m1"));
        let model: Arc<dyn CompletionModel> = scripted.clone();

        let first = monitor.check(&model).await;
        let second = monitor.check(&model).await;

        assert!(first.healthy);
        assert_eq!(first, second);
        assert_eq!(scripted.probes_requested(), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_reprobed() {
        let monitor = HealthMonitor::with_ttl_secs(0);
        let scripted = Arc::new(ScriptedModel::healthy("m1"));
        let model: Arc<dyn CompletionModel> = scripted.clone();

        monitor.check(&model).await;
        monitor.check(&model).await;

        assert_eq!(scripted.probes_requested(), 2);
    }

    #[tokio::test]
    async fn unreachable_probe_is_unhealthy_not_an_error() {
        let monitor = HealthMonitor::new();
        let model =
            as_model(ScriptedModel::healthy("m1").with_probe_report(ProbeReport::unreachable(
                "dns failure",
            )));

        let health = monitor.check(&model).await;
        assert!(!health.healthy);
        assert_eq!(health.error.as_deref(), Some("dns failure"));
    }

    #[tokio::test]
    async fn slow_or_flaky_models_are_classified_unhealthy() {
        let monitor = HealthMonitor::new();

        let slow = as_model(ScriptedModel::healthy("slow").with_probe_report(ProbeReport {
            reachable: true,
            latency_ms: 6_000,
            error_rate: 0.0,
            error: None,
        }));
        assert!(!monitor.check(&slow).await.healthy);

        let flaky = as_model(ScriptedModel::healthy("flaky").with_probe_report(ProbeReport {
            reachable: true,
            latency_ms: 100,
            error_rate: 0.2,
            error: None,
        }));
        assert!(!monitor.check(&flaky).await.healthy);
    }
}

//! The completion-capability seam.
//!
//! Each provider is one implementation of a narrow trait: `complete` for real
//! work, `probe` for liveness. The registry maps model ids to instances; the
//! router only ever sees the trait object.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::task::Task;

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Rejection notice from a previous quality failure, threaded into the
    /// retried attempt.
    pub quality_feedback: Option<String>,
}

impl CompletionRequest {
    pub fn from_task(task: &Task) -> Self {
        Self {
            prompt: task.prompt.clone(),
            system_prompt: task.system_prompt.clone(),
            max_output_tokens: task.max_output_tokens,
            temperature: task.temperature,
            quality_feedback: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Self-reported or heuristic quality in [0, 1], when available.
    pub quality_score: Option<f32>,
}

/// Outcome of a liveness probe. Never an error: an unreachable provider is a
/// report with `reachable=false`.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeReport {
    pub reachable: bool,
    pub latency_ms: u64,
    pub error_rate: f64,
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn unreachable(error: impl Into<String>) -> Self {
        Self { reachable: false, latency_ms: 0, error_rate: 1.0, error: Some(error.into()) }
    }
}

#[async_trait]
pub trait CompletionModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;

    async fn probe(&self) -> ProbeReport;
}

/// In-memory scriptable model for tests and smoke checks.
///
/// Outcomes are consumed in order; once the script is empty the model keeps
/// returning the configured steady-state response.
pub struct ScriptedModel {
    model_id: String,
    script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    steady_response: String,
    probe_report: ProbeReport,
    completions_requested: AtomicUsize,
    probes_requested: AtomicUsize,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn healthy(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            script: Mutex::new(VecDeque::new()),
            steady_response: "ok".to_string(),
            probe_report: ProbeReport {
                reachable: true,
                latency_ms: 120,
                error_rate: 0.0,
                error: None,
            },
            completions_requested: AtomicUsize::new(0),
            probes_requested: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn with_steady_response(mut self, text: impl Into<String>) -> Self {
        self.steady_response = text.into();
        self
    }

    pub fn with_probe_report(mut self, report: ProbeReport) -> Self {
        self.probe_report = report;
        self
    }

    /// Queue one scripted outcome ahead of the steady-state response.
    pub fn push_outcome(self, outcome: Result<Completion, ProviderError>) -> Self {
        match self.script.lock() {
            Ok(mut script) => script.push_back(outcome),
            Err(poisoned) => poisoned.into_inner().push_back(outcome),
        }
        self
    }

    pub fn push_error(self, error: ProviderError) -> Self {
        self.push_outcome(Err(error))
    }

    pub fn completions_requested(&self) -> usize {
        self.completions_requested.load(Ordering::SeqCst)
    }

    pub fn probes_requested(&self) -> usize {
        self.probes_requested.load(Ordering::SeqCst)
    }

    /// The most recent request seen by `complete`, if any.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        match self.last_request.lock() {
            Ok(request) => request.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn steady_completion(&self) -> Completion {
        Completion {
            text: self.steady_response.clone(),
            input_tokens: 20,
            output_tokens: 40,
            quality_score: Some(0.95),
        }
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.completions_requested.fetch_add(1, Ordering::SeqCst);
        match self.last_request.lock() {
            Ok(mut last) => *last = Some(request.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(request.clone()),
        }
        let scripted = match self.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        scripted.unwrap_or_else(|| Ok(self.steady_completion()))
    }

    async fn probe(&self) -> ProbeReport {
        self.probes_requested.fetch_add(1, Ordering::SeqCst);
        self.probe_report.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_drain_before_steady_state() {
        let model = ScriptedModel::healthy("m1")
            .with_steady_response("steady")
            .push_error(ProviderError::Transient("blip".to_string()));

        let request = CompletionRequest {
            prompt: "hello".to_string(),
            system_prompt: None,
            max_output_tokens: 64,
            temperature: 0.0,
            quality_feedback: None,
        };

        assert!(model.complete(&request).await.is_err());
        let completion = model.complete(&request).await.unwrap();
        assert_eq!(completion.text, "steady");
        assert_eq!(model.completions_requested(), 2);
        assert_eq!(model.last_request().unwrap().prompt, "hello");
    }

    #[tokio::test]
    async fn probe_returns_configured_report_and_counts() {
        let model = ScriptedModel::healthy("m1")
            .with_probe_report(ProbeReport::unreachable("connection refused"));

        let report = model.probe().await;
        assert!(!report.reachable);
        assert_eq!(report.error.as_deref(), Some("connection refused"));
        assert_eq!(model.probes_requested(), 1);
    }
}

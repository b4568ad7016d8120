//! Append-only persistence for finalized decision traces.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::errors::EngineError;
use crate::trace::DecisionTrace;

pub trait TraceStore: Send + Sync {
    /// Persist a finalized trace. Traces are only ever appended.
    fn persist(&self, trace: &DecisionTrace) -> Result<(), EngineError>;
}

#[derive(Clone, Default)]
pub struct InMemoryTraceStore {
    traces: Arc<Mutex<Vec<DecisionTrace>>>,
}

impl InMemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<DecisionTrace> {
        match self.traces.lock() {
            Ok(traces) => traces.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TraceStore for InMemoryTraceStore {
    fn persist(&self, trace: &DecisionTrace) -> Result<(), EngineError> {
        match self.traces.lock() {
            Ok(mut traces) => traces.push(trace.clone()),
            Err(poisoned) => poisoned.into_inner().push(trace.clone()),
        }
        Ok(())
    }
}

/// One JSON record per line, append-only. The `trace_version` field inside
/// each record keeps the format readable across versions.
#[derive(Clone, Debug)]
pub struct JsonlTraceStore {
    path: PathBuf,
}

impl JsonlTraceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TraceStore for JsonlTraceStore {
    fn persist(&self, trace: &DecisionTrace) -> Result<(), EngineError> {
        let line = serde_json::to_string(trace)
            .map_err(|error| EngineError::Persistence(error.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|error| EngineError::Persistence(error.to_string()))?;
        writeln!(file, "{line}").map_err(|error| EngineError::Persistence(error.to_string()))?;
        Ok(())
    }
}

// murmuration/src/error.rs
//
// Error taxonomy for a detection run.
//
// Only DetectError aborts a run. Everything else is a Diagnostic: recorded in
// the run-scoped collector, counted, and surfaced in the DiagnosticReport while
// the run carries on.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Detail lines kept per run; counts keep going past this.
const MAX_DETAILS: usize = 256;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("run cancelled during {0}")]
    Cancelled(&'static str),

    #[error("worker task failed: {0}")]
    Worker(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("non-finite value {value} for feature '{key}'")]
    NonFinite { key: String, value: f64 },

    #[error("extension key '{0}' must be 1-64 chars of [a-z0-9_]")]
    InvalidKey(String),

    #[error("extension key '{0}' shadows a fixed feature signal")]
    ShadowsFixedSignal(String),

    #[error("more than {max} extension features")]
    TooManyExtensions { max: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("model returned invalid probability {0}")]
    InvalidOutput(f64),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("threshold store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("threshold store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

// ── Non-fatal diagnostics ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    IngestionMismatch,
    InsufficientData,
    ModelUnavailable,
    CalibrationFailure,
    GraphConstruction,
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    #[error("edge {origin} -> {target} references unknown account '{unknown}'")]
    IngestionMismatch { origin: String, target: String, unknown: String },

    #[error("insufficient data for '{entity_id}': {detail}")]
    InsufficientData { entity_id: String, detail: String },

    #[error("classifier unavailable for '{entity_id}', rule-based score used: {detail}")]
    ModelUnavailable { entity_id: String, detail: String },

    #[error("calibration failed for '{metric}': {detail}")]
    CalibrationFailure { metric: String, detail: String },

    #[error("rejected edge {origin} -> {target}: {detail}")]
    GraphConstruction { origin: String, target: String, detail: String },
}

impl Diagnostic {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            Self::IngestionMismatch { .. } => DiagnosticKind::IngestionMismatch,
            Self::InsufficientData { .. } => DiagnosticKind::InsufficientData,
            Self::ModelUnavailable { .. } => DiagnosticKind::ModelUnavailable,
            Self::CalibrationFailure { .. } => DiagnosticKind::CalibrationFailure,
            Self::GraphConstruction { .. } => DiagnosticKind::GraphConstruction,
        }
    }
}

/// Run-scoped sink shared by every component of a run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    inner: Mutex<DiagnosticsInner>,
}

#[derive(Debug, Default)]
struct DiagnosticsInner {
    counts: BTreeMap<DiagnosticKind, u64>,
    details: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, diagnostic: Diagnostic) {
        let mut inner = self.inner.lock();
        *inner.counts.entry(diagnostic.kind()).or_default() += 1;
        if inner.details.len() < MAX_DETAILS {
            inner.details.push(diagnostic);
        }
    }

    pub fn extend(&self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for d in diagnostics {
            self.record(d);
        }
    }

    pub fn count(&self, kind: DiagnosticKind) -> u64 {
        self.inner.lock().counts.get(&kind).copied().unwrap_or(0)
    }

    /// Snapshot with details sorted so concurrent recording order does not leak out.
    pub fn report(&self) -> DiagnosticReport {
        let inner = self.inner.lock();
        let mut details = inner.details.clone();
        details.sort_by_key(|d| (d.kind(), d.to_string()));
        DiagnosticReport {
            counts: inner.counts.clone(),
            truncated: inner.counts.values().sum::<u64>() as usize > details.len(),
            details,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticReport {
    pub counts: BTreeMap<DiagnosticKind, u64>,
    pub details: Vec<Diagnostic>,
    pub truncated: bool,
}

impl DiagnosticReport {
    pub fn count(&self, kind: DiagnosticKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

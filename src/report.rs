use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};

use crate::config::PublicEngineConfig;
use crate::errors::ProviderError;
use crate::model::{AddressCandidate, Coordinate, Record};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Found { coordinate: Coordinate },
    NotFound,
    /// The provider answered with a coordinate that failed the plausibility bound.
    Implausible { coordinate: Coordinate },
    Error { kind: String, message: String },
}

impl AttemptOutcome {
    pub fn from_error(err: &ProviderError) -> Self {
        AttemptOutcome::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, AttemptOutcome::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub query: AddressCandidate,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Override,
    Direct,
    /// Resolved by the candidate at this 1-based position (always >= 2).
    Fallback(usize),
    Failed,
    SkippedMobile,
    SkippedNoAddress,
}

impl Method {
    pub fn for_candidate(position: usize) -> Self {
        if position <= 1 {
            Method::Direct
        } else {
            Method::Fallback(position)
        }
    }

    pub fn label(&self) -> String {
        match self {
            Method::Override => "override".into(),
            Method::Direct => "direct".into(),
            Method::Fallback(n) => format!("fallback_{n}"),
            Method::Failed => "failed".into(),
            Method::SkippedMobile => "skipped_mobile".into(),
            Method::SkippedNoAddress => "skipped_no_address".into(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Method::SkippedMobile | Method::SkippedNoAddress)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for Method {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// Outcome for one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    /// Position of the record in the batch.
    pub index: usize,
    pub record: Record,
    pub coordinate: Option<Coordinate>,
    pub method: Method,
    pub attempts: Vec<Attempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Resolution {
    pub fn new(record: Record, method: Method) -> Self {
        Self {
            index: 0,
            record,
            coordinate: None,
            method,
            attempts: Vec::new(),
            note: None,
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// True when attempts were made and every one of them was a provider error.
    pub fn provider_unreachable(&self) -> bool {
        self.method == Method::Failed
            && !self.attempts.is_empty()
            && self.attempts.iter().all(|a| a.outcome.is_error())
    }

    fn failure_kind(&self) -> String {
        if let Some(note) = &self.note {
            return note.clone();
        }
        match self.attempts.last().map(|a| &a.outcome) {
            Some(AttemptOutcome::Error { kind, .. }) => kind.clone(),
            Some(AttemptOutcome::Implausible { .. }) => "implausible".into(),
            Some(_) => "not_found".into(),
            None => "no_attempts".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub overridden: usize,
    pub resolved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub success_rate: f64,
}

/// Triage entry for a record that needs a manual override.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub row_number: usize,
    pub name: String,
    pub raw_address: String,
    pub queries: Vec<String>,
    pub last_error: Option<String>,
}

impl From<&Resolution> for FailureDetail {
    fn from(resolution: &Resolution) -> Self {
        let last_error = resolution
            .attempts
            .iter()
            .rev()
            .find_map(|attempt| match &attempt.outcome {
                AttemptOutcome::Error { message, .. } => Some(message.clone()),
                _ => None,
            })
            .or_else(|| resolution.note.clone());
        Self {
            row_number: resolution.record.row_number,
            name: resolution.record.name.clone(),
            raw_address: resolution.record.raw_address.clone(),
            queries: resolution
                .attempts
                .iter()
                .map(|attempt| attempt.query.to_string())
                .collect(),
            last_error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    Cancelled,
    Aborted { reason: String },
}

/// Accumulates resolutions for a batch. Appends are safe from concurrent
/// workers; readers always see batch order.
#[derive(Debug)]
pub struct ResolutionReport {
    started_at: DateTime<Utc>,
    entries: Mutex<Vec<Resolution>>,
}

impl Default for ResolutionReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, resolution: Resolution) {
        self.entries.lock().push(resolution);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn resolutions(&self) -> Vec<Resolution> {
        let mut entries = self.entries.lock().clone();
        entries.sort_by_key(|r| r.index);
        entries
    }

    pub fn summary(&self) -> Summary {
        summarize(&self.entries.lock())
    }

    pub fn failures(&self) -> Vec<FailureDetail> {
        self.resolutions()
            .iter()
            .filter(|r| r.method == Method::Failed)
            .map(FailureDetail::from)
            .collect()
    }

    pub fn failures_by_kind(&self) -> BTreeMap<String, Vec<FailureDetail>> {
        let mut grouped: BTreeMap<String, Vec<FailureDetail>> = BTreeMap::new();
        for resolution in self.resolutions().iter().filter(|r| r.method == Method::Failed) {
            grouped
                .entry(resolution.failure_kind())
                .or_default()
                .push(FailureDetail::from(resolution));
        }
        grouped
    }

    pub fn finish(self, status: BatchStatus, config: Option<PublicEngineConfig>) -> BatchReport {
        let failures = self.failures();
        let failures_by_kind = self.failures_by_kind();
        let summary = self.summary();
        let resolutions = self.resolutions();
        BatchReport {
            status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            config,
            summary,
            failures,
            failures_by_kind,
            resolutions,
        }
    }
}

fn summarize(entries: &[Resolution]) -> Summary {
    let mut summary = Summary {
        total: entries.len(),
        overridden: 0,
        resolved: 0,
        skipped: 0,
        failed: 0,
        success_rate: 1.0,
    };
    for entry in entries {
        match entry.method {
            Method::Override => summary.overridden += 1,
            Method::Direct | Method::Fallback(_) => summary.resolved += 1,
            Method::SkippedMobile | Method::SkippedNoAddress => summary.skipped += 1,
            Method::Failed => summary.failed += 1,
        }
    }
    let attempted = summary.total - summary.skipped;
    if attempted > 0 {
        summary.success_rate = (summary.overridden + summary.resolved) as f64 / attempted as f64;
    }
    summary
}

/// Final, serializable result of a batch run handed to the rendering side.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<PublicEngineConfig>,
    pub summary: Summary,
    pub failures: Vec<FailureDetail>,
    /// Failures keyed by the last error seen, for override triage.
    pub failures_by_kind: BTreeMap<String, Vec<FailureDetail>>,
    pub resolutions: Vec<Resolution>,
}

impl BatchReport {
    /// Records with a usable coordinate, in batch order.
    pub fn placed(&self) -> impl Iterator<Item = (&Record, Coordinate)> {
        self.resolutions
            .iter()
            .filter_map(|r| r.coordinate.map(|c| (&r.record, c)))
    }
}

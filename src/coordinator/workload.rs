//! The contract between the coordinator and a pluggable unit of work
//!
//! A workload owns the meaning of its phases; the coordinator owns ordering,
//! durability and failover. `advance` must be idempotent: after a failover
//! the coordinator may re-enter a phase whose action was interrupted partway.

use crate::common::Result;
use crate::coordinator::document::{Progress, StateDocument, WorkloadPhase};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Failure classification is the workload's call, never inferred from the
/// error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadError {
    /// Retry the same phase later; nothing durable is recorded
    Transient(String),
    /// The phase can never complete; recorded as the terminal failed phase
    Fatal(String),
}

impl std::fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadError::Transient(reason) => write!(f, "transient: {}", reason),
            WorkloadError::Fatal(reason) => write!(f, "fatal: {}", reason),
        }
    }
}

/// Result of one phase action
#[derive(Debug, Clone)]
pub struct Transition<P> {
    pub next: P,
    /// Fields merged into the document's durable progress
    pub progress: Progress,
}

impl<P> Transition<P> {
    pub fn to(next: P) -> Self {
        Self {
            next,
            progress: Progress::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.progress.insert(field.to_string(), value);
        self
    }
}

/// What a start request does when the instance key already finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalPolicy {
    /// A different request for a finished key is a conflict
    Conflict,
    /// A different request for a finished key starts its next generation
    Supersede,
}

/// In-memory counters that are reported but never made durable
#[derive(Debug, Clone, Default)]
pub struct LiveProgress {
    fields: Arc<Mutex<Progress>>,
}

impl LiveProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, field: &str, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.lock().insert(field.to_string(), value);
    }

    pub fn increment(&self, field: &str, by: u64) -> u64 {
        let mut fields = self.lock();
        let next = fields.get(field).and_then(|v| v.as_u64()).unwrap_or(0) + by;
        fields.insert(field.to_string(), next.into());
        next
    }

    pub fn get_u64(&self, field: &str) -> u64 {
        self.lock().get(field).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Progress {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.fields.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-invocation context handed to phase actions
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub instance_key: String,
    pub term: u64,
    pub live: LiveProgress,
    pub now: DateTime<Utc>,
}

pub trait Workload: Send + Sync + 'static {
    type Phase: WorkloadPhase;
    type Request: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Short name used in logs, metrics and reports
    const KIND: &'static str;
    /// Store namespace of this workload's state documents
    const NAMESPACE: &'static str;

    /// Reject malformed requests before any durable state exists.
    fn validate(&self, request: &Self::Request) -> Result<()>;

    fn instance_key(&self, request: &Self::Request) -> String;

    /// Request parameters that decide "same request" versus "conflict"
    fn fingerprint_fields(&self, request: &Self::Request) -> serde_json::Value;

    /// Phase a start request waits for before returning
    fn wait_target(&self, request: &Self::Request) -> Self::Phase;

    /// Whether the operation parks in `phase` until a forget is recorded
    fn awaits_forget(&self, _phase: Self::Phase) -> bool {
        false
    }

    /// Forward jump taken when a forget arrives while still in `phase`
    fn forget_target(&self, _phase: Self::Phase) -> Option<Self::Phase> {
        None
    }

    fn terminal_policy(&self) -> TerminalPolicy {
        TerminalPolicy::Conflict
    }

    /// Whether the durable progress shows `phase` already fully completed
    fn can_skip(&self, _phase: Self::Phase, _progress: &Progress) -> bool {
        false
    }

    /// Run the action of `phase` and name the phase that follows.
    ///
    /// Returning `phase` itself checkpoints the progress without advancing;
    /// `can_skip` then decides when the phase is complete.
    fn advance(
        &self,
        ctx: &PhaseContext,
        phase: Self::Phase,
        request: &Self::Request,
        progress: &Progress,
    ) -> impl Future<Output = std::result::Result<Transition<Self::Phase>, WorkloadError>> + Send;

    /// Background activity while parked in a phase that awaits forget.
    fn idle(
        &self,
        _ctx: &PhaseContext,
        _phase: Self::Phase,
        _request: &Self::Request,
    ) -> impl Future<Output = ()> + Send {
        std::future::pending()
    }

    /// Report fields for a document, gated on the phase it reached.
    fn report(
        &self,
        doc: &StateDocument<Self::Phase, Self::Request>,
        live: &Progress,
    ) -> serde_json::Map<String, serde_json::Value>;
}

//! State documents: the durable record of one long-running operation

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Progress fields accumulated by a workload, keyed by report field name
pub type Progress = BTreeMap<String, serde_json::Value>;

/// Hash of the semantically relevant request parameters.
///
/// Two requests for the same instance key are identical iff their
/// fingerprints are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// BLAKE3 over the canonical JSON encoding (object keys are sorted).
    pub fn of(fields: &serde_json::Value) -> Self {
        let mut hasher = blake3::Hasher::new();
        canonical_json(fields, &mut hasher);
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn canonical_json(value: &serde_json::Value, hasher: &mut blake3::Hasher) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                canonical_json(&map[key.as_str()], hasher);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                canonical_json(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => {
            hasher.update(scalar.to_string().as_bytes());
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// Ordered phases of a workload.
///
/// `Ord` is the progression order. Terminal phases (including the failure
/// phase) sort after every non-terminal phase.
pub trait WorkloadPhase:
    Copy + Ord + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Phase a freshly created document is persisted in
    fn initial() -> Self;
    /// Terminal phase recording a fatal workload error
    fn failed() -> Self;
    /// Successor on the happy path, `None` for terminal phases
    fn next(self) -> Option<Self>;
    fn is_terminal(self) -> bool;
    fn name(self) -> &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument<P, R> {
    pub instance_key: String,
    /// Bumped when a completed operation is superseded by a new request
    pub generation: u64,
    pub phase: P,
    pub desired_state: R,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub forget_requested: bool,
    #[serde(default)]
    pub garbage_collectable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default)]
    pub num_restarts: u64,
    /// Term of the primary that wrote this version
    pub term: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
}

impl<P: WorkloadPhase, R> StateDocument<P, R> {
    pub fn new(
        instance_key: impl Into<String>,
        desired_state: R,
        fingerprint: Fingerprint,
        term: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_key: instance_key.into(),
            generation: 1,
            phase: P::initial(),
            desired_state,
            fingerprint,
            progress: Progress::new(),
            forget_requested: false,
            garbage_collectable: false,
            failure: None,
            num_restarts: 0,
            term,
            created_at: now,
            updated_at: now,
            expire_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_failed(&self) -> bool {
        self.phase == P::failed()
    }

    /// Whether a primary still has work to do on this document.
    pub fn needs_driver(&self) -> bool {
        !self.is_terminal() || (self.forget_requested && !self.garbage_collectable)
    }

    pub fn progress_field(&self, name: &str) -> Option<&serde_json::Value> {
        self.progress.get(name)
    }
}

//! State document store
//!
//! One namespace per workload kind. Documents are JSON encoded. The store
//! enforces the document invariants on every replace:
//! - phase never regresses within a generation
//! - `expire_at` is never cleared once set
//! - `garbage_collectable` never reverts to false

use crate::common::storage::DocumentBackend;
use crate::common::{Error, Result};
use crate::coordinator::document::{StateDocument, WorkloadPhase};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed view over one namespace of the backend
pub struct DocumentCollection<P, R> {
    backend: Arc<dyn DocumentBackend>,
    ns: &'static str,
    _marker: PhantomData<fn() -> (P, R)>,
}

impl<P, R> Clone for DocumentCollection<P, R> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            ns: self.ns,
            _marker: PhantomData,
        }
    }
}

impl<P, R> DocumentCollection<P, R>
where
    P: WorkloadPhase,
    R: Serialize + DeserializeOwned,
{
    pub fn new(backend: Arc<dyn DocumentBackend>, ns: &'static str) -> Self {
        Self {
            backend,
            ns,
            _marker: PhantomData,
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.ns
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<StateDocument<P, R>> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::DocumentCorrupted(format!("{}: {}", key, e)))
    }

    fn write(&self, doc: &StateDocument<P, R>) -> Result<()> {
        let value = serde_json::to_vec(doc)?;
        self.backend.put(self.ns, &doc.instance_key, &value)
    }

    pub fn get(&self, key: &str) -> Result<Option<StateDocument<P, R>>> {
        match self.backend.get(self.ns, key)? {
            Some(bytes) => Ok(Some(Self::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert a brand-new document
    pub fn insert(&self, doc: &StateDocument<P, R>) -> Result<()> {
        if self.backend.get(self.ns, &doc.instance_key)?.is_some() {
            return Err(Error::DuplicateKey(doc.instance_key.clone()));
        }
        self.write(doc)
    }

    /// Replace the current version of a document
    pub fn replace(&self, doc: &StateDocument<P, R>) -> Result<()> {
        let current = self
            .get(&doc.instance_key)?
            .ok_or_else(|| Error::NotFound(doc.instance_key.clone()))?;

        if current.instance_key != doc.instance_key {
            return Err(Error::InvariantViolation(format!(
                "{}: stored under instance key {}",
                doc.instance_key, current.instance_key
            )));
        }
        if current.generation != doc.generation {
            return Err(Error::InvariantViolation(format!(
                "{}: stale generation {} (stored {})",
                doc.instance_key, doc.generation, current.generation
            )));
        }
        if doc.phase < current.phase {
            return Err(Error::PhaseRegression {
                key: doc.instance_key.clone(),
                from: current.phase.name().to_string(),
                to: doc.phase.name().to_string(),
            });
        }
        if current.expire_at.is_some() && doc.expire_at.is_none() {
            return Err(Error::InvariantViolation(format!(
                "{}: expireAt cannot be cleared",
                doc.instance_key
            )));
        }
        if current.garbage_collectable && !doc.garbage_collectable {
            return Err(Error::InvariantViolation(format!(
                "{}: garbageCollectable cannot be reverted",
                doc.instance_key
            )));
        }

        self.write(doc)
    }

    /// Replace a terminal document by the next generation of the same key
    pub fn supersede(&self, doc: &StateDocument<P, R>) -> Result<()> {
        let current = self
            .get(&doc.instance_key)?
            .ok_or_else(|| Error::NotFound(doc.instance_key.clone()))?;

        if !current.is_terminal() {
            return Err(Error::InvariantViolation(format!(
                "{}: only a terminal document can be superseded",
                doc.instance_key
            )));
        }
        if doc.generation != current.generation + 1 {
            return Err(Error::InvariantViolation(format!(
                "{}: generation must advance from {} to {}",
                doc.instance_key,
                current.generation,
                current.generation + 1
            )));
        }

        self.write(doc)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(self.ns, key)
    }

    /// List all documents in this namespace
    pub fn list(&self) -> Result<Vec<StateDocument<P, R>>> {
        self.backend
            .scan(self.ns)?
            .into_iter()
            .map(|(key, bytes)| Self::decode(&key, &bytes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemBackend;
    use crate::coordinator::document::Fingerprint;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    enum Step {
        One,
        Two,
        Done,
        Failed,
    }

    impl WorkloadPhase for Step {
        fn initial() -> Self {
            Step::One
        }
        fn failed() -> Self {
            Step::Failed
        }
        fn next(self) -> Option<Self> {
            match self {
                Step::One => Some(Step::Two),
                Step::Two => Some(Step::Done),
                _ => None,
            }
        }
        fn is_terminal(self) -> bool {
            matches!(self, Step::Done | Step::Failed)
        }
        fn name(self) -> &'static str {
            match self {
                Step::One => "one",
                Step::Two => "two",
                Step::Done => "done",
                Step::Failed => "failed",
            }
        }
    }

    fn collection() -> DocumentCollection<Step, String> {
        DocumentCollection::new(Arc::new(MemBackend::new()), "test")
    }

    fn doc(key: &str) -> StateDocument<Step, String> {
        StateDocument::new(
            key,
            "payload".to_string(),
            Fingerprint::of(&json!({"v": 1})),
            1,
            Utc::now(),
        )
    }

    #[test]
    fn test_insert_get_delete() {
        let store = collection();
        store.insert(&doc("k1")).unwrap();
        assert!(matches!(store.insert(&doc("k1")), Err(Error::DuplicateKey(_))));

        let loaded = store.get("k1").unwrap().unwrap();
        assert_eq!(loaded.phase, Step::One);
        assert_eq!(loaded.desired_state, "payload");

        store.delete("k1").unwrap();
        assert!(store.get("k1").unwrap().is_none());
    }

    #[test]
    fn test_replace_rejects_phase_regression() {
        let store = collection();
        let mut d = doc("k1");
        store.insert(&d).unwrap();

        d.phase = Step::Two;
        store.replace(&d).unwrap();

        d.phase = Step::One;
        assert!(matches!(
            store.replace(&d),
            Err(Error::PhaseRegression { .. })
        ));
    }

    #[test]
    fn test_expire_at_is_sticky() {
        let store = collection();
        let mut d = doc("k1");
        d.phase = Step::Done;
        d.garbage_collectable = true;
        d.expire_at = Some(Utc::now());
        store.insert(&d).unwrap();

        d.expire_at = None;
        assert!(matches!(
            store.replace(&d),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_supersede_requires_terminal_and_next_generation() {
        let store = collection();
        let mut d = doc("k1");
        store.insert(&d).unwrap();

        let mut next = doc("k1");
        next.generation = 2;
        assert!(store.supersede(&next).is_err());

        d.phase = Step::Done;
        store.replace(&d).unwrap();
        store.supersede(&next).unwrap();
        assert_eq!(store.get("k1").unwrap().unwrap().generation, 2);
        assert_eq!(store.list().unwrap().len(), 1);
    }
}

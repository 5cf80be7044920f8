//! Idempotency registry: in-flight operations of the current primary term
//!
//! Entries are process-local and rebuilt from the store on every step-up; the
//! store alone decides whether an operation truly completed. The registry
//! mutex is only ever held for map updates, never across an await.

use crate::common::{Error, Result};
use crate::coordinator::document::{Fingerprint, StateDocument, WorkloadPhase};
use crate::coordinator::workload::LiveProgress;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

/// Why an in-flight handle stopped without finishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abandoned {
    /// The node stepped down or the term changed
    Interrupted(String),
    /// The request conflicts with the durable document
    Conflict(String),
    /// Validation of the durable state failed
    BadValue(String),
    /// Transient failures outlasted the local retry budget
    RetriesExhausted(String),
    /// The durable write failed
    Storage(String),
}

impl Abandoned {
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::NotWritablePrimary(_)
            | Error::InterruptedDueToReplStateChange(_)
            | Error::WriteConcernFailed(_) => Abandoned::Interrupted(err.to_string()),
            Error::ConflictingOperationInProgress(msg) => Abandoned::Conflict(msg.clone()),
            Error::BadValue(msg) | Error::InvalidOptions(msg) => Abandoned::BadValue(msg.clone()),
            Error::Timeout(msg) => Abandoned::RetriesExhausted(msg.clone()),
            other => Abandoned::Storage(other.to_string()),
        }
    }

    pub fn to_error(&self) -> Error {
        match self {
            Abandoned::Interrupted(msg) => Error::InterruptedDueToReplStateChange(msg.clone()),
            Abandoned::Conflict(msg) => Error::ConflictingOperationInProgress(msg.clone()),
            Abandoned::BadValue(msg) => Error::BadValue(msg.clone()),
            Abandoned::RetriesExhausted(msg) => Error::Timeout(msg.clone()),
            Abandoned::Storage(msg) => Error::Internal(msg.clone()),
        }
    }
}

/// What waiters observe; published after every durable commit
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSnapshot<P> {
    /// `None` until the document is loaded or created
    pub phase: Option<P>,
    pub generation: u64,
    pub forget_requested: bool,
    pub garbage_collectable: bool,
    pub failure: Option<String>,
    pub abandoned: Option<Abandoned>,
    /// No driver will publish to this handle anymore
    pub closed: bool,
}

impl<P> Default for OperationSnapshot<P> {
    fn default() -> Self {
        Self {
            phase: None,
            generation: 0,
            forget_requested: false,
            garbage_collectable: false,
            failure: None,
            abandoned: None,
            closed: false,
        }
    }
}

/// Shared handle of one operation driven by this process
pub struct InFlight<P, R> {
    key: String,
    fingerprint: Fingerprint,
    term: u64,
    doc: RwLock<Option<StateDocument<P, R>>>,
    snapshot: watch::Sender<OperationSnapshot<P>>,
    forget: watch::Sender<bool>,
    live: LiveProgress,
    joiners: AtomicUsize,
}

impl<P: WorkloadPhase, R: Clone> InFlight<P, R> {
    pub fn new(key: impl Into<String>, fingerprint: Fingerprint, term: u64) -> Self {
        Self {
            key: key.into(),
            fingerprint,
            term,
            doc: RwLock::new(None),
            snapshot: watch::channel(OperationSnapshot::default()).0,
            forget: watch::channel(false).0,
            live: LiveProgress::new(),
            joiners: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn live(&self) -> &LiveProgress {
        &self.live
    }

    /// Callers currently waiting on this operation
    pub fn ref_count(&self) -> usize {
        self.joiners.load(Ordering::SeqCst)
    }

    /// Latest committed document
    pub fn document(&self) -> Option<StateDocument<P, R>> {
        self.doc.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn snapshot(&self) -> OperationSnapshot<P> {
        self.snapshot.borrow().clone()
    }

    /// Make a committed document visible to readers and waiters.
    pub fn publish(&self, doc: StateDocument<P, R>) {
        let snapshot = OperationSnapshot {
            phase: Some(doc.phase),
            generation: doc.generation,
            forget_requested: doc.forget_requested,
            garbage_collectable: doc.garbage_collectable,
            failure: doc.failure.clone(),
            abandoned: None,
            closed: false,
        };
        *self.doc.write().unwrap_or_else(|e| e.into_inner()) = Some(doc);
        self.snapshot.send_replace(snapshot);
    }

    pub fn abandon(&self, reason: Abandoned) {
        self.snapshot.send_modify(|s| {
            if s.abandoned.is_none() {
                s.abandoned = Some(reason);
            }
            s.closed = true;
        });
    }

    pub fn close(&self) {
        self.snapshot.send_modify(|s| s.closed = true);
    }

    /// No driver publishes to this handle anymore
    pub fn is_closed(&self) -> bool {
        self.snapshot.borrow().closed
    }

    /// The committed phase is terminal; the driver only has bookkeeping left.
    pub fn is_finished(&self) -> bool {
        self.snapshot.borrow().phase.is_some_and(|p| p.is_terminal())
    }

    pub fn request_forget(&self) {
        self.forget.send_replace(true);
    }

    pub fn forget_pending(&self) -> bool {
        *self.forget.borrow()
    }

    pub async fn forget_signalled(&self) {
        let mut rx = self.forget.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Wait until `done` holds for the published snapshot.
    ///
    /// Returns `Ok(false)` if the handle closed without `done` ever holding,
    /// and the abandonment error if the operation was abandoned.
    pub async fn wait_until(
        &self,
        done: impl Fn(&OperationSnapshot<P>) -> bool,
    ) -> Result<bool> {
        let mut rx = self.snapshot.subscribe();
        self.joiners.fetch_add(1, Ordering::SeqCst);
        let outcome = rx
            .wait_for(|s| done(s) || s.abandoned.is_some() || s.closed)
            .await
            .map(|s| s.clone());
        self.joiners.fetch_sub(1, Ordering::SeqCst);

        let snapshot = outcome.map_err(|_| {
            Error::InterruptedDueToReplStateChange(format!("{}: handle dropped", self.key))
        })?;
        if done(&snapshot) {
            return Ok(true);
        }
        if let Some(reason) = &snapshot.abandoned {
            return Err(reason.to_error());
        }
        Ok(false)
    }
}

/// Result of admitting a request against the registry
pub enum Admission<P, R> {
    /// A new handle was registered; the caller must launch it
    Created(Arc<InFlight<P, R>>),
    /// An identical request is in flight
    Joined(Arc<InFlight<P, R>>),
    /// A different request is in flight
    Conflict(Arc<InFlight<P, R>>),
}

pub struct Registry<P, R> {
    entries: Mutex<HashMap<String, Arc<InFlight<P, R>>>>,
}

impl<P, R> Default for Registry<P, R> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<P: WorkloadPhase, R: Clone> Registry<P, R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<InFlight<P, R>>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join, reject, or register a request for `key`.
    ///
    /// Handles left over from an older term are replaced: their drivers are
    /// already being cancelled. Closed handles are replaced as well.
    pub fn admit(&self, key: &str, fingerprint: &Fingerprint, term: u64) -> Admission<P, R> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(key) {
            if existing.term() >= term && !existing.is_closed() {
                if existing.fingerprint() == fingerprint {
                    return Admission::Joined(existing.clone());
                }
                return Admission::Conflict(existing.clone());
            }
        }
        let handle = Arc::new(InFlight::new(key, fingerprint.clone(), term));
        entries.insert(key.to_string(), handle.clone());
        Admission::Created(handle)
    }

    /// Register a handle for a durable document unless one exists.
    ///
    /// Returns the handle and whether it was newly created.
    pub fn register(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        term: u64,
    ) -> (Arc<InFlight<P, R>>, bool) {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(key) {
            if existing.term() >= term && !existing.is_closed() {
                return (existing.clone(), false);
            }
        }
        let handle = Arc::new(InFlight::new(key, fingerprint.clone(), term));
        entries.insert(key.to_string(), handle.clone());
        (handle, true)
    }

    pub fn get(&self, key: &str) -> Option<Arc<InFlight<P, R>>> {
        self.lock().get(key).cloned()
    }

    /// Remove `handle` if it is still the registered entry for its key.
    pub fn remove(&self, handle: &Arc<InFlight<P, R>>) -> bool {
        let mut entries = self.lock();
        match entries.get(handle.key()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                entries.remove(handle.key());
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Remove and abandon every handle registered in `term` or earlier.
    pub fn clear(&self, term: u64, reason: Abandoned) -> usize {
        let cleared: Vec<_> = {
            let mut entries = self.lock();
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, h)| h.term() <= term)
                .map(|(k, _)| k.clone())
                .collect();
            stale.iter().filter_map(|k| entries.remove(k)).collect()
        };
        for handle in &cleared {
            handle.abandon(reason.clone());
        }
        cleared.len()
    }

    pub fn handles(&self) -> Vec<Arc<InFlight<P, R>>> {
        let mut handles: Vec<_> = self.lock().values().cloned().collect();
        handles.sort_by(|a, b| a.key().cmp(b.key()));
        handles
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

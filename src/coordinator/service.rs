//! The coordinator engine
//!
//! One `Coordinator` per workload kind. Every instance key is driven by at
//! most one tokio task on the current primary; each phase transition is made
//! durable through `ReplicaNode::replicate` before waiters can observe it.
//! Losing primary status cancels every driver without touching the store:
//! the next primary resumes from the last durable phase.

use crate::common::{
    validate_instance_key, Backoff, CoordinatorConfig, CoordinatorMetrics, Error, Result,
};
use crate::coordinator::barrier::{BarrierPoint, Barriers};
use crate::coordinator::document::{Fingerprint, StateDocument, WorkloadPhase};
use crate::coordinator::gc::Collectable;
use crate::coordinator::registry::{Abandoned, Admission, InFlight, Registry};
use crate::coordinator::replica::{ReplicaNode, ReplicaRole};
use crate::coordinator::reporter::OperationReport;
use crate::coordinator::store::DocumentCollection;
use crate::coordinator::workload::{PhaseContext, TerminalPolicy, Workload, WorkloadError};
use crate::common::storage::DocumentBackend;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Doc<W> = StateDocument<<W as Workload>::Phase, <W as Workload>::Request>;
type Handle<W> = Arc<InFlight<<W as Workload>::Phase, <W as Workload>::Request>>;

pub struct Coordinator<W: Workload> {
    workload: W,
    node: Arc<ReplicaNode>,
    store: DocumentCollection<W::Phase, W::Request>,
    registry: Registry<W::Phase, W::Request>,
    barriers: Arc<Barriers>,
    metrics: Arc<CoordinatorMetrics>,
    config: CoordinatorConfig,
}

impl<W: Workload> Coordinator<W> {
    pub fn new(
        workload: W,
        node: Arc<ReplicaNode>,
        backend: Arc<dyn DocumentBackend>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Self::with_barriers(workload, node, backend, config, Arc::new(Barriers::new()))
    }

    pub fn with_barriers(
        workload: W,
        node: Arc<ReplicaNode>,
        backend: Arc<dyn DocumentBackend>,
        config: CoordinatorConfig,
        barriers: Arc<Barriers>,
    ) -> Arc<Self> {
        Arc::new(Self {
            workload,
            node,
            store: DocumentCollection::new(backend, W::NAMESPACE),
            registry: Registry::new(),
            barriers,
            metrics: Arc::new(CoordinatorMetrics::new(W::KIND)),
            config,
        })
    }

    pub fn workload(&self) -> &W {
        &self.workload
    }

    pub fn node(&self) -> &Arc<ReplicaNode> {
        &self.node
    }

    pub fn barriers(&self) -> &Arc<Barriers> {
        &self.barriers
    }

    pub fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }

    /// Start (or join) the operation described by `request`.
    ///
    /// Returns once the operation reached the workload's wait target.
    pub async fn start(self: &Arc<Self>, request: W::Request) -> Result<OperationReport> {
        let term = self.node.primary_term()?;
        self.workload.validate(&request)?;
        let key = self.workload.instance_key(&request);
        validate_instance_key(&key)?;
        let fingerprint = Fingerprint::of(&self.workload.fingerprint_fields(&request));
        let target = self.workload.wait_target(&request);

        let handle = loop {
            match self.registry.admit(&key, &fingerprint, term) {
                Admission::Joined(handle) => {
                    self.metrics.joined.inc();
                    info!(kind = W::KIND, instance = %key, term, "Joined in-flight operation");
                    break handle;
                }
                Admission::Conflict(existing) if existing.is_finished() => {
                    // The driver is only wrapping up; retry once it is gone.
                    let _ = existing.wait_until(|_| false).await;
                }
                Admission::Conflict(existing) => {
                    self.metrics.conflicts.inc();
                    warn!(
                        kind = W::KIND,
                        instance = %key,
                        existing = %existing.fingerprint(),
                        requested = %fingerprint,
                        "Rejected conflicting request"
                    );
                    return Err(Error::ConflictingOperationInProgress(format!(
                        "{} {} is already running with different parameters",
                        W::KIND,
                        key
                    )));
                }
                Admission::Created(handle) => {
                    if let Err(e) = self.launch(&handle, request, term) {
                        handle.abandon(Abandoned::from_error(&e));
                        self.registry.remove(&handle);
                        return Err(e);
                    }
                    break handle;
                }
            }
        };

        let reached = handle
            .wait_until(|s| s.phase.is_some_and(|p| p >= target || p.is_terminal()))
            .await?;
        if !reached {
            return Err(Error::InterruptedDueToReplStateChange(format!(
                "{} {} stopped before reaching {}",
                W::KIND,
                key,
                target.name()
            )));
        }

        let doc = handle
            .document()
            .ok_or_else(|| Error::Internal(format!("{}: no committed document", key)))?;
        if let Some(reason) = &doc.failure {
            return Err(Error::WorkloadFailed {
                key,
                reason: reason.clone(),
            });
        }
        Ok(OperationReport::from_document(
            &self.workload,
            &doc,
            &handle.live().snapshot(),
        ))
    }

    /// Decide what a freshly admitted handle does with the durable document.
    fn launch(self: &Arc<Self>, handle: &Handle<W>, request: W::Request, term: u64) -> Result<()> {
        let key = handle.key();
        let existing = self.store.get(key)?;

        let doc = match existing {
            None => {
                let fingerprint = handle.fingerprint().clone();
                let doc = StateDocument::new(key, request, fingerprint, term, Utc::now());
                self.node.replicate(term, || self.store.insert(&doc))?;
                info!(
                    kind = W::KIND,
                    instance = %key,
                    phase = doc.phase.name(),
                    term,
                    "Persisted state document"
                );
                self.metrics.started.inc();
                handle.publish(doc);
                self.spawn_driver(handle.clone(), term, true);
                return Ok(());
            }
            Some(doc) => doc,
        };

        let same_request = doc.fingerprint == *handle.fingerprint();
        if same_request && doc.needs_driver() {
            info!(
                kind = W::KIND,
                instance = %key,
                phase = doc.phase.name(),
                term,
                "Resuming operation on request"
            );
            self.metrics.resumed.inc();
            handle.publish(doc);
            self.spawn_driver(handle.clone(), term, false);
            return Ok(());
        }
        if same_request {
            debug!(
                kind = W::KIND,
                instance = %key,
                phase = doc.phase.name(),
                "Operation already finished"
            );
            handle.publish(doc);
            self.registry.remove(handle);
            handle.close();
            return Ok(());
        }

        if doc.needs_driver() || self.workload.terminal_policy() == TerminalPolicy::Conflict {
            self.metrics.conflicts.inc();
            warn!(
                kind = W::KIND,
                instance = %key,
                phase = doc.phase.name(),
                "Rejected request conflicting with durable state"
            );
            return Err(Error::ConflictingOperationInProgress(format!(
                "{} {} exists with different parameters (phase {})",
                W::KIND,
                key,
                doc.phase.name()
            )));
        }

        let fingerprint = handle.fingerprint().clone();
        let mut next = StateDocument::new(key, request, fingerprint, term, Utc::now());
        next.generation = doc.generation + 1;
        self.node.replicate(term, || self.store.supersede(&next))?;
        info!(
            kind = W::KIND,
            instance = %key,
            generation = next.generation,
            term,
            "Superseded finished operation"
        );
        self.metrics.started.inc();
        handle.publish(next);
        self.spawn_driver(handle.clone(), term, true);
        Ok(())
    }

    /// Request that a finished operation becomes garbage collectable.
    ///
    /// Waits until `garbage_collectable` is durable. Unknown or already
    /// collectable keys are acknowledged without writing anything.
    pub async fn forget(self: &Arc<Self>, key: &str) -> Result<()> {
        let term = self.node.primary_term()?;
        validate_instance_key(key)?;

        loop {
            let live = self
                .registry
                .get(key)
                .filter(|h| h.term() >= term && !h.is_closed());
            let handle = match live {
                Some(handle) => handle,
                None => {
                    let Some(doc) = self.store.get(key)? else {
                        debug!(kind = W::KIND, instance = %key, "Forget for unknown operation");
                        return Ok(());
                    };
                    if doc.garbage_collectable {
                        return Ok(());
                    }
                    let (handle, created) = self.registry.register(key, &doc.fingerprint, term);
                    if created {
                        handle.publish(doc);
                        self.spawn_driver(handle.clone(), term, false);
                    }
                    handle
                }
            };

            handle.request_forget();
            info!(kind = W::KIND, instance = %key, term, "Received forget");
            if handle.wait_until(|s| s.garbage_collectable).await? {
                return Ok(());
            }
            // The handle closed before recording the forget; look again.
            self.node.primary_term()?;
        }
    }

    /// In-flight report for `key`, if this process is driving it
    pub fn lookup(&self, key: &str) -> Option<OperationReport> {
        let handle = self.registry.get(key)?;
        let doc = handle.document()?;
        Some(OperationReport::from_document(
            &self.workload,
            &doc,
            &handle.live().snapshot(),
        ))
    }

    /// Report for `key` from memory, falling back to the store.
    pub fn query(&self, key: &str) -> Result<OperationReport> {
        if let Some(report) = self.lookup(key) {
            return Ok(report);
        }
        let doc = self
            .store
            .get(key)?
            .ok_or_else(|| Error::NotFound(format!("{} {}", W::KIND, key)))?;
        Ok(OperationReport::from_document(
            &self.workload,
            &doc,
            &Default::default(),
        ))
    }

    /// Latest committed document for `key`
    pub fn document(&self, key: &str) -> Result<Option<Doc<W>>> {
        if let Some(doc) = self.registry.get(key).and_then(|h| h.document()) {
            return Ok(Some(doc));
        }
        self.store.get(key)
    }

    /// Every operation in flight in this process.
    ///
    /// On a primary, forgotten operations stay listed until they are deleted.
    pub fn current_op(&self) -> Vec<OperationReport> {
        let mut reports: Vec<OperationReport> = self
            .registry
            .handles()
            .into_iter()
            .filter_map(|handle| {
                let doc = handle.document()?;
                Some(OperationReport::from_document(
                    &self.workload,
                    &doc,
                    &handle.live().snapshot(),
                ))
            })
            .collect();
        if !self.node.is_primary() {
            return reports;
        }

        match self.store.list() {
            Ok(docs) => {
                let collectable: Vec<OperationReport> = docs
                    .iter()
                    .filter(|doc| doc.garbage_collectable)
                    .filter(|doc| !reports.iter().any(|r| r.instance_id == doc.instance_key))
                    .map(|doc| {
                        OperationReport::from_document(&self.workload, doc, &Default::default())
                    })
                    .collect();
                reports.extend(collectable);
                reports.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
            }
            Err(e) => warn!(kind = W::KIND, error = %e, "Failed to list forgotten operations"),
        }
        reports
    }

    /// Resume every unfinished document after becoming primary in `term`.
    pub fn step_up(self: &Arc<Self>, term: u64) -> Result<usize> {
        if !self.node.is_primary_in(term) {
            return Err(Error::NotWritablePrimary(
                self.node.primary().unwrap_or_else(|| "unknown".to_string()),
            ));
        }

        let mut resumed = 0;
        for doc in self.store.list()? {
            if !doc.needs_driver() {
                continue;
            }
            let (handle, created) =
                self.registry.register(&doc.instance_key, &doc.fingerprint, term);
            if !created {
                continue;
            }
            info!(
                kind = W::KIND,
                instance = %doc.instance_key,
                phase = doc.phase.name(),
                term,
                "Resuming operation after step-up"
            );
            handle.publish(doc);
            self.metrics.resumed.inc();
            self.spawn_driver(handle, term, false);
            resumed += 1;
        }

        info!(kind = W::KIND, term, resumed, "Rebuilt in-flight operations");
        Ok(resumed)
    }

    /// Abandon every handle of the terms this node no longer leads.
    pub fn step_down(&self) -> usize {
        let state = self.node.state();
        let through = match state.role {
            ReplicaRole::Primary => state.term.saturating_sub(1),
            ReplicaRole::Secondary => state.term,
        };
        let cleared = self.registry.clear(
            through,
            Abandoned::Interrupted(format!("{} is no longer primary", self.node.node_id())),
        );
        if cleared > 0 {
            info!(kind = W::KIND, through_term = through, cleared, "Cleared in-flight operations");
        }
        cleared
    }

    /// Follow replica state changes, rebuilding and clearing the registry.
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut rx = self.node.subscribe();
        tokio::spawn(async move {
            let mut leading: Option<u64> = None;
            loop {
                let state = rx.borrow_and_update().clone();
                let primary_term = (state.role == ReplicaRole::Primary).then_some(state.term);
                if primary_term != leading {
                    if leading.is_some() {
                        this.step_down();
                    }
                    if let Some(term) = primary_term {
                        if let Err(e) = this.step_up(term) {
                            error!(
                                kind = W::KIND,
                                term,
                                error = %e,
                                "Failed to rebuild in-flight operations"
                            );
                        }
                    }
                    leading = primary_term;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_driver(self: &Arc<Self>, handle: Handle<W>, term: u64, created: bool) {
        self.metrics.in_flight.inc();
        let this = self.clone();
        tokio::spawn(async move { this.drive(handle, term, created).await });
    }

    async fn drive(self: Arc<Self>, handle: Handle<W>, term: u64, created: bool) {
        let mut guard = DriverGuard {
            coordinator: &self,
            handle: &handle,
            term,
            finished: false,
        };
        let outcome = tokio::select! {
            res = self.drive_phases(&handle, term, created) => res,
            _ = self.node.lost_primary(term) => Err(Error::InterruptedDueToReplStateChange(
                format!("{} left term {}", self.node.node_id(), term),
            )),
        };

        if let Err(e) = outcome {
            self.metrics.abandoned.inc();
            warn!(
                kind = W::KIND,
                instance = %handle.key(),
                term,
                error = %e,
                "Abandoned in-flight operation"
            );
            handle.abandon(Abandoned::from_error(&e));
        }
        guard.finished = true;
    }

    async fn drive_phases(&self, handle: &Handle<W>, term: u64, created: bool) -> Result<()> {
        let key = handle.key();
        let mut doc = handle
            .document()
            .ok_or_else(|| Error::Internal(format!("{}: driver started without a document", key)))?;

        if created {
            self.barriers.hit(BarrierPoint::AfterPersistingStateDoc).await;
        } else if doc.term < term && !doc.is_terminal() {
            doc.num_restarts += 1;
            self.commit(handle, &mut doc, term)?;
        }

        let mut backoff = self.backoff();
        let mut failures = 0usize;
        loop {
            if doc.is_terminal() {
                return self.finish(handle, &mut doc, term).await;
            }

            if handle.forget_pending() && !doc.forget_requested {
                doc.forget_requested = true;
                let phase = doc.phase;
                if let Some(target) = self.workload.forget_target(phase) {
                    info!(
                        kind = W::KIND,
                        instance = %key,
                        from = phase.name(),
                        to = target.name(),
                        "Forget ends unfinished operation"
                    );
                    doc.phase = target;
                    doc.failure = Some(format!("forgotten while {}", phase.name()));
                }
                self.commit(handle, &mut doc, term)?;
                self.barriers.hit(BarrierPoint::AfterReceivingForget).await;
                continue;
            }

            let phase = doc.phase;
            if self.workload.awaits_forget(phase) && !doc.forget_requested {
                let ctx = self.context(handle, term);
                tokio::select! {
                    _ = handle.forget_signalled() => {}
                    _ = self.workload.idle(&ctx, phase, &doc.desired_state) => {
                        handle.forget_signalled().await;
                    }
                }
                continue;
            }

            if self.workload.can_skip(phase, &doc.progress) {
                if let Some(next) = phase.next() {
                    info!(
                        kind = W::KIND,
                        instance = %key,
                        phase = phase.name(),
                        next = next.name(),
                        "Phase marker is durable, advancing without replay"
                    );
                    doc.phase = next;
                    self.commit(handle, &mut doc, term)?;
                    self.barriers.hit(BarrierPoint::AfterCommit(next.name())).await;
                    continue;
                }
            }

            self.barriers.hit(BarrierPoint::BeforeAdvance(phase.name())).await;
            let ctx = self.context(handle, term);
            match self
                .workload
                .advance(&ctx, phase, &doc.desired_state, &doc.progress)
                .await
            {
                Ok(transition) => {
                    if transition.next < phase {
                        return Err(Error::PhaseRegression {
                            key: key.to_string(),
                            from: phase.name().to_string(),
                            to: transition.next.name().to_string(),
                        });
                    }
                    doc.phase = transition.next;
                    doc.progress.extend(transition.progress);
                    self.commit(handle, &mut doc, term)?;
                    if doc.phase > phase {
                        if doc.is_terminal() {
                            self.metrics.completed.inc();
                        }
                        self.barriers.hit(BarrierPoint::AfterCommit(doc.phase.name())).await;
                    }
                    failures = 0;
                    backoff = self.backoff();
                }
                Err(WorkloadError::Transient(reason)) => {
                    failures += 1;
                    if failures > self.config.max_transient_retries {
                        return Err(Error::Timeout(format!(
                            "{}: gave up on phase {} after {} attempts: {}",
                            key,
                            phase.name(),
                            failures,
                            reason
                        )));
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        kind = W::KIND,
                        instance = %key,
                        phase = phase.name(),
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient workload error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(WorkloadError::Fatal(reason)) => {
                    error!(
                        kind = W::KIND,
                        instance = %key,
                        phase = phase.name(),
                        reason = %reason,
                        "Workload failed"
                    );
                    doc.phase = W::Phase::failed();
                    doc.failure = Some(reason);
                    self.commit(handle, &mut doc, term)?;
                    self.metrics.failed.inc();
                }
            }
        }
    }

    /// Record a pending forget on a terminal document and mark it collectable.
    async fn finish(&self, handle: &Handle<W>, doc: &mut Doc<W>, term: u64) -> Result<()> {
        if handle.forget_pending() && !doc.forget_requested {
            doc.forget_requested = true;
            self.commit(handle, doc, term)?;
            self.barriers.hit(BarrierPoint::AfterReceivingForget).await;
        }
        if doc.forget_requested && !doc.garbage_collectable {
            let delay = chrono::Duration::from_std(self.config.garbage_collection_delay())
                .map_err(|e| Error::InvalidConfig(e.to_string()))?;
            let expire_at = Utc::now().checked_add_signed(delay).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "garbage collection delay of {}ms is out of range",
                    self.config.garbage_collection_delay_ms
                ))
            })?;
            doc.garbage_collectable = true;
            doc.expire_at = Some(expire_at);
            self.commit(handle, doc, term)?;
            self.metrics.forgotten.inc();
            info!(
                kind = W::KIND,
                instance = %doc.instance_key,
                expire_at = ?doc.expire_at,
                "Marked garbage collectable"
            );
        }
        Ok(())
    }

    /// Majority-durable write of `doc`, then publish it to waiters.
    fn commit(&self, handle: &Handle<W>, doc: &mut Doc<W>, term: u64) -> Result<()> {
        doc.term = term;
        doc.updated_at = Utc::now();
        let committed: &Doc<W> = doc;
        self.node.replicate(term, || self.store.replace(committed))?;
        debug!(
            kind = W::KIND,
            instance = %committed.instance_key,
            phase = committed.phase.name(),
            term,
            "Committed state document"
        );
        handle.publish(committed.clone());
        Ok(())
    }

    fn context(&self, handle: &Handle<W>, term: u64) -> PhaseContext {
        PhaseContext {
            instance_key: handle.key().to_string(),
            term,
            live: handle.live().clone(),
            now: Utc::now(),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            self.config.retry_initial_backoff(),
            self.config.retry_max_backoff(),
        )
    }
}

/// Releases a driver's handle however the driver ends, a panic or an abort
/// included. Unless the driver finished, waiters see the operation abandoned.
struct DriverGuard<'a, W: Workload> {
    coordinator: &'a Coordinator<W>,
    handle: &'a Handle<W>,
    term: u64,
    finished: bool,
}

impl<W: Workload> Drop for DriverGuard<'_, W> {
    fn drop(&mut self) {
        if !self.finished {
            self.coordinator.metrics.abandoned.inc();
            error!(
                kind = W::KIND,
                instance = %self.handle.key(),
                term = self.term,
                "Driver stopped without finishing"
            );
            self.handle.abandon(Abandoned::Storage(format!(
                "{}: driver stopped without finishing",
                self.handle.key()
            )));
        }
        self.coordinator.registry.remove(self.handle);
        self.handle.close();
        self.coordinator.metrics.in_flight.dec();
    }
}

impl<W: Workload> Collectable for Coordinator<W> {
    fn kind(&self) -> &'static str {
        W::KIND
    }

    fn collect_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let term = self.node.primary_term()?;
        let mut deleted = 0;
        for doc in self.store.list()? {
            let expired = doc.garbage_collectable && doc.expire_at.is_some_and(|at| at <= now);
            if !expired || self.registry.contains(&doc.instance_key) {
                continue;
            }
            self.node
                .replicate(term, || self.store.delete(&doc.instance_key))?;
            self.metrics.deleted.inc();
            info!(
                kind = W::KIND,
                instance = %doc.instance_key,
                "Deleted expired state document"
            );
            deleted += 1;
        }
        Ok(deleted)
    }
}

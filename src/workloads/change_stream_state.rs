//! Per-tenant change stream enablement
//!
//! Enabling creates the tenant's change collection and pre-images collection;
//! disabling drops both. A finished toggle with the opposite value is replaced
//! by a new generation, so a tenant can be switched back and forth.

use crate::common::storage::NS_CHANGE_STREAM_STATE;
use crate::common::Result;
use crate::coordinator::document::{Progress, StateDocument, WorkloadPhase};
use crate::coordinator::workload::{
    PhaseContext, TerminalPolicy, Transition, Workload, WorkloadError,
};
use crate::workloads::validate_tenant_id;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStreamStateRequest {
    pub tenant_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStreamPhase {
    Pending,
    Applied,
    Failed,
}

impl WorkloadPhase for ChangeStreamPhase {
    fn initial() -> Self {
        ChangeStreamPhase::Pending
    }

    fn failed() -> Self {
        ChangeStreamPhase::Failed
    }

    fn next(self) -> Option<Self> {
        match self {
            ChangeStreamPhase::Pending => Some(ChangeStreamPhase::Applied),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        !matches!(self, ChangeStreamPhase::Pending)
    }

    fn name(self) -> &'static str {
        match self {
            ChangeStreamPhase::Pending => "pending",
            ChangeStreamPhase::Applied => "applied",
            ChangeStreamPhase::Failed => "failed",
        }
    }
}

/// Storage of a tenant's change collection and pre-images collection
pub trait ChangeCollections: Send + Sync {
    /// Create both collections; succeeds if they already exist.
    fn create_collections(&self, tenant_id: &str) -> std::result::Result<(), WorkloadError>;

    /// Drop both collections; succeeds if they are already gone.
    fn drop_collections(&self, tenant_id: &str) -> std::result::Result<(), WorkloadError>;

    fn exists(&self, tenant_id: &str) -> bool;
}

#[derive(Default)]
struct Collections {
    change: HashSet<String>,
    pre_images: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryChangeCollections {
    inner: Mutex<Collections>,
    failures: Mutex<VecDeque<WorkloadError>>,
}

impl InMemoryChangeCollections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next create/drop call fail with `error`
    pub fn fail_next(&self, error: WorkloadError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn has_pre_images(&self, tenant_id: &str) -> bool {
        self.lock().pre_images.contains(tenant_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collections> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn injected(&self) -> std::result::Result<(), WorkloadError> {
        match self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl ChangeCollections for InMemoryChangeCollections {
    fn create_collections(&self, tenant_id: &str) -> std::result::Result<(), WorkloadError> {
        self.injected()?;
        let mut inner = self.lock();
        inner.change.insert(tenant_id.to_string());
        inner.pre_images.insert(tenant_id.to_string());
        Ok(())
    }

    fn drop_collections(&self, tenant_id: &str) -> std::result::Result<(), WorkloadError> {
        self.injected()?;
        let mut inner = self.lock();
        inner.change.remove(tenant_id);
        inner.pre_images.remove(tenant_id);
        Ok(())
    }

    fn exists(&self, tenant_id: &str) -> bool {
        self.lock().change.contains(tenant_id)
    }
}

pub struct ChangeStreamStateWorkload {
    collections: Arc<dyn ChangeCollections>,
}

impl ChangeStreamStateWorkload {
    pub fn new(collections: Arc<dyn ChangeCollections>) -> Self {
        Self { collections }
    }

    /// Whether change streams are enabled for the tenant as last applied
    pub fn change_stream_state(&self, tenant_id: &str) -> bool {
        self.collections.exists(tenant_id)
    }
}

impl Workload for ChangeStreamStateWorkload {
    type Phase = ChangeStreamPhase;
    type Request = ChangeStreamStateRequest;

    const KIND: &'static str = "change_stream_state";
    const NAMESPACE: &'static str = NS_CHANGE_STREAM_STATE;

    fn validate(&self, request: &Self::Request) -> Result<()> {
        validate_tenant_id(&request.tenant_id)
    }

    fn instance_key(&self, request: &Self::Request) -> String {
        request.tenant_id.clone()
    }

    fn fingerprint_fields(&self, request: &Self::Request) -> serde_json::Value {
        json!({ "enabled": request.enabled })
    }

    fn wait_target(&self, _request: &Self::Request) -> Self::Phase {
        ChangeStreamPhase::Applied
    }

    fn terminal_policy(&self) -> TerminalPolicy {
        TerminalPolicy::Supersede
    }

    async fn advance(
        &self,
        ctx: &PhaseContext,
        phase: Self::Phase,
        request: &Self::Request,
        _progress: &Progress,
    ) -> std::result::Result<Transition<Self::Phase>, WorkloadError> {
        if phase != ChangeStreamPhase::Pending {
            return Err(WorkloadError::Fatal(format!(
                "nothing to do in phase {}",
                phase.name()
            )));
        }
        if request.enabled {
            self.collections.create_collections(&request.tenant_id)?;
        } else {
            self.collections.drop_collections(&request.tenant_id)?;
        }
        tracing::debug!(
            tenant = %request.tenant_id,
            enabled = request.enabled,
            "Applied change stream state"
        );
        Ok(Transition::to(ChangeStreamPhase::Applied).with("appliedAt", ctx.now))
    }

    fn report(
        &self,
        doc: &StateDocument<Self::Phase, Self::Request>,
        _live: &Progress,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut fields = serde_json::Map::new();
        fields.insert("tenantId".into(), json!(doc.desired_state.tenant_id));
        fields.insert("enabled".into(), json!(doc.desired_state.enabled));
        fields.insert("state".into(), json!(doc.phase.name()));
        if let Some(applied_at) = doc.progress_field("appliedAt") {
            fields.insert("appliedAt".into(), applied_at.clone());
        }
        if let Some(reason) = &doc.failure {
            fields.insert("failure".into(), json!(reason));
        }
        fields
    }
}

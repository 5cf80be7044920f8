//! Replica set membership as seen by the coordinator
//!
//! Consensus itself lives outside this crate. A node only needs to know
//! whether it is primary, for which term, and to fence its writes on that
//! term: a write issued in term `t` is accepted only while the node is still
//! primary in `t`.

use crate::common::storage::DocumentBackend;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    Primary,
    Secondary,
}

impl std::fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaRole::Primary => write!(f, "primary"),
            ReplicaRole::Secondary => write!(f, "secondary"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub role: ReplicaRole,
    pub term: u64,
    pub primary: Option<String>,
}

impl ReplicaState {
    pub fn is_primary_in(&self, term: u64) -> bool {
        self.role == ReplicaRole::Primary && self.term == term
    }
}

/// One member of the replica set
pub struct ReplicaNode {
    node_id: String,
    state: watch::Sender<ReplicaState>,
}

impl ReplicaNode {
    pub fn new(node_id: impl Into<String>) -> Self {
        let (state, _rx) = watch::channel(ReplicaState {
            role: ReplicaRole::Secondary,
            term: 0,
            primary: None,
        });
        Self {
            node_id: node_id.into(),
            state,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> ReplicaState {
        self.state.borrow().clone()
    }

    pub fn is_primary(&self) -> bool {
        self.state.borrow().role == ReplicaRole::Primary
    }

    pub fn role(&self) -> ReplicaRole {
        self.state.borrow().role
    }

    pub fn term(&self) -> u64 {
        self.state.borrow().term
    }

    pub fn primary(&self) -> Option<String> {
        self.state.borrow().primary.clone()
    }

    /// Term in which this node may currently accept writes.
    pub fn primary_term(&self) -> Result<u64> {
        let state = self.state.borrow();
        if state.role == ReplicaRole::Primary {
            Ok(state.term)
        } else {
            Err(Error::NotWritablePrimary(
                state.primary.clone().unwrap_or_else(|| "unknown".to_string()),
            ))
        }
    }

    pub fn is_primary_in(&self, term: u64) -> bool {
        self.state.borrow().is_primary_in(term)
    }

    /// Become primary in a term of our own choosing (single-node use).
    pub fn step_up(&self) -> u64 {
        let term = self.term() + 1;
        self.set(ReplicaRole::Primary, term, Some(self.node_id.clone()));
        tracing::info!(node = %self.node_id, term, "Stepped up");
        term
    }

    /// Become primary for `term`, which must be newer than any term seen.
    pub fn step_up_to(&self, term: u64) -> Result<u64> {
        let current = self.term();
        if term <= current {
            return Err(Error::InvalidConfig(format!(
                "cannot step up to term {} (current term {})",
                term, current
            )));
        }
        self.set(ReplicaRole::Primary, term, Some(self.node_id.clone()));
        tracing::info!(node = %self.node_id, term, "Stepped up");
        Ok(term)
    }

    /// Step down to secondary, keeping the current term
    pub fn step_down(&self, primary: Option<String>) {
        let term = self.term();
        self.set(ReplicaRole::Secondary, term, primary);
        tracing::info!(node = %self.node_id, term, "Stepped down");
    }

    /// Learn about a newer term won by another node.
    pub fn observe_term(&self, term: u64, primary: Option<String>) {
        if term > self.term() {
            self.set(ReplicaRole::Secondary, term, primary);
        }
    }

    fn set(&self, role: ReplicaRole, term: u64, primary: Option<String>) {
        self.state.send_replace(ReplicaState {
            role,
            term,
            primary,
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<ReplicaState> {
        self.state.subscribe()
    }

    /// Resolves once this node is no longer primary in `term`.
    pub async fn lost_primary(&self, term: u64) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| !state.is_primary_in(term)).await;
    }

    /// Majority-durable write fenced on `term`.
    ///
    /// The write is refused up front when this node is not primary in `term`.
    /// A term change observed after the write means the acknowledgement cannot
    /// be trusted; the caller gets a retryable error and the next primary
    /// picks up whatever landed.
    pub fn replicate<T>(&self, term: u64, write: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.is_primary_in(term) {
            return Err(Error::NotWritablePrimary(
                self.primary().unwrap_or_else(|| "unknown".to_string()),
            ));
        }

        let out = write()?;

        if !self.is_primary_in(term) {
            return Err(Error::InterruptedDueToReplStateChange(format!(
                "{} left term {} while writing",
                self.node_id, term
            )));
        }
        Ok(out)
    }
}

/// A group of nodes sharing one replicated document backend
pub struct ReplicaSet {
    nodes: Vec<Arc<ReplicaNode>>,
    backend: Arc<dyn DocumentBackend>,
}

impl ReplicaSet {
    pub fn new(node_ids: &[&str], backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            nodes: node_ids
                .iter()
                .map(|id| Arc::new(ReplicaNode::new(*id)))
                .collect(),
            backend,
        }
    }

    pub fn nodes(&self) -> &[Arc<ReplicaNode>] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> Arc<ReplicaNode> {
        self.nodes[idx].clone()
    }

    pub fn backend(&self) -> Arc<dyn DocumentBackend> {
        self.backend.clone()
    }

    pub fn primary(&self) -> Option<Arc<ReplicaNode>> {
        self.nodes.iter().find(|n| n.is_primary()).cloned()
    }

    /// Elect `idx` in a fresh term; every other node becomes secondary.
    pub fn elect(&self, idx: usize) -> Result<u64> {
        let term = self.nodes.iter().map(|n| n.term()).max().unwrap_or(0) + 1;
        let winner = self.nodes[idx].node_id().to_string();
        for (i, node) in self.nodes.iter().enumerate() {
            if i != idx {
                if node.is_primary() {
                    node.step_down(Some(winner.clone()));
                }
                node.observe_term(term, Some(winner.clone()));
            }
        }
        self.nodes[idx].step_up_to(term)
    }
}

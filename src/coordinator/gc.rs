//! Garbage collection of forgotten operations
//!
//! A forgotten operation keeps its state document until `expire_at` passes;
//! the collector then deletes it on the primary.

use crate::common::Result;
use crate::coordinator::replica::ReplicaNode;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A store whose expired documents can be collected
pub trait Collectable: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Delete every garbage collectable document expired at `now`.
    fn collect_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

pub struct GarbageCollector {
    node: Arc<ReplicaNode>,
    collectables: Vec<Arc<dyn Collectable>>,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(node: Arc<ReplicaNode>, interval: Duration) -> Self {
        Self {
            node,
            collectables: Vec::new(),
            interval,
        }
    }

    pub fn register(mut self, collectable: Arc<dyn Collectable>) -> Self {
        self.collectables.push(collectable);
        self
    }

    /// One sweep over every registered store; a no-op on secondaries.
    pub fn collect_once(&self, now: DateTime<Utc>) -> Result<usize> {
        if !self.node.is_primary() {
            return Ok(0);
        }
        let mut deleted = 0;
        for collectable in &self.collectables {
            deleted += collectable.collect_expired(now)?;
        }
        Ok(deleted)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.collect_once(Utc::now()) {
                    Ok(0) => {}
                    Ok(deleted) => tracing::info!(deleted, "Garbage collection sweep"),
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(error = %e, "Garbage collection skipped")
                    }
                    Err(e) => tracing::warn!(error = %e, "Garbage collection failed"),
                }
            }
        })
    }
}

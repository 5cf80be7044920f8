//! Pause points at phase boundaries
//!
//! A driver passes through a barrier unless a test enabled it, in which case
//! it parks until the barrier is disabled (or the driver is cancelled by a
//! step-down). Nothing is enabled outside tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPoint<'a> {
    /// Right after the initial state document became durable
    AfterPersistingStateDoc,
    /// Before the workload action of a phase runs
    BeforeAdvance(&'a str),
    /// Right after the transition into a phase became durable
    AfterCommit(&'a str),
    /// Right after a forget request was durably recorded
    AfterReceivingForget,
}

impl std::fmt::Display for BarrierPoint<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BarrierPoint::AfterPersistingStateDoc => write!(f, "after_persisting_state_doc"),
            BarrierPoint::BeforeAdvance(phase) => write!(f, "before_advance.{}", phase),
            BarrierPoint::AfterCommit(phase) => write!(f, "after_commit.{}", phase),
            BarrierPoint::AfterReceivingForget => write!(f, "after_receiving_forget"),
        }
    }
}

struct BarrierState {
    enabled: watch::Sender<bool>,
    hits: watch::Sender<u64>,
}

impl BarrierState {
    fn new() -> Self {
        Self {
            enabled: watch::channel(false).0,
            hits: watch::channel(0).0,
        }
    }
}

#[derive(Default)]
pub struct Barriers {
    points: Mutex<HashMap<String, Arc<BarrierState>>>,
}

impl Barriers {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, point: BarrierPoint<'_>) -> Arc<BarrierState> {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points
            .entry(point.to_string())
            .or_insert_with(|| Arc::new(BarrierState::new()))
            .clone()
    }

    fn existing(&self, point: BarrierPoint<'_>) -> Option<Arc<BarrierState>> {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points.get(&point.to_string()).cloned()
    }

    pub fn enable(&self, point: BarrierPoint<'_>) {
        self.state(point).enabled.send_replace(true);
    }

    pub fn disable(&self, point: BarrierPoint<'_>) {
        if let Some(state) = self.existing(point) {
            state.enabled.send_replace(false);
        }
    }

    /// Number of drivers that parked on this barrier so far
    pub fn times_entered(&self, point: BarrierPoint<'_>) -> u64 {
        self.existing(point).map_or(0, |s| *s.hits.borrow())
    }

    /// Wait until the barrier has been entered `times` times in total.
    pub async fn wait_for_hits(&self, point: BarrierPoint<'_>, times: u64) {
        let mut rx = self.state(point).hits.subscribe();
        let _ = rx.wait_for(|hits| *hits >= times).await;
    }

    /// Called by drivers; returns immediately unless the barrier is enabled.
    pub async fn hit(&self, point: BarrierPoint<'_>) {
        let Some(state) = self.existing(point) else {
            return;
        };
        let mut enabled = state.enabled.subscribe();
        if !*enabled.borrow_and_update() {
            return;
        }

        tracing::debug!(barrier = %point, "Parked at barrier");
        state.hits.send_modify(|hits| *hits += 1);
        let _ = enabled.wait_for(|on| !*on).await;
        tracing::debug!(barrier = %point, "Released from barrier");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_disabled_barrier_passes_through() {
        let barriers = Barriers::new();
        tokio::time::timeout(
            Duration::from_millis(100),
            barriers.hit(BarrierPoint::BeforeAdvance("pending")),
        )
        .await
        .unwrap();
        assert_eq!(
            barriers.times_entered(BarrierPoint::BeforeAdvance("pending")),
            0
        );
    }

    #[tokio::test]
    async fn test_enabled_barrier_parks_until_disabled() {
        let barriers = Arc::new(Barriers::new());
        let point = BarrierPoint::AfterCommit("started");
        barriers.enable(point);

        let parked = {
            let barriers = barriers.clone();
            tokio::spawn(async move { barriers.hit(BarrierPoint::AfterCommit("started")).await })
        };

        barriers.wait_for_hits(point, 1).await;
        assert!(!parked.is_finished());

        barriers.disable(point);
        tokio::time::timeout(Duration::from_secs(1), parked)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Change stream enablement through the coordinator

mod common;

use common::{change_stream_request, eventually, test_config, Cluster, OTHER_TENANT, TENANT};
use futures_util::future::join_all;
use minicoord::common::MemBackend;
use minicoord::coordinator::{BarrierPoint, Coordinator, ReplicaNode, WorkloadError};
use minicoord::workloads::{ChangeCollections, ChangeStreamPhase, ChangeStreamStateWorkload};
use minicoord::Error;
use std::sync::Arc;
use std::time::Duration;

/// Collections whose catalog crashes on every change
struct CrashingCollections;

impl ChangeCollections for CrashingCollections {
    fn create_collections(&self, tenant_id: &str) -> Result<(), WorkloadError> {
        panic!("catalog crashed creating collections for {tenant_id}")
    }

    fn drop_collections(&self, tenant_id: &str) -> Result<(), WorkloadError> {
        panic!("catalog crashed dropping collections for {tenant_id}")
    }

    fn exists(&self, _tenant_id: &str) -> bool {
        false
    }
}

#[tokio::test]
async fn test_enable_creates_collections() {
    let cluster = Cluster::new();
    let coord = &cluster.change_streams[0];

    let report = coord
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap();

    assert_eq!(report.kind, "change_stream_state");
    assert_eq!(report.phase, "applied");
    assert_eq!(report.generation, 1);
    assert_eq!(report.fields["enabled"], true);
    assert!(report.has_field("appliedAt"));
    assert!(cluster.collections.has_pre_images(TENANT));
    assert!(coord.workload().change_stream_state(TENANT));
    assert_eq!(coord.metrics().started.get(), 1);
    assert_eq!(coord.metrics().completed.get(), 1);
}

#[tokio::test]
async fn test_identical_requests_share_one_operation() {
    let cluster = Cluster::new();
    let coord = cluster.change_streams[0].clone();
    let point = BarrierPoint::AfterPersistingStateDoc;
    cluster.barriers.enable(point);

    let first = tokio::spawn({
        let coord = coord.clone();
        async move { coord.start(change_stream_request(TENANT, true)).await }
    });
    cluster.barriers.wait_for_hits(point, 1).await;

    let second = tokio::spawn({
        let coord = coord.clone();
        async move { coord.start(change_stream_request(TENANT, true)).await }
    });
    eventually("second request to join", || coord.metrics().joined.get() == 1).await;

    cluster.barriers.disable(point);
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first.generation, second.generation);
    assert_eq!(first.phase, "applied");
    assert_eq!(second.phase, "applied");
    assert_eq!(coord.metrics().started.get(), 1);
}

#[tokio::test]
async fn test_burst_of_identical_requests() {
    let cluster = Cluster::new();
    let coord = &cluster.change_streams[0];

    let results =
        join_all((0..8).map(|_| coord.start(change_stream_request(TENANT, true)))).await;

    for result in results {
        let report = result.unwrap();
        assert_eq!(report.phase, "applied");
        assert_eq!(report.generation, 1);
    }
    assert_eq!(coord.metrics().started.get(), 1);
}

#[tokio::test]
async fn test_different_request_conflicts_while_in_flight() {
    let cluster = Cluster::new();
    let coord = cluster.change_streams[0].clone();
    let point = BarrierPoint::BeforeAdvance("pending");
    cluster.barriers.enable(point);

    let enable = tokio::spawn({
        let coord = coord.clone();
        async move { coord.start(change_stream_request(TENANT, true)).await }
    });
    cluster.barriers.wait_for_hits(point, 1).await;

    let err = coord
        .start(change_stream_request(TENANT, false))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConflictingOperationInProgress(_)));
    assert_eq!(coord.metrics().conflicts.get(), 1);

    cluster.barriers.disable(point);
    let report = enable.await.unwrap().unwrap();
    assert_eq!(report.fields["enabled"], true);
    assert!(cluster.collections.has_pre_images(TENANT));
}

#[tokio::test]
async fn test_distinct_tenants_proceed_independently() {
    let cluster = Cluster::new();
    let coord = cluster.change_streams[0].clone();
    let point = BarrierPoint::BeforeAdvance("pending");
    cluster.barriers.enable(point);

    let first = tokio::spawn({
        let coord = coord.clone();
        async move { coord.start(change_stream_request(TENANT, true)).await }
    });
    let second = tokio::spawn({
        let coord = coord.clone();
        async move { coord.start(change_stream_request(OTHER_TENANT, true)).await }
    });

    // Both drivers are parked at the same time.
    cluster.barriers.wait_for_hits(point, 2).await;
    assert_eq!(coord.current_op().len(), 2);

    cluster.barriers.disable(point);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert!(cluster.collections.has_pre_images(TENANT));
    assert!(cluster.collections.has_pre_images(OTHER_TENANT));
}

#[tokio::test]
async fn test_toggle_supersedes_finished_generation() {
    let cluster = Cluster::new();
    let coord = &cluster.change_streams[0];

    let enabled = coord
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap();
    let disabled = coord
        .start(change_stream_request(TENANT, false))
        .await
        .unwrap();
    let reenabled = coord
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap();

    assert_eq!(enabled.generation, 1);
    assert_eq!(disabled.generation, 2);
    assert_eq!(reenabled.generation, 3);
    assert!(coord.workload().change_stream_state(TENANT));

    // Repeating the last request returns its result without a new generation.
    let repeated = coord
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap();
    assert_eq!(repeated.generation, 3);
    assert_eq!(coord.metrics().started.get(), 3);
}

#[tokio::test]
async fn test_interrupted_toggle_resumes_on_new_primary() {
    let cluster = Cluster::new();
    let point = BarrierPoint::BeforeAdvance("pending");
    cluster.barriers.enable(point);

    let interrupted = tokio::spawn({
        let coord = cluster.change_streams[0].clone();
        async move { coord.start(change_stream_request(TENANT, true)).await }
    });
    cluster.barriers.wait_for_hits(point, 1).await;

    cluster.elect(1);
    let err = interrupted.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::InterruptedDueToReplStateChange(_)));
    assert!(err.is_retryable());
    assert!(!cluster.collections.has_pre_images(TENANT));

    cluster.barriers.disable(point);
    let new_primary = &cluster.change_streams[1];
    eventually("toggle to be applied on the new primary", || {
        new_primary
            .document(TENANT)
            .unwrap()
            .is_some_and(|doc| doc.phase == ChangeStreamPhase::Applied)
    })
    .await;

    let doc = new_primary.document(TENANT).unwrap().unwrap();
    assert_eq!(doc.num_restarts, 1);
    assert_eq!(doc.term, 2);
    assert!(cluster.collections.has_pre_images(TENANT));

    let report = new_primary
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap();
    assert_eq!(report.generation, 1);
    assert_eq!(report.phase, "applied");
}

#[tokio::test]
async fn test_secondary_rejects_start() {
    let cluster = Cluster::new();
    let err = cluster.change_streams[2]
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotWritablePrimary(_)));
}

#[tokio::test]
async fn test_invalid_tenant_rejected_before_persisting() {
    let cluster = Cluster::new();
    let coord = &cluster.change_streams[0];
    for tenant in ["", "tenantA", "636d957b2646ddfaf9b5e13z"] {
        let err = coord
            .start(change_stream_request(tenant, true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadValue(_)), "{tenant}");
    }
    assert!(coord.current_op().is_empty());
    assert_eq!(coord.metrics().started.get(), 0);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let cluster = Cluster::new();
    cluster
        .collections
        .fail_next(WorkloadError::Transient("catalog busy".into()));
    cluster
        .collections
        .fail_next(WorkloadError::Transient("catalog busy".into()));

    let report = cluster.change_streams[0]
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap();
    assert_eq!(report.phase, "applied");
    assert!(cluster.collections.has_pre_images(TENANT));
}

#[tokio::test]
async fn test_exhausted_retries_leave_operation_resumable() {
    let cluster = Cluster::new();
    let coord = &cluster.change_streams[0];
    for _ in 0..4 {
        cluster
            .collections
            .fail_next(WorkloadError::Transient("catalog busy".into()));
    }

    let err = coord
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    let doc = coord.document(TENANT).unwrap().unwrap();
    assert_eq!(doc.phase, ChangeStreamPhase::Pending);

    let report = coord
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap();
    assert_eq!(report.phase, "applied");
    assert_eq!(coord.metrics().resumed.get(), 1);
}

#[tokio::test]
async fn test_fatal_error_is_recorded_and_superseded() {
    let cluster = Cluster::new();
    let coord = &cluster.change_streams[0];
    cluster
        .collections
        .fail_next(WorkloadError::Fatal("tenant is being dropped".into()));

    let err = coord
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap_err();
    match err {
        Error::WorkloadFailed { key, reason } => {
            assert_eq!(key, TENANT);
            assert_eq!(reason, "tenant is being dropped");
        }
        other => panic!("unexpected error: {other}"),
    }
    let report = coord.query(TENANT).unwrap();
    assert_eq!(report.phase, "failed");
    assert_eq!(report.fields["failure"], "tenant is being dropped");
    assert_eq!(coord.metrics().failed.get(), 1);

    let report = coord
        .start(change_stream_request(TENANT, false))
        .await
        .unwrap();
    assert_eq!(report.phase, "applied");
    assert_eq!(report.generation, 2);
}

#[tokio::test]
async fn test_panicking_driver_releases_its_handle() {
    let node = Arc::new(ReplicaNode::new("node-1"));
    node.step_up();
    let coord = Coordinator::new(
        ChangeStreamStateWorkload::new(Arc::new(CrashingCollections)),
        node,
        Arc::new(MemBackend::new()),
        test_config(),
    );

    for _ in 0..2 {
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            coord.start(change_stream_request(TENANT, true)),
        )
        .await
        .expect("start must not hang")
        .unwrap_err();
        assert!(matches!(err, Error::Internal(_)), "{err}");

        eventually("the crashed driver to release its handle", || {
            coord.current_op().is_empty() && coord.metrics().in_flight.get() == 0
        })
        .await;
    }

    assert_eq!(coord.metrics().abandoned.get(), 2);
    let doc = coord.document(TENANT).unwrap().unwrap();
    assert_eq!(doc.phase, ChangeStreamPhase::Pending);
}

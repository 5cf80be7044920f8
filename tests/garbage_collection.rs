//! Deletion of forgotten operations after their retention window

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{change_stream_request, eventually, migration_request, test_config, Cluster, TENANT};
use minicoord::common::MemBackend;
use minicoord::coordinator::{Coordinator, GarbageCollector, ReplicaNode};
use minicoord::workloads::{ChangeStreamStateWorkload, InMemoryChangeCollections};
use minicoord::Error;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_expired_documents_are_deleted() {
    let cluster = Cluster::new();
    let coord = cluster.migrations[0].clone();
    let request = migration_request();
    let id = request.migration_id.to_string();
    coord.start(request.clone()).await.unwrap();
    coord.forget(&id).await.unwrap();

    let gc = GarbageCollector::new(cluster.node(0), Duration::from_secs(60)).register(coord.clone());

    // Not yet expired.
    let before = Utc::now() - ChronoDuration::hours(1);
    assert_eq!(gc.collect_once(before).unwrap(), 0);

    let later = Utc::now() + ChronoDuration::seconds(1);
    eventually("the forgotten document to be deleted", || {
        gc.collect_once(later).unwrap() == 1
    })
    .await;

    assert!(coord.document(&id).unwrap().is_none());
    assert!(matches!(coord.query(&id), Err(Error::NotFound(_))));
    assert!(coord.current_op().is_empty());
    assert_eq!(coord.metrics().deleted.get(), 1);

    // A late forget of the deleted operation succeeds without recreating it.
    coord.forget(&id).await.unwrap();
    assert!(coord.document(&id).unwrap().is_none());

    // The id is free again.
    let report = coord.start(request).await.unwrap();
    assert_eq!(report.generation, 1);
    assert_eq!(report.phase, "consistent");
}

#[tokio::test]
async fn test_unforgotten_documents_are_kept() {
    let cluster = Cluster::new();
    let coord = cluster.change_streams[0].clone();
    coord
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap();

    let gc = GarbageCollector::new(cluster.node(0), Duration::from_secs(60)).register(coord.clone());
    let far_future = Utc::now() + ChronoDuration::days(365);
    assert_eq!(gc.collect_once(far_future).unwrap(), 0);
    assert!(coord.document(TENANT).unwrap().is_some());
}

#[tokio::test]
async fn test_secondaries_do_not_collect() {
    let cluster = Cluster::new();
    let coord = cluster.migrations[0].clone();
    let request = migration_request();
    let id = request.migration_id.to_string();
    coord.start(request).await.unwrap();
    coord.forget(&id).await.unwrap();

    let gc = GarbageCollector::new(cluster.node(1), Duration::from_secs(60))
        .register(cluster.migrations[1].clone());
    let later = Utc::now() + ChronoDuration::seconds(1);
    assert_eq!(gc.collect_once(later).unwrap(), 0);
    assert!(coord.document(&id).unwrap().is_some());
}

#[tokio::test]
async fn test_background_collector_sweeps() {
    let cluster = Cluster::new();
    let coord = cluster.migrations[0].clone();
    let request = migration_request();
    let id = request.migration_id.to_string();
    coord.start(request).await.unwrap();

    let sweeper = GarbageCollector::new(cluster.node(0), Duration::from_millis(10))
        .register(coord.clone())
        .register(cluster.change_streams[0].clone())
        .spawn();

    coord.forget(&id).await.unwrap();
    eventually("the background sweep to delete the document", || {
        coord.document(&id).unwrap().is_none()
    })
    .await;
    sweeper.abort();
}

#[tokio::test]
async fn test_out_of_range_retention_fails_forget() {
    let node = Arc::new(ReplicaNode::new("node-1"));
    node.step_up();
    let mut config = test_config();
    config.garbage_collection_delay_ms = 10_u64.pow(16);
    let coord = Coordinator::new(
        ChangeStreamStateWorkload::new(Arc::new(InMemoryChangeCollections::new())),
        node,
        Arc::new(MemBackend::new()),
        config,
    );
    coord
        .start(change_stream_request(TENANT, true))
        .await
        .unwrap();

    for _ in 0..2 {
        let err = tokio::time::timeout(Duration::from_secs(2), coord.forget(TENANT))
            .await
            .expect("forget must not hang")
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)), "{err}");
    }

    eventually("the failed driver to release its handle", || {
        coord.current_op().is_empty() && coord.metrics().in_flight.get() == 0
    })
    .await;
    let doc = coord.document(TENANT).unwrap().unwrap();
    assert!(doc.forget_requested);
    assert!(!doc.garbage_collectable);
}

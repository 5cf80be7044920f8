//! Shared harness: a three-node replica set over one replicated backend

#![allow(dead_code)]

use minicoord::common::storage::DocumentBackend;
use minicoord::common::{CoordinatorConfig, MemBackend};
use minicoord::coordinator::{Barriers, Coordinator, ReplicaNode, ReplicaSet};
use minicoord::workloads::{
    ChangeStreamStateRequest, ChangeStreamStateWorkload, ConnectionString,
    InMemoryChangeCollections, InMemoryDonor, MigrationProtocol, MigrationRecipientWorkload,
    RecipientSyncRequest, Timestamp,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const RECIPIENT: &str = "recipient/r1:27017,r2:27017,r3:27017";
pub const DONOR: &str = "donor/d1:27017,d2:27017";
pub const TENANT: &str = "636d957b2646ddfaf9b5e13f";
pub const OTHER_TENANT: &str = "636d957b2646ddfaf9b5e140";

pub type Migrations = Arc<Coordinator<MigrationRecipientWorkload>>;
pub type ChangeStreams = Arc<Coordinator<ChangeStreamStateWorkload>>;

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        garbage_collection_delay_ms: 0,
        gc_interval_ms: 10,
        max_transient_retries: 3,
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 5,
        oplog_apply_interval_ms: 5,
    }
}

pub struct Cluster {
    pub set: ReplicaSet,
    pub barriers: Arc<Barriers>,
    pub donor: Arc<InMemoryDonor>,
    pub collections: Arc<InMemoryChangeCollections>,
    pub migrations: Vec<Migrations>,
    pub change_streams: Vec<ChangeStreams>,
}

impl Cluster {
    /// Three nodes over an in-memory backend, node 0 primary in term 1.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MemBackend::new()))
    }

    pub fn with_backend(backend: Arc<dyn DocumentBackend>) -> Self {
        let cluster = Self::unelected(backend);
        cluster.set.elect(0).unwrap();
        cluster
    }

    /// Nodes are wired but all still secondaries.
    pub fn unelected(backend: Arc<dyn DocumentBackend>) -> Self {
        let set = ReplicaSet::new(&["node-1", "node-2", "node-3"], backend);
        let barriers = Arc::new(Barriers::new());
        let donor = Arc::new(InMemoryDonor::new(vec![
            "collection-1.wt".to_string(),
            "index-1.wt".to_string(),
        ]));
        let collections = Arc::new(InMemoryChangeCollections::new());

        let mut migrations = Vec::new();
        let mut change_streams = Vec::new();
        for node in set.nodes() {
            let migration = Coordinator::with_barriers(
                MigrationRecipientWorkload::new(
                    ConnectionString::parse(RECIPIENT).unwrap(),
                    donor.clone(),
                    Duration::from_millis(5),
                ),
                node.clone(),
                set.backend(),
                test_config(),
                barriers.clone(),
            );
            let change_stream = Coordinator::with_barriers(
                ChangeStreamStateWorkload::new(collections.clone()),
                node.clone(),
                set.backend(),
                test_config(),
                barriers.clone(),
            );
            migration.run();
            change_stream.run();
            migrations.push(migration);
            change_streams.push(change_stream);
        }

        Self {
            set,
            barriers,
            donor,
            collections,
            migrations,
            change_streams,
        }
    }

    pub fn node(&self, idx: usize) -> Arc<ReplicaNode> {
        self.set.node(idx)
    }

    pub fn elect(&self, idx: usize) -> u64 {
        self.set.elect(idx).unwrap()
    }
}

pub fn migration_request() -> RecipientSyncRequest {
    RecipientSyncRequest {
        migration_id: Uuid::new_v4(),
        protocol: MigrationProtocol::MultitenantMigrations,
        tenant_id: Some("tenantA".to_string()),
        donor_connection_string: DONOR.to_string(),
        start_migration_donor_timestamp: Timestamp::new(1_700_000_000, 1),
        read_preference: Default::default(),
        return_after_reaching_donor_timestamp: None,
        recipient_certificate_for_donor: None,
    }
}

pub fn change_stream_request(tenant: &str, enabled: bool) -> ChangeStreamStateRequest {
    ChangeStreamStateRequest {
        tenant_id: tenant.to_string(),
        enabled,
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

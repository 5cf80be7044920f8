//! Node server: one replica set member with both coordinators

use crate::common::storage::{open_backend, DocumentBackend};
use crate::common::{Config, Result};
use crate::coordinator::gc::GarbageCollector;
use crate::coordinator::http::{create_router, NodeState};
use crate::coordinator::replica::ReplicaNode;
use crate::coordinator::service::Coordinator;
use crate::workloads::{
    ChangeStreamStateWorkload, ConnectionString, InMemoryChangeCollections, InMemoryDonor,
    MigrationRecipientWorkload,
};
use std::sync::Arc;

pub struct Node {
    config: Config,
}

impl Node {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Wire the replica node, both coordinators and their background tasks.
    pub fn build(&self, backend: Arc<dyn DocumentBackend>) -> Result<NodeState> {
        let node = Arc::new(ReplicaNode::new(self.config.node_id.clone()));
        let coordinator = &self.config.coordinator;
        let recipient = ConnectionString::parse(&self.config.node.connection_string())?;

        let migrations = Coordinator::new(
            MigrationRecipientWorkload::new(
                recipient,
                Arc::new(InMemoryDonor::new(Vec::new())),
                coordinator.oplog_apply_interval(),
            ),
            node.clone(),
            backend.clone(),
            coordinator.clone(),
        );
        let change_streams = Coordinator::new(
            ChangeStreamStateWorkload::new(Arc::new(InMemoryChangeCollections::new())),
            node.clone(),
            backend,
            coordinator.clone(),
        );

        migrations.run();
        change_streams.run();
        GarbageCollector::new(node.clone(), coordinator.gc_interval())
            .register(migrations.clone())
            .register(change_streams.clone())
            .spawn();

        Ok(NodeState {
            node,
            migrations,
            change_streams,
        })
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting minicoord node: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", self.config.node.bind_addr);
        tracing::info!("  DB path: {}", self.config.node.db_path.display());
        tracing::info!("  Backend: {:?}", self.config.node.backend);
        tracing::info!("  Replica set: {}", self.config.node.connection_string());

        let backend = open_backend(self.config.node.backend, &self.config.node.db_path)?;
        let state = self.build(backend.clone())?;
        if self.config.node.start_as_primary {
            state.node.step_up();
        }

        let listener = tokio::net::TcpListener::bind(self.config.node.bind_addr).await?;
        tracing::info!(
            "Node ready ({} in term {})",
            state.node.role(),
            state.node.term()
        );

        axum::serve(listener, create_router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        backend.flush()?;
        tracing::info!("Node stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

//! Durable resumable coordination
//!
//! The coordinator is responsible for:
//! - Request admission (join identical requests, reject conflicting ones)
//! - Driving workload phases, each made majority-durable before it is visible
//! - Resuming unfinished operations when a node becomes primary
//! - Forget and garbage collection of finished operations

pub mod barrier;
pub mod document;
pub mod gc;
pub mod http;
pub mod registry;
pub mod replica;
pub mod reporter;
pub mod server;
pub mod service;
pub mod store;
pub mod workload;

pub use barrier::{BarrierPoint, Barriers};
pub use document::{Fingerprint, Progress, StateDocument, WorkloadPhase};
pub use gc::{Collectable, GarbageCollector};
pub use replica::{ReplicaNode, ReplicaRole, ReplicaSet, ReplicaState};
pub use reporter::OperationReport;
pub use server::Node;
pub use service::Coordinator;
pub use store::DocumentCollection;
pub use workload::{PhaseContext, TerminalPolicy, Transition, Workload, WorkloadError};

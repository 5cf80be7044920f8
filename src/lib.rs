//! # minicoord
//!
//! Durable, resumable coordination of long-running operations on a
//! primary-driven replica set:
//! - Every phase transition is majority-durable before it becomes visible
//! - Identical concurrent requests join, different ones conflict
//! - A new primary resumes unfinished operations from their last durable phase
//! - Finished operations are forgotten explicitly and collected after a retention window
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HTTP API (axum)                              │
//! └───────────┬──────────────────────┬───────────┘
//!             │                      │
//! ┌───────────▼──────────┐ ┌─────────▼────────────┐
//! │ Coordinator          │ │ Coordinator          │
//! │ (migration recipient)│ │ (change stream state)│
//! │  registry + drivers  │ │  registry + drivers  │
//! └───────────┬──────────┘ └─────────┬────────────┘
//!             │ replicate(term, ..)  │
//! ┌───────────▼──────────────────────▼───────────┐
//! │ State document store (memory / RocksDB / sled)│
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! minicoord-node serve \
//!   --id node-1 \
//!   --bind 0.0.0.0:7000 \
//!   --db ./node-data \
//!   --set-name recipient \
//!   --hosts localhost:7000 \
//!   --primary
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Start a migration and wait until the recipient is consistent
//! minicoord sync-data --migration-id <uuid> --donor donor/d1:27017 \
//!   --protocol multitenant_migrations --tenant tenantA --start-ts 1700000000
//!
//! # Inspect and forget it
//! minicoord status <uuid>
//! minicoord forget <uuid>
//!
//! # Toggle change streams for a tenant
//! minicoord set-change-stream 636d957b2646ddfaf9b5e13f --enabled true
//! minicoord current-op
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod workloads;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, Node, OperationReport};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

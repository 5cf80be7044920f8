//! Common utilities and types shared across minicoord

pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod tracing_middleware;
pub mod utils;

pub use config::{BackendKind, Config, CoordinatorConfig, NodeConfig};
pub use error::{Error, Result};
pub use metrics::CoordinatorMetrics;
pub use storage::{DocumentBackend, MemBackend, RocksBackend};
pub use utils::{parse_duration, validate_instance_key, Backoff};

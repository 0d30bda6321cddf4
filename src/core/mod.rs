// Infrastructure shared by the coordinator, the executor and the pool façade

pub mod config;
pub mod errors;

// Re-export commonly used types
pub use config::{ClusterConfig, ClusterConfigBuilder, DEFAULT_RESULT_ADDRESS, DEFAULT_WORK_ADDRESS};
pub use errors::{PoolError, RemoteError, RemoteErrorKind, Result};

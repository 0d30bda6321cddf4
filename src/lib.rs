//! Distributed parallel map.
//!
//! A coordinator hands chunks of work to any number of executors over TCP
//! and a `Pool` on the client side exposes the familiar `map`, `starmap` and
//! `apply` calls, their background variants and lazy `imap` streams.
//!
//! ```ignore
//! use distripool::{make_coordinator, remote_fn, ClusterConfig, Pool};
//! use serde_json::json;
//!
//! #[remote_fn]
//! fn square(x: i64) -> i64 {
//!     x * x
//! }
//!
//! # async fn run() -> distripool::Result<()> {
//! make_coordinator(&ClusterConfig::default()).await?;
//! let pool = Pool::new()?;
//! let squares = pool.map("square", (0..10).map(|i| json!(i)), None).await?;
//! pool.terminate()?;
//! # Ok(())
//! # }
//! ```

extern crate self as distripool;

pub mod coord;
pub mod core;
pub mod executor;
pub mod pool;
pub mod protocol;

pub use coord::{
    default_coordinator, make_coordinator, make_coordinator_in, Coordinator, CoordinatorLease,
    CoordinatorRegistry,
};
pub use crate::core::config::{
    ClusterConfig, ClusterConfigBuilder, DEFAULT_RESULT_ADDRESS, DEFAULT_WORK_ADDRESS,
};
pub use crate::core::errors::{PoolError, RemoteError, RemoteErrorKind, Result};
pub use executor::{make_executor, Executor, ExecutorState, FunctionRegistry, RemoteFn};
pub use pool::{AsyncResult, Callbacks, Pool, PoolOptions, PoolState, ResultStream};
pub use protocol::{FuncRef, MapMode, PoolConfig};

pub use distripool_macros::remote_fn;
pub use linkme;

#[doc(hidden)]
pub mod __private {
    pub use anyhow;
    pub use serde_json::Value;
}

/// Install a `tracing` subscriber printing to stderr at `level`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing(level: tracing::Level) {
    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
}

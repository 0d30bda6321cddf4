//! Worker side of the cluster: the executor node, its local pool and the
//! registry of callables it can run

pub mod executor;
pub mod functions;
pub mod local_pool;

pub use executor::{make_executor, Executor, ExecutorState};
pub use functions::{FnRemote, FunctionRegistry, RemoteFn, REMOTE_FNS};
pub use local_pool::{Initializer, LocalPool};
